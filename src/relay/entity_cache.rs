//! Per-requester dialog cache with single-flight population.
//!
//! Private references can only be resolved through the requester's own dialog
//! list, and listing dialogs is the most rate-limited upstream call in the
//! pipeline. The cache holds one dialog map per requester behind an async
//! once-cell: concurrent first accesses await a single upstream load, and a
//! failed load leaves the cell empty so the next access retries.

use crate::client::{MessengerClient, PeerHandle, PeerMap};
use crate::error::Result;
use crate::types::{ChatRef, RequesterId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::debug;

use super::MediaRelay;

pub(crate) struct EntityCache {
    cells: Mutex<HashMap<RequesterId, Arc<OnceCell<Arc<PeerMap>>>>>,
}

impl EntityCache {
    pub(crate) fn new() -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
        }
    }

    /// The requester's dialog map, loading it on first access.
    pub(crate) async fn peers(
        &self,
        client: &Arc<dyn MessengerClient>,
        requester: RequesterId,
    ) -> Result<Arc<PeerMap>> {
        let cell = {
            let mut cells = self.cells.lock().await;
            cells.entry(requester).or_default().clone()
        };

        let peers = cell
            .get_or_try_init(|| async {
                debug!(requester = requester.0, "Loading dialog map");
                client.load_peers(requester).await.map(Arc::new)
            })
            .await?;

        Ok(Arc::clone(peers))
    }

    /// Drop every cached dialog map. Returns how many were dropped.
    pub(crate) async fn clear(&self) -> usize {
        let mut cells = self.cells.lock().await;
        let dropped = cells.len();
        cells.clear();
        dropped
    }

    /// Drop one requester's cached dialog map, if present.
    pub(crate) async fn forget(&self, requester: RequesterId) -> bool {
        self.cells.lock().await.remove(&requester).is_some()
    }
}

impl MediaRelay {
    /// Resolve a chat reference to a peer handle on behalf of a requester.
    ///
    /// Public references resolve directly; private references go through the
    /// requester's cached dialog map. `Ok(None)` means the dialog map loaded
    /// but does not contain the chat - the requester cannot see it.
    pub(crate) async fn resolve_peer(
        &self,
        requester: RequesterId,
        chat: &ChatRef,
    ) -> Result<Option<PeerHandle>> {
        match chat {
            ChatRef::Public(handle) => Ok(Some(PeerHandle::Public(handle.clone()))),
            ChatRef::Private(chat_id) => {
                let peers = self.entities.peers(&self.client, requester).await?;
                Ok(peers.get(chat_id).cloned())
            }
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::super::test_support::ScriptedMessenger;
    use super::*;
    use std::sync::atomic::Ordering;

    fn client_with_one_peer(requester: RequesterId) -> Arc<ScriptedMessenger> {
        let client = ScriptedMessenger::new();
        client.add_private_peer(requester, -100123456789, 777);
        Arc::new(client)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_accesses_load_dialogs_exactly_once() {
        let requester = RequesterId::new(42);
        let client = client_with_one_peer(requester);
        // Slow the load down so all tasks overlap inside the once-cell
        client
            .peer_load_delay_ms
            .store(30, Ordering::SeqCst);
        let cache = Arc::new(EntityCache::new());
        let dyn_client: Arc<dyn MessengerClient> = client.clone();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let dyn_client = Arc::clone(&dyn_client);
            handles.push(tokio::spawn(async move {
                cache.peers(&dyn_client, requester).await
            }));
        }
        for handle in handles {
            let peers = handle.await.unwrap().unwrap();
            assert!(peers.contains_key(&-100123456789));
        }

        assert_eq!(
            client.peer_loads.load(Ordering::SeqCst),
            1,
            "eight concurrent resolutions must share one upstream load"
        );
    }

    #[tokio::test]
    async fn failed_load_is_retried_on_next_access() {
        let requester = RequesterId::new(7);
        let client = client_with_one_peer(requester);
        client.fail_next_peer_loads.store(1, Ordering::SeqCst);
        let cache = EntityCache::new();
        let dyn_client: Arc<dyn MessengerClient> = client.clone();

        assert!(
            cache.peers(&dyn_client, requester).await.is_err(),
            "scripted session failure must surface"
        );
        let peers = cache
            .peers(&dyn_client, requester)
            .await
            .expect("second access should retry the load");
        assert!(peers.contains_key(&-100123456789));
        assert_eq!(
            client.peer_loads.load(Ordering::SeqCst),
            2,
            "one failed load plus one successful retry"
        );
    }

    #[tokio::test]
    async fn distinct_requesters_get_distinct_maps() {
        let alice = RequesterId::new(1);
        let bob = RequesterId::new(2);
        let client = ScriptedMessenger::new();
        client.add_private_peer(alice, -1001, 11);
        client.add_private_peer(bob, -1002, 22);
        let client = Arc::new(client);
        let cache = EntityCache::new();
        let dyn_client: Arc<dyn MessengerClient> = client.clone();

        let alice_peers = cache.peers(&dyn_client, alice).await.unwrap();
        let bob_peers = cache.peers(&dyn_client, bob).await.unwrap();

        assert!(alice_peers.contains_key(&-1001));
        assert!(!alice_peers.contains_key(&-1002));
        assert!(bob_peers.contains_key(&-1002));
        assert_eq!(client.peer_loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn forget_causes_a_fresh_load() {
        let requester = RequesterId::new(9);
        let client = client_with_one_peer(requester);
        let cache = EntityCache::new();
        let dyn_client: Arc<dyn MessengerClient> = client.clone();

        cache.peers(&dyn_client, requester).await.unwrap();
        assert!(cache.forget(requester).await);
        assert!(!cache.forget(requester).await, "second forget finds nothing");
        cache.peers(&dyn_client, requester).await.unwrap();

        assert_eq!(client.peer_loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn clear_reports_dropped_count() {
        let client = ScriptedMessenger::new();
        client.add_private_peer(RequesterId::new(1), -1001, 1);
        client.add_private_peer(RequesterId::new(2), -1002, 2);
        let client = Arc::new(client);
        let cache = EntityCache::new();
        let dyn_client: Arc<dyn MessengerClient> = client.clone();

        cache.peers(&dyn_client, RequesterId::new(1)).await.unwrap();
        cache.peers(&dyn_client, RequesterId::new(2)).await.unwrap();

        assert_eq!(cache.clear().await, 2);
        assert_eq!(cache.clear().await, 0, "already empty");
    }
}
