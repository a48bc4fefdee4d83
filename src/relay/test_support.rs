//! Scripted messenger and relay builders shared by the relay tests.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::broadcast;

use crate::client::{
    MediaDelivery, MediaFilter, MediaFraming, MessengerClient, PeerHandle, PeerMap, RemoteItem,
    RemoteMedia,
};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::store::JsonGrantStore;
use crate::types::{Event, MediaKind, MessageId, RequesterId, VideoMeta};

use super::MediaRelay;

/// Admin subject used by every test relay.
pub(crate) const TEST_ADMIN: RequesterId = RequesterId(1000);

/// Timeline key: a peer stripped of its access hash, so items registered by
/// chat id in tests line up with whatever peer resolution produced.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum ChatKey {
    Private(i64),
    Public(String),
}

impl ChatKey {
    fn of(peer: &PeerHandle) -> Self {
        match peer {
            PeerHandle::Private { chat_id, .. } => ChatKey::Private(*chat_id),
            PeerHandle::Public(handle) => ChatKey::Public(handle.clone()),
        }
    }
}

/// One successful send_media call, captured before the spool is cleaned up.
#[derive(Clone, Debug)]
pub(crate) struct DeliveryRecord {
    pub(crate) requester: RequesterId,
    pub(crate) payload: PathBuf,
    pub(crate) caption: Option<String>,
    pub(crate) streaming: bool,
    pub(crate) thumbnail: bool,
}

/// In-memory messenger with per-test scripting knobs.
///
/// Timelines hold the items each chat can serve; atomic countdowns script
/// rate limits and hard failures into individual calls; every outbound call
/// is recorded so tests can assert on ordering and content.
pub(crate) struct ScriptedMessenger {
    dialogs: StdMutex<HashMap<RequesterId, PeerMap>>,
    timelines: StdMutex<HashMap<ChatKey, Vec<RemoteItem>>>,

    /// Calls to load_peers, including scripted failures
    pub(crate) peer_loads: AtomicU32,
    /// Artificial latency inside load_peers, in milliseconds
    pub(crate) peer_load_delay_ms: AtomicU64,
    /// Next N load_peers calls fail with a session error
    pub(crate) fail_next_peer_loads: AtomicU32,

    /// Next N fetch_item calls report a rate limit
    pub(crate) rate_limited_fetches: AtomicU32,
    /// Next N send_media calls report a rate limit
    pub(crate) rate_limited_sends: AtomicU32,
    /// Next N send_media calls fail hard
    pub(crate) failed_sends: AtomicU32,
    /// Next N download_media calls fail hard
    pub(crate) failed_downloads: AtomicU32,
    /// Wait carried by scripted rate limits, in milliseconds
    pub(crate) rate_limit_wait_ms: AtomicU64,

    /// Whether copy_item succeeds (default: copy-restricted)
    pub(crate) copy_allowed: AtomicBool,
    /// Whether download_thumbnail produces a file for videos
    pub(crate) thumbnails_available: AtomicBool,
    /// Artificial latency inside send_media, in milliseconds
    pub(crate) send_delay_ms: AtomicU64,

    /// Set when two deliveries for one requester ever overlap
    pub(crate) interleaved: AtomicBool,
    in_flight: StdMutex<HashMap<RequesterId, u32>>,

    /// Calls to fetch_item, including rate-limited ones
    pub(crate) fetches: AtomicU32,
    /// Calls to send_media, including rate-limited and failed ones
    pub(crate) send_attempts: AtomicU32,

    deliveries: StdMutex<Vec<DeliveryRecord>>,
    copies: StdMutex<Vec<(RequesterId, i64)>>,
    notices: StdMutex<Vec<(RequesterId, MessageId, String)>>,
    edits: StdMutex<Vec<(MessageId, String)>>,
    deleted_notices: StdMutex<Vec<MessageId>>,
    next_notice_id: AtomicI64,
}

impl ScriptedMessenger {
    pub(crate) fn new() -> Self {
        Self {
            dialogs: StdMutex::new(HashMap::new()),
            timelines: StdMutex::new(HashMap::new()),
            peer_loads: AtomicU32::new(0),
            peer_load_delay_ms: AtomicU64::new(0),
            fail_next_peer_loads: AtomicU32::new(0),
            rate_limited_fetches: AtomicU32::new(0),
            rate_limited_sends: AtomicU32::new(0),
            failed_sends: AtomicU32::new(0),
            failed_downloads: AtomicU32::new(0),
            rate_limit_wait_ms: AtomicU64::new(5),
            copy_allowed: AtomicBool::new(false),
            thumbnails_available: AtomicBool::new(false),
            send_delay_ms: AtomicU64::new(0),
            interleaved: AtomicBool::new(false),
            in_flight: StdMutex::new(HashMap::new()),
            fetches: AtomicU32::new(0),
            send_attempts: AtomicU32::new(0),
            deliveries: StdMutex::new(Vec::new()),
            copies: StdMutex::new(Vec::new()),
            notices: StdMutex::new(Vec::new()),
            edits: StdMutex::new(Vec::new()),
            deleted_notices: StdMutex::new(Vec::new()),
            next_notice_id: AtomicI64::new(1),
        }
    }

    // ---- scripting ----

    pub(crate) fn add_private_peer(&self, requester: RequesterId, chat_id: i64, access_hash: i64) {
        let mut dialogs = self.dialogs.lock().unwrap();
        dialogs.entry(requester).or_default().insert(
            chat_id,
            PeerHandle::Private {
                chat_id,
                access_hash,
            },
        );
    }

    pub(crate) fn add_private_media(&self, chat_id: i64, item: i64, kind: MediaKind) {
        self.add_item(ChatKey::Private(chat_id), media_item(item, kind));
    }

    pub(crate) fn add_public_media(&self, handle: &str, item: i64, kind: MediaKind) {
        self.add_item(ChatKey::Public(handle.to_string()), media_item(item, kind));
    }

    pub(crate) fn add_captioned_media(
        &self,
        chat_id: i64,
        item: i64,
        kind: MediaKind,
        caption: &str,
    ) {
        let mut it = media_item(item, kind);
        it.caption = Some(caption.to_string());
        self.add_item(ChatKey::Private(chat_id), it);
    }

    /// A text-only item: fetchable, but with nothing to relay.
    pub(crate) fn add_text_item(&self, chat_id: i64, item: i64) {
        self.add_item(
            ChatKey::Private(chat_id),
            RemoteItem {
                id: MessageId(item),
                media: None,
                caption: Some("text only".to_string()),
            },
        );
    }

    fn add_item(&self, key: ChatKey, item: RemoteItem) {
        let mut timelines = self.timelines.lock().unwrap();
        let timeline = timelines.entry(key).or_default();
        timeline.push(item);
        timeline.sort_by_key(|i| i.id.0);
    }

    // ---- recorded activity ----

    pub(crate) fn deliveries(&self) -> Vec<DeliveryRecord> {
        self.deliveries.lock().unwrap().clone()
    }

    pub(crate) fn deliveries_for(&self, requester: RequesterId) -> Vec<DeliveryRecord> {
        self.deliveries
            .lock()
            .unwrap()
            .iter()
            .filter(|d| d.requester == requester)
            .cloned()
            .collect()
    }

    pub(crate) fn copies(&self) -> Vec<(RequesterId, i64)> {
        self.copies.lock().unwrap().clone()
    }

    pub(crate) fn notice_texts(&self, requester: RequesterId) -> Vec<String> {
        self.notices
            .lock()
            .unwrap()
            .iter()
            .filter(|(r, _, _)| *r == requester)
            .map(|(_, _, text)| text.clone())
            .collect()
    }

    pub(crate) fn edits(&self) -> Vec<(MessageId, String)> {
        self.edits.lock().unwrap().clone()
    }

    pub(crate) fn deleted_notices(&self) -> Vec<MessageId> {
        self.deleted_notices.lock().unwrap().clone()
    }

    fn rate_limit_error(&self) -> Error {
        Error::RateLimited {
            wait: Duration::from_millis(self.rate_limit_wait_ms.load(Ordering::SeqCst)),
        }
    }
}

/// Item with a media payload of the given kind. Videos get fixed metadata,
/// documents a fixed file name.
fn media_item(item: i64, kind: MediaKind) -> RemoteItem {
    let video = (kind == MediaKind::Video).then_some(VideoMeta {
        duration_secs: 60,
        width: 1280,
        height: 720,
    });
    let file_name = (kind == MediaKind::Document).then(|| format!("doc-{item}.bin"));
    RemoteItem {
        id: MessageId(item),
        media: Some(RemoteMedia {
            kind,
            size: Some(1024),
            file_name,
            video,
        }),
        caption: None,
    }
}

/// Decrement a scripted-failure counter; true while scripted calls remain.
fn countdown(counter: &AtomicU32) -> bool {
    loop {
        let current = counter.load(Ordering::SeqCst);
        if current == 0 {
            return false;
        }
        if counter
            .compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return true;
        }
    }
}

#[async_trait]
impl MessengerClient for ScriptedMessenger {
    async fn load_peers(&self, requester: RequesterId) -> Result<PeerMap> {
        let delay = self.peer_load_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.peer_loads.fetch_add(1, Ordering::SeqCst);
        if countdown(&self.fail_next_peer_loads) {
            return Err(Error::Session("scripted session failure".to_string()));
        }
        let dialogs = self.dialogs.lock().unwrap();
        Ok(dialogs.get(&requester).cloned().unwrap_or_default())
    }

    async fn fetch_item(
        &self,
        _requester: RequesterId,
        peer: &PeerHandle,
        item: MessageId,
    ) -> Result<RemoteItem> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if countdown(&self.rate_limited_fetches) {
            return Err(self.rate_limit_error());
        }
        let timelines = self.timelines.lock().unwrap();
        timelines
            .get(&ChatKey::of(peer))
            .and_then(|timeline| timeline.iter().find(|i| i.id == item))
            .cloned()
            .ok_or_else(|| Error::SourceUnavailable(format!("item {item} not found")))
    }

    async fn scan_media(
        &self,
        _requester: RequesterId,
        peer: &PeerHandle,
        anchor: MessageId,
        filter: MediaFilter,
        limit: u32,
    ) -> Result<Vec<RemoteItem>> {
        let wanted = match filter {
            MediaFilter::Photos => MediaKind::Photo,
            MediaFilter::Videos => MediaKind::Video,
        };
        let timelines = self.timelines.lock().unwrap();
        let Some(timeline) = timelines.get(&ChatKey::of(peer)) else {
            return Ok(Vec::new());
        };
        // Timelines are kept sorted ascending on insert.
        Ok(timeline
            .iter()
            .filter(|i| i.id.0 > anchor.0)
            .filter(|i| i.media.as_ref().is_some_and(|m| m.kind == wanted))
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn download_media(
        &self,
        _requester: RequesterId,
        _peer: &PeerHandle,
        item: &RemoteItem,
        dest: &Path,
    ) -> Result<()> {
        if countdown(&self.failed_downloads) {
            return Err(Error::TransferFailed(
                "scripted download failure".to_string(),
            ));
        }
        tokio::fs::write(dest, format!("payload:{}", item.id.0)).await?;
        Ok(())
    }

    async fn download_thumbnail(
        &self,
        _requester: RequesterId,
        _peer: &PeerHandle,
        _item: &RemoteItem,
        dest: &Path,
    ) -> Result<Option<PathBuf>> {
        if self.thumbnails_available.load(Ordering::SeqCst) {
            tokio::fs::write(dest, "thumb").await?;
            Ok(Some(dest.to_path_buf()))
        } else {
            Ok(None)
        }
    }

    async fn send_media(&self, requester: RequesterId, delivery: &MediaDelivery) -> Result<()> {
        self.send_attempts.fetch_add(1, Ordering::SeqCst);
        if countdown(&self.rate_limited_sends) {
            return Err(self.rate_limit_error());
        }
        if countdown(&self.failed_sends) {
            return Err(Error::TransferFailed("scripted send failure".to_string()));
        }

        {
            let mut in_flight = self.in_flight.lock().unwrap();
            let count = in_flight.entry(requester).or_insert(0);
            *count += 1;
            if *count > 1 {
                self.interleaved.store(true, Ordering::SeqCst);
            }
        }
        let delay = self.send_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            if let Some(count) = in_flight.get_mut(&requester) {
                *count = count.saturating_sub(1);
            }
        }

        self.deliveries.lock().unwrap().push(DeliveryRecord {
            requester,
            payload: delivery.payload.clone(),
            caption: delivery.caption.clone(),
            streaming: matches!(delivery.framing, MediaFraming::Streaming(_)),
            thumbnail: delivery.thumbnail.is_some(),
        });
        Ok(())
    }

    async fn copy_item(
        &self,
        requester: RequesterId,
        peer: &PeerHandle,
        item: MessageId,
    ) -> Result<()> {
        if !self.copy_allowed.load(Ordering::SeqCst) {
            return Err(Error::TransferFailed(
                "direct copy restricted".to_string(),
            ));
        }
        let exists = {
            let timelines = self.timelines.lock().unwrap();
            timelines
                .get(&ChatKey::of(peer))
                .is_some_and(|timeline| timeline.iter().any(|i| i.id == item))
        };
        if !exists {
            return Err(Error::SourceUnavailable(format!("item {item} not found")));
        }
        self.copies.lock().unwrap().push((requester, item.0));
        Ok(())
    }

    async fn send_notice(&self, requester: RequesterId, text: &str) -> Result<MessageId> {
        let id = MessageId(self.next_notice_id.fetch_add(1, Ordering::SeqCst));
        self.notices
            .lock()
            .unwrap()
            .push((requester, id, text.to_string()));
        Ok(id)
    }

    async fn edit_notice(
        &self,
        _requester: RequesterId,
        notice: MessageId,
        text: &str,
    ) -> Result<()> {
        self.edits.lock().unwrap().push((notice, text.to_string()));
        Ok(())
    }

    async fn delete_notice(&self, _requester: RequesterId, notice: MessageId) -> Result<()> {
        self.deleted_notices.lock().unwrap().push(notice);
        Ok(())
    }
}

/// Config tuned for fast tests: tiny poll interval, no pacing, short flood
/// margin with jitter off so scripted waits stay deterministic.
pub(crate) fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.access.admin_id = TEST_ADMIN;
    config.access.grants_path = dir.path().join("grants.json");
    config.pipeline.spool_dir = dir.path().join("spool");
    config.pipeline.download_workers = 2;
    config.pipeline.upload_workers = 2;
    config.pipeline.send_queue_watermark = 8;
    config.pipeline.queue_poll_interval = Duration::from_millis(10);
    config.pipeline.upload_pacing = None;
    config.pipeline.fetch_timeout = Duration::from_secs(5);
    config.pipeline.deliver_timeout = Duration::from_secs(5);
    config.flood.margin = Duration::from_millis(5);
    config.flood.jitter = false;
    config
}

/// Build a relay around the given messenger. Workers are not started; tests
/// that exercise the pipeline call `start()` themselves.
pub(crate) async fn create_test_relay(client: Arc<ScriptedMessenger>) -> (MediaRelay, TempDir) {
    create_test_relay_with(client, |_| {}).await
}

/// Like [`create_test_relay`], with a hook to adjust the config first (worker
/// counts, watermark, pacing) for tests that pin down scheduling.
pub(crate) async fn create_test_relay_with(
    client: Arc<ScriptedMessenger>,
    tweak: impl FnOnce(&mut Config),
) -> (MediaRelay, TempDir) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let mut config = test_config(&dir);
    tweak(&mut config);
    let store = Arc::new(JsonGrantStore::new(config.access.grants_path.clone()));
    let relay = MediaRelay::new(config, client, store)
        .await
        .expect("construct relay");
    (relay, dir)
}

/// Receive events until one matches, failing the test after `secs` seconds.
/// Non-matching events are discarded.
pub(crate) async fn wait_for_event<F>(
    rx: &mut broadcast::Receiver<Event>,
    secs: u64,
    mut matches: F,
) -> Event
where
    F: FnMut(&Event) -> bool,
{
    tokio::time::timeout(Duration::from_secs(secs), async {
        loop {
            match rx.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    panic!("event receiver lagged, lost {skipped} events")
                }
                Err(broadcast::error::RecvError::Closed) => {
                    panic!("event channel closed while waiting")
                }
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Poll an async condition every 10 ms until it holds, failing after `secs`.
pub(crate) async fn wait_until<F, Fut>(secs: u64, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(secs), async {
        loop {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}
