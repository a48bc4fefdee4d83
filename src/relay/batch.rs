//! Batch orchestration — size menu, forward scan, session bookkeeping.
//!
//! One live session per requester walks AwaitingSize → AwaitingFirstRef →
//! Accumulating and ends in cancellation or completion. Session counters are
//! only mutated while holding the requester's delivery lock, so the upload
//! pool's completion checks never race the orchestrator's bookkeeping.

use crate::client::MediaFilter;
use crate::error::{Error, Result};
use crate::link::parse_source_ref;
use crate::types::{DownloadTask, Event, MessageId, RequesterId, SourceRef};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::MediaRelay;

/// Where a batch session stands between opening and its terminal state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchStep {
    /// Opened; waiting for the requester to pick a size from the menu
    AwaitingSize,
    /// Size accepted; waiting for the first source reference
    AwaitingFirstRef,
    /// Scanning and delivering; further references top up a short batch
    Accumulating,
}

/// Live bookkeeping for one requester's batch
#[derive(Clone, Debug)]
pub(crate) struct BatchSession {
    pub(crate) step: BatchStep,
    /// Requested size; 0 until chosen
    pub(crate) total: u32,
    /// Deliveries still owed; decremented only on delivery
    pub(crate) remaining: u32,
    /// Tasks enqueued minus terminal drops
    pub(crate) queued: u32,
    /// Jobs actually delivered
    pub(crate) delivered: u32,
    /// Whether the last scan ran out of source media before filling the batch
    pub(crate) exhausted: bool,
    pub(crate) created_at: DateTime<Utc>,
}

impl BatchSession {
    fn open() -> Self {
        Self {
            step: BatchStep::AwaitingSize,
            total: 0,
            remaining: 0,
            queued: 0,
            delivered: 0,
            exhausted: false,
            created_at: Utc::now(),
        }
    }

    /// Whether the session has nothing left to wait for. A full batch
    /// completes at remaining = 0; a short batch completes once the scan was
    /// exhausted and every queued task has resolved.
    pub(crate) fn completion_ready(&self) -> bool {
        if self.total == 0 {
            return false;
        }
        self.remaining == 0 || (self.exhausted && self.delivered >= self.queued)
    }
}

/// Progress snapshot handed to the upload worker after a delivery is counted
pub(crate) struct BatchProgress {
    /// Deliveries so far, including this one
    pub(crate) sent: u32,
    /// Requested batch size
    pub(crate) total: u32,
    /// Whether this delivery completed the batch
    pub(crate) finalize: bool,
}

/// Offered batch sizes: multiples of 10 from 10 up to min(limit, 100).
pub(crate) fn batch_size_menu(batch_limit: u32) -> Vec<u32> {
    let ceiling = batch_limit.min(100);
    (1..=ceiling / 10).map(|n| n * 10).collect()
}

impl MediaRelay {
    /// Open a batch session and return the size menu.
    ///
    /// Requires an active premium grant; one session per requester.
    pub async fn begin_batch(&self, requester: RequesterId) -> Result<Vec<u32>> {
        if !self
            .queues
            .accepting_new
            .load(std::sync::atomic::Ordering::SeqCst)
        {
            return Err(Error::ShuttingDown);
        }
        if !self.access.is_premium(requester).await {
            return Err(Error::AccessDenied(
                "batch mode requires an active premium grant".to_string(),
            ));
        }

        let limit = self.access.batch_limit(requester).await;
        let menu = batch_size_menu(limit);
        let Some(ceiling) = menu.last().copied() else {
            return Err(Error::Session(format!(
                "batch limit {limit} is below the smallest batch size"
            )));
        };

        {
            let mut batches = self.sessions.batches.lock().await;
            if batches.contains_key(&requester) {
                return Err(Error::Session("a batch is already in progress".to_string()));
            }
            batches.insert(requester, BatchSession::open());
        }

        info!(requester = requester.0, limit = ceiling, "Batch opened");
        self.emit_event(Event::BatchOpened {
            requester,
            limit: ceiling,
        });
        Ok(menu)
    }

    /// Accept a size choice from the menu.
    ///
    /// An invalid choice errors without leaving AwaitingSize, so the
    /// requester can simply be re-prompted.
    pub async fn choose_batch_size(&self, requester: RequesterId, size: u32) -> Result<()> {
        let limit = self.access.batch_limit(requester).await;
        let menu = batch_size_menu(limit);

        {
            let mut batches = self.sessions.batches.lock().await;
            let session = batches
                .get_mut(&requester)
                .ok_or_else(|| Error::Session("no batch in progress".to_string()))?;
            if session.step != BatchStep::AwaitingSize {
                return Err(Error::Session("batch size already chosen".to_string()));
            }
            if !menu.contains(&size) {
                return Err(Error::Session(format!(
                    "invalid batch size {size}; choose a multiple of 10 up to {}",
                    menu.last().copied().unwrap_or_default()
                )));
            }
            session.total = size;
            session.remaining = size;
            session.step = BatchStep::AwaitingFirstRef;
        }

        info!(requester = requester.0, total = size, "Batch size chosen");
        self.emit_event(Event::BatchSized {
            requester,
            total: size,
        });
        Ok(())
    }

    /// Resolve a source reference for the batch: the anchor item (when it
    /// carries media) plus a forward scan across photos and videos, merged,
    /// sorted ascending by item id, and enqueued until the batch is full or
    /// the source runs out. Returns how many tasks this reference enqueued.
    ///
    /// In Accumulating, further references top up a short batch.
    pub async fn submit_batch_reference(&self, requester: RequesterId, link: &str) -> Result<u32> {
        if !self
            .queues
            .accepting_new
            .load(std::sync::atomic::Ordering::SeqCst)
        {
            return Err(Error::ShuttingDown);
        }

        let need = {
            let batches = self.sessions.batches.lock().await;
            let session = batches
                .get(&requester)
                .ok_or_else(|| Error::Session("no batch in progress".to_string()))?;
            if session.step == BatchStep::AwaitingSize {
                return Err(Error::Session("choose a batch size first".to_string()));
            }
            session.total - session.queued
        };
        if need == 0 {
            return Ok(0);
        }

        let source = parse_source_ref(link)?;
        let peer = self
            .resolve_peer(requester, &source.chat)
            .await?
            .ok_or_else(|| {
                Error::SourceUnavailable(format!("chat {} is not in your dialogs", source.chat))
            })?;

        let anchor = MessageId(source.item);
        let anchor_item = self.client.fetch_item(requester, &peer, anchor).await?;

        let mut items = Vec::new();
        if anchor_item.has_media() {
            items.push(anchor_item);
        }
        let photos = self
            .client
            .scan_media(requester, &peer, anchor, MediaFilter::Photos, need)
            .await?;
        let videos = self
            .client
            .scan_media(requester, &peer, anchor, MediaFilter::Videos, need)
            .await?;
        items.extend(photos);
        items.extend(videos);
        items.retain(|item| item.has_media());
        items.sort_by_key(|item| item.id.0);
        items.dedup_by_key(|item| item.id.0);
        let found = items.len() as u32;

        // Count the work into the session before any task exists, so a
        // delivery can never observe tasks the bookkeeping has not seen.
        let (take, total, finalize) = {
            let lock = self.delivery_lock_for(requester).await;
            let _guard = lock.lock().await;
            let mut batches = self.sessions.batches.lock().await;
            let Some(session) = batches.get_mut(&requester) else {
                // Cancelled while we were scanning; queue nothing.
                debug!(requester = requester.0, "Batch gone after scan, discarding items");
                return Ok(0);
            };
            let slots = session.total - session.queued;
            let take = found.min(slots);
            session.queued += take;
            session.exhausted = found < slots;
            session.step = BatchStep::Accumulating;
            let session_total = session.total;
            let finalize = if session.completion_ready() {
                let snapshot = (session.delivered, session.total);
                batches.remove(&requester);
                Some(snapshot)
            } else {
                None
            };
            (take, session_total, finalize)
        };

        items.truncate(take as usize);
        if !items.is_empty() {
            let mut tasks = self.queues.tasks.lock().await;
            for item in &items {
                tasks.push_back(DownloadTask {
                    id: self.next_task_id(),
                    requester,
                    source: SourceRef {
                        chat: source.chat.clone(),
                        item: item.id.0,
                    },
                    attempts: 0,
                    batch: true,
                });
            }
        }

        info!(
            requester = requester.0,
            queued = take,
            total,
            "Batch reference scanned"
        );
        self.emit_event(Event::BatchQueued {
            requester,
            queued: take,
            total,
        });

        if let Some((delivered, total)) = finalize {
            self.finalize_batch(requester, delivered, total).await;
        }
        Ok(take)
    }

    /// Cancel the requester's batch, clearing bookkeeping only.
    ///
    /// Already-queued tasks run to completion; their deliveries arrive
    /// without progress or completion notices. Returns whether a session
    /// existed.
    pub async fn cancel_batch(&self, requester: RequesterId) -> bool {
        let removed = {
            let mut batches = self.sessions.batches.lock().await;
            batches.remove(&requester)
        };
        let Some(session) = removed else {
            return false;
        };

        info!(
            requester = requester.0,
            step = ?session.step,
            queued = session.queued,
            delivered = session.delivered,
            age_secs = (Utc::now() - session.created_at).num_seconds(),
            "Batch cancelled"
        );
        self.clear_progress_notice(requester).await;
        self.emit_event(Event::BatchCancelled { requester });
        true
    }

    /// Count one delivered job against the requester's session.
    ///
    /// Caller must hold the requester's delivery lock. Returns None when no
    /// session is live (single relay or cancelled-batch leftover).
    pub(crate) async fn record_batch_delivery(
        &self,
        requester: RequesterId,
    ) -> Option<BatchProgress> {
        let mut batches = self.sessions.batches.lock().await;
        let session = batches.get_mut(&requester)?;
        session.delivered += 1;
        session.remaining = session.remaining.saturating_sub(1);
        let progress = BatchProgress {
            sent: session.delivered,
            total: session.total,
            finalize: session.completion_ready(),
        };
        if progress.finalize {
            batches.remove(&requester);
        }
        Some(progress)
    }

    /// Count one terminal drop against the requester's session.
    ///
    /// Caller must hold the requester's delivery lock. Returns a completion
    /// snapshot when the drop finishes a short batch.
    pub(crate) async fn record_batch_drop(&self, requester: RequesterId) -> Option<(u32, u32)> {
        let mut batches = self.sessions.batches.lock().await;
        let session = batches.get_mut(&requester)?;
        session.queued = session.queued.saturating_sub(1);
        if session.completion_ready() {
            let snapshot = (session.delivered, session.total);
            batches.remove(&requester);
            Some(snapshot)
        } else {
            None
        }
    }

    /// Terminal-drop bookkeeping for paths that do not already hold the
    /// requester's delivery lock (the download pool's drop paths).
    pub(crate) async fn drop_batch_member(&self, requester: RequesterId) {
        let lock = self.delivery_lock_for(requester).await;
        let _guard = lock.lock().await;
        if let Some((delivered, total)) = self.record_batch_drop(requester).await {
            self.finalize_batch(requester, delivered, total).await;
        }
    }

    /// Wrap up a finished batch: drop the progress indicator, confirm with
    /// the true delivered count, and emit the completion event.
    pub(crate) async fn finalize_batch(&self, requester: RequesterId, delivered: u32, total: u32) {
        self.clear_progress_notice(requester).await;
        let text = format!("✅ Batch complete: delivered {delivered} of {total}.");
        if let Err(e) = self.client.send_notice(requester, &text).await {
            warn!(
                requester = requester.0,
                error = %e,
                "Failed to send batch completion notice"
            );
        }
        info!(requester = requester.0, delivered, total, "Batch complete");
        self.emit_event(Event::BatchComplete {
            requester,
            delivered,
            total,
        });
    }
}
