//! Single-item intake — admission, the copy fast path, and enqueueing.

use std::sync::atomic::Ordering;

use crate::error::{Error, Result};
use crate::link::parse_source_ref;
use crate::types::{DownloadTask, Event, MessageId, RelayOutcome, RequesterId, SourceRef};
use tracing::{debug, info, warn};

use super::{MediaRelay, SINGLE_DONE_NOTICE};

impl MediaRelay {
    /// Accept a single-item relay request.
    ///
    /// Premium requesters pass freely; everyone else spends one token on
    /// admission. When the source chat permits it the item is copied
    /// directly without touching the pipeline; otherwise a download task is
    /// queued and the media travels through the spool.
    ///
    /// # Errors
    ///
    /// Returns an error when shutdown has begun, when the link does not
    /// parse, or when the requester has neither a grant nor tokens left.
    pub async fn request_relay(&self, requester: RequesterId, link: &str) -> Result<RelayOutcome> {
        if !self.queues.accepting_new.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        let source = parse_source_ref(link)?;
        self.admit(requester).await?;

        let task_id = self.next_task_id();
        if self.try_fast_path(requester, &source).await {
            info!(
                requester = requester.0,
                task_id = task_id.0,
                source = %source,
                "Relayed via direct copy"
            );
            self.emit_event(Event::FastPathDelivered {
                task: task_id,
                requester,
            });
            return Ok(RelayOutcome::Copied(task_id));
        }

        let task = DownloadTask {
            id: task_id,
            requester,
            source,
            attempts: 0,
            batch: false,
        };
        {
            let mut tasks = self.queues.tasks.lock().await;
            tasks.push_back(task);
        }
        debug!(
            requester = requester.0,
            task_id = task_id.0,
            "Task queued for pipeline relay"
        );
        self.emit_event(Event::TaskQueued {
            task: task_id,
            requester,
        });
        Ok(RelayOutcome::Queued(task_id))
    }

    /// Admission control for single relays. Premium grants bypass the token
    /// economy entirely; free requesters spend one token per accepted item.
    async fn admit(&self, requester: RequesterId) -> Result<()> {
        if self.access.is_premium(requester).await {
            return Ok(());
        }
        if self.access.consume_token(requester).await {
            return Ok(());
        }
        Err(Error::AccessDenied(
            "no tokens left; invite a friend or ask for a grant".to_string(),
        ))
    }

    /// Attempt to copy the item straight into the requester's chat without
    /// downloading. Any failure here is quiet — protected chats, missing
    /// dialogs, and copy restrictions all just mean the pipeline does the
    /// work instead.
    async fn try_fast_path(&self, requester: RequesterId, source: &SourceRef) -> bool {
        let peer = match self.resolve_peer(requester, &source.chat).await {
            Ok(Some(peer)) => peer,
            Ok(None) => {
                debug!(
                    requester = requester.0,
                    source = %source,
                    "Chat not in dialogs, falling back to pipeline"
                );
                return false;
            }
            Err(e) => {
                debug!(
                    requester = requester.0,
                    error = %e,
                    "Peer resolution failed, falling back to pipeline"
                );
                return false;
            }
        };

        match self
            .client
            .copy_item(requester, &peer, MessageId(source.item))
            .await
        {
            Ok(()) => {
                if let Err(e) = self.client.send_notice(requester, SINGLE_DONE_NOTICE).await {
                    warn!(
                        requester = requester.0,
                        error = %e,
                        "Copied item but failed to send the confirmation notice"
                    );
                }
                true
            }
            Err(e) => {
                debug!(
                    requester = requester.0,
                    source = %source,
                    error = %e,
                    "Direct copy refused, falling back to pipeline"
                );
                false
            }
        }
    }
}
