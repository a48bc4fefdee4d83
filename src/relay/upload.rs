//! Upload pool — claim jobs, deliver payloads, drive progress notices.
//!
//! Claiming is a skip-scan: a worker takes the first job whose requester's
//! delivery lock it can grab without waiting, so one requester's deliveries
//! are strictly serialized while other requesters' jobs flow past. The lock
//! is held from claim through pacing, which is what keeps per-requester
//! ordering intact end to end.

use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backoff::deliver_with_flood_retry;
use crate::client::{MediaDelivery, MediaFraming};
use crate::types::{Event, PipelineStage, RequesterId, UploadJob};

use super::download::remove_spool_file;
use super::{MediaRelay, SINGLE_DONE_NOTICE, with_deadline};

impl MediaRelay {
    /// Spawn one upload worker. The worker exits only on cancellation.
    pub(crate) fn spawn_upload_worker(&self, worker: usize) -> JoinHandle<()> {
        let relay = self.clone();
        tokio::spawn(async move {
            debug!(worker, "Upload worker started");
            loop {
                if relay.cancel.is_cancelled() {
                    break;
                }

                match relay.claim_job().await {
                    Some((job, guard)) => relay.run_delivery(job, guard, worker).await,
                    None => {
                        tokio::select! {
                            () = tokio::time::sleep(relay.config.pipeline.queue_poll_interval) => {}
                            () = relay.cancel.cancelled() => break,
                        }
                    }
                }
            }
            debug!(worker, "Upload worker stopped");
        })
    }

    /// Claim the first job whose requester is not already mid-delivery.
    ///
    /// Jobs for busy requesters are skipped in place, never reordered, so
    /// each requester's queue position survives the scan. Returns None when
    /// every queued job belongs to a busy requester.
    async fn claim_job(&self) -> Option<(UploadJob, OwnedMutexGuard<()>)> {
        let mut jobs = self.queues.jobs.lock().await;
        let mut locks = self.sessions.delivery_locks.lock().await;
        for idx in 0..jobs.len() {
            let requester = jobs[idx].requester;
            let lock = locks
                .entry(requester)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone();
            if let Ok(guard) = lock.try_lock_owned() {
                let job = jobs.remove(idx)?;
                return Some((job, guard));
            }
        }
        None
    }

    /// Deliver one payload while holding the requester's delivery lock.
    ///
    /// Rate limits are retried for as long as they keep coming; any other
    /// transport failure abandons the job. Post-delivery pacing runs before
    /// the guard is released so paced requesters cannot be claimed early.
    async fn run_delivery(&self, job: UploadJob, guard: OwnedMutexGuard<()>, worker: usize) {
        debug!(
            worker,
            task_id = job.task.0,
            requester = job.requester.0,
            kind = ?job.kind,
            "Delivering payload"
        );

        let delivery = MediaDelivery {
            payload: job.payload.clone(),
            framing: MediaFraming::derive(job.kind, job.video, job.file_name.clone()),
            caption: Some(job.caption.clone()).filter(|c| !c.is_empty()),
            thumbnail: job.thumbnail.clone(),
        };

        let deliver_timeout = self.config.pipeline.deliver_timeout;
        let result = deliver_with_flood_retry(
            &self.flood,
            || {
                with_deadline(
                    deliver_timeout,
                    "deliver",
                    self.client.send_media(job.requester, &delivery),
                )
            },
            |wait| {
                warn!(
                    task_id = job.task.0,
                    wait_secs = wait.as_secs(),
                    "Delivery rate-limited, holding the requester's slot"
                );
                self.emit_event(Event::RateLimited {
                    stage: PipelineStage::Deliver,
                    wait_secs: wait.as_secs(),
                    task: job.task,
                });
            },
        )
        .await;

        self.cleanup_spool(&job).await;
        match result {
            Ok(()) => {
                self.settle_delivered(&job).await;
                if let Some(pause) = self.config.pipeline.upload_pacing {
                    tokio::time::sleep(pause).await;
                }
            }
            Err(e) => {
                warn!(
                    task_id = job.task.0,
                    requester = job.requester.0,
                    error = %e,
                    "Delivery abandoned"
                );
                self.emit_event(Event::JobAbandoned {
                    task: job.task,
                    requester: job.requester,
                    error: e.to_string(),
                });
                if job.batch
                    && let Some((delivered, total)) = self.record_batch_drop(job.requester).await
                {
                    self.finalize_batch(job.requester, delivered, total).await;
                }
            }
        }
        drop(guard);
    }

    /// Post-delivery bookkeeping: batch counters and the progress indicator
    /// for live batches, the confirmation notice for singles. Leftovers from
    /// a cancelled batch are counted for nobody and deliver silently.
    async fn settle_delivered(&self, job: &UploadJob) {
        let progress = if job.batch {
            self.record_batch_delivery(job.requester).await
        } else {
            None
        };

        match progress {
            Some(p) => {
                info!(
                    task_id = job.task.0,
                    requester = job.requester.0,
                    sent = p.sent,
                    total = p.total,
                    "Delivered batch item"
                );
                self.update_progress_notice(job.requester, p.sent, p.total)
                    .await;
                self.emit_event(Event::Delivered {
                    task: job.task,
                    requester: job.requester,
                    sent: p.sent,
                    total: Some(p.total),
                });
                if p.finalize {
                    self.finalize_batch(job.requester, p.sent, p.total).await;
                }
            }
            None => {
                info!(
                    task_id = job.task.0,
                    requester = job.requester.0,
                    "Delivered item"
                );
                if !job.batch
                    && let Err(e) = self.client.send_notice(job.requester, SINGLE_DONE_NOTICE).await
                {
                    warn!(
                        requester = job.requester.0,
                        error = %e,
                        "Delivered but failed to send the confirmation notice"
                    );
                }
                self.emit_event(Event::Delivered {
                    task: job.task,
                    requester: job.requester,
                    sent: 1,
                    total: None,
                });
            }
        }
    }

    /// Edit the requester's progress notice in place, or post a fresh one
    /// when none exists or the old one is gone.
    async fn update_progress_notice(&self, requester: RequesterId, sent: u32, total: u32) {
        let text = format!("📤 {sent}/{total}");
        let existing = {
            let progress = self.sessions.progress.lock().await;
            progress.get(&requester).copied()
        };

        if let Some(id) = existing {
            if self.client.edit_notice(requester, id, &text).await.is_ok() {
                return;
            }
            debug!(
                requester = requester.0,
                notice = id.0,
                "Progress notice edit failed, posting a fresh one"
            );
        }
        match self.client.send_notice(requester, &text).await {
            Ok(id) => {
                let mut progress = self.sessions.progress.lock().await;
                progress.insert(requester, id);
            }
            Err(e) => {
                warn!(
                    requester = requester.0,
                    error = %e,
                    "Failed to post progress notice"
                );
            }
        }
    }

    /// Drop the requester's progress notice, in the map and in the chat.
    pub(crate) async fn clear_progress_notice(&self, requester: RequesterId) {
        let notice = {
            let mut progress = self.sessions.progress.lock().await;
            progress.remove(&requester)
        };
        if let Some(id) = notice
            && let Err(e) = self.client.delete_notice(requester, id).await
        {
            debug!(
                requester = requester.0,
                notice = id.0,
                error = %e,
                "Failed to delete progress notice"
            );
        }
    }

    /// Remove a delivered (or abandoned) job's spool files.
    pub(crate) async fn cleanup_spool(&self, job: &UploadJob) {
        remove_spool_file(&job.payload).await;
        if let Some(thumb) = &job.thumbnail {
            remove_spool_file(thumb).await;
        }
    }
}
