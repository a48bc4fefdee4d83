//! Download pool — fetch tasks, spool payloads, hand jobs to the send queue.
//!
//! Workers poll the task queue and survive every per-task failure. The only
//! retried error is an upstream rate limit, and only up to the configured
//! extra-attempt cap; everything else drops the task with a reason.

use std::path::Path;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Error;
use crate::types::{DownloadTask, Event, MediaKind, MessageId, PipelineStage, UploadJob};

use super::{MediaRelay, with_deadline};

impl MediaRelay {
    /// Spawn one download worker. The worker exits only on cancellation.
    pub(crate) fn spawn_download_worker(&self, worker: usize) -> JoinHandle<()> {
        let relay = self.clone();
        tokio::spawn(async move {
            debug!(worker, "Download worker started");
            loop {
                if relay.cancel.is_cancelled() {
                    break;
                }

                // Hold off while the send queue sits above the watermark so
                // the spool cannot fill faster than deliveries drain it.
                let backlogged = {
                    let jobs = relay.queues.jobs.lock().await;
                    jobs.len() >= relay.config.pipeline.send_queue_watermark
                };
                let task = if backlogged {
                    None
                } else {
                    relay.queues.tasks.lock().await.pop_front()
                };
                if let Some(task) = task {
                    relay.run_fetch(task, worker).await;
                    continue;
                }

                tokio::select! {
                    () = tokio::time::sleep(relay.config.pipeline.queue_poll_interval) => {}
                    () = relay.cancel.cancelled() => break,
                }
            }
            debug!(worker, "Download worker stopped");
        })
    }

    /// Fetch one task end to end: resolve the peer, pull the item, spool the
    /// payload, and queue the upload job.
    async fn run_fetch(&self, task: DownloadTask, worker: usize) {
        debug!(
            worker,
            task_id = task.id.0,
            source = %task.source,
            attempt = task.attempts,
            "Fetching item"
        );

        let peer = match self.resolve_peer(task.requester, &task.source.chat).await {
            Ok(Some(peer)) => peer,
            Ok(None) => {
                self.drop_task(task, "source chat is not in the requester's dialogs".to_string())
                    .await;
                return;
            }
            Err(e) => {
                self.drop_task(task, e.to_string()).await;
                return;
            }
        };

        let fetch_timeout = self.config.pipeline.fetch_timeout;
        let item = match with_deadline(
            fetch_timeout,
            "fetch",
            self.client
                .fetch_item(task.requester, &peer, MessageId(task.source.item)),
        )
        .await
        {
            Ok(item) => item,
            Err(Error::RateLimited { wait }) => {
                self.requeue_rate_limited(task, wait).await;
                return;
            }
            Err(e) => {
                self.drop_task(task, e.to_string()).await;
                return;
            }
        };

        let Some(media) = item.media.clone() else {
            let reason = Error::NoMedia {
                reference: task.source.to_string(),
            }
            .to_string();
            self.drop_task(task, reason).await;
            return;
        };

        let payload = self
            .config
            .spool_dir()
            .join(format!("{}.{}", task.id, media.kind.extension()));
        match with_deadline(
            fetch_timeout,
            "download",
            self.client
                .download_media(task.requester, &peer, &item, &payload),
        )
        .await
        {
            Ok(()) => {}
            Err(Error::RateLimited { wait }) => {
                remove_spool_file(&payload).await;
                self.requeue_rate_limited(task, wait).await;
                return;
            }
            Err(e) => {
                remove_spool_file(&payload).await;
                self.drop_task(task, e.to_string()).await;
                return;
            }
        }

        // Thumbnails are cosmetic; a failure here never costs the payload.
        let thumbnail = if media.kind == MediaKind::Video {
            let thumb_path = self
                .config
                .spool_dir()
                .join(format!("{}_thumb.jpg", task.id));
            match self
                .client
                .download_thumbnail(task.requester, &peer, &item, &thumb_path)
                .await
            {
                Ok(thumb) => thumb,
                Err(e) => {
                    warn!(
                        task_id = task.id.0,
                        error = %e,
                        "Thumbnail download failed, delivering without one"
                    );
                    None
                }
            }
        } else {
            None
        };

        let kind = media.kind;
        let job = UploadJob {
            task: task.id,
            requester: task.requester,
            payload,
            kind,
            video: media.video,
            file_name: media.file_name.clone(),
            caption: item.caption.clone().unwrap_or_default(),
            thumbnail,
            batch: task.batch,
        };
        {
            let mut jobs = self.queues.jobs.lock().await;
            jobs.push_back(job);
        }
        debug!(
            task_id = task.id.0,
            requester = task.requester.0,
            "Payload spooled"
        );
        self.emit_event(Event::PayloadSpooled {
            task: task.id,
            requester: task.requester,
            kind,
        });
    }

    /// Pause for the signaled wait, then requeue the task unless its extra
    /// attempts are spent.
    async fn requeue_rate_limited(&self, mut task: DownloadTask, wait: Duration) {
        self.emit_event(Event::RateLimited {
            stage: PipelineStage::Fetch,
            wait_secs: wait.as_secs(),
            task: task.id,
        });
        warn!(
            task_id = task.id.0,
            wait_secs = wait.as_secs(),
            "Fetch rate-limited, pausing worker"
        );
        self.flood.sleep(wait).await;

        task.attempts += 1;
        if task.attempts <= self.config.pipeline.fetch_retry_limit {
            let attempt = task.attempts;
            let (id, requester) = (task.id, task.requester);
            {
                let mut tasks = self.queues.tasks.lock().await;
                tasks.push_back(task);
            }
            debug!(task_id = id.0, attempt, "Task requeued after rate limit");
            self.emit_event(Event::TaskRequeued {
                task: id,
                requester,
                attempt,
            });
        } else {
            self.drop_task(task, "fetch rate-limit retries exhausted".to_string())
                .await;
        }
    }

    /// Terminal drop: emit the event and settle batch bookkeeping.
    pub(crate) async fn drop_task(&self, task: DownloadTask, reason: String) {
        warn!(
            task_id = task.id.0,
            requester = task.requester.0,
            attempts = task.attempts,
            reason = %reason,
            "Dropping task"
        );
        let requester = task.requester;
        let batch = task.batch;
        self.emit_event(Event::TaskDropped {
            task: task.id,
            requester,
            reason,
        });
        if batch {
            self.drop_batch_member(requester).await;
        }
    }
}

/// Remove a spool file, tolerating its absence.
pub(crate) async fn remove_spool_file(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "Failed to remove spool file");
    }
}
