//! Admin surface — grants, token credits, queue inspection, and cleanup.

use std::sync::atomic::Ordering;

use tracing::info;

use crate::error::Result;
use crate::store::GrantRecord;
use crate::types::{Event, QueueDepths, RequesterId, UploadJob};

use super::MediaRelay;

impl MediaRelay {
    /// Create or extend a premium grant.
    ///
    /// # Errors
    ///
    /// Returns an error when the grant store cannot be written.
    pub async fn grant(&self, subject: RequesterId, days: i64, batch_limit: u32) -> Result<()> {
        self.access.grant(subject, days, batch_limit).await?;
        self.emit_event(Event::GrantUpdated {
            subject,
            days,
            batch_limit,
        });
        Ok(())
    }

    /// Revoke a premium grant. Returns whether a grant existed; the admin's
    /// own grant is never revoked.
    ///
    /// # Errors
    ///
    /// Returns an error when the grant store cannot be written.
    pub async fn revoke(&self, subject: RequesterId) -> Result<bool> {
        let removed = self.access.revoke(subject).await?;
        if removed {
            self.emit_event(Event::GrantRevoked { subject });
        }
        Ok(removed)
    }

    /// Credit tokens to a subject and return the new balance.
    pub async fn credit_tokens(&self, subject: RequesterId, count: u32) -> u32 {
        let balance = self.access.credit_tokens(subject, count).await;
        self.emit_event(Event::TokensCredited { subject, balance });
        balance
    }

    /// Pay the referral bonus to both sides of a first-time referral.
    /// Returns false for self-referrals and repeat referrals.
    pub async fn credit_referral(&self, new_subject: RequesterId, inviter: RequesterId) -> bool {
        if !self.access.credit_referral(new_subject, inviter).await {
            return false;
        }
        let new_balance = self.access.balance(new_subject).await;
        self.emit_event(Event::TokensCredited {
            subject: new_subject,
            balance: new_balance,
        });
        let inviter_balance = self.access.balance(inviter).await;
        self.emit_event(Event::TokensCredited {
            subject: inviter,
            balance: inviter_balance,
        });
        true
    }

    /// Current token balance for a subject.
    pub async fn token_balance(&self, subject: RequesterId) -> u32 {
        self.access.balance(subject).await
    }

    /// Subjects with an active grant, sorted by subject id.
    pub async fn premium_list(&self) -> Vec<(RequesterId, GrantRecord)> {
        self.access.premium_list().await
    }

    /// Snapshot of both queue depths and the admission flag.
    pub async fn queue_depths(&self) -> QueueDepths {
        let tasks = self.queues.tasks.lock().await.len();
        let jobs = self.queues.jobs.lock().await.len();
        QueueDepths {
            tasks,
            jobs,
            accepting_new: self.queues.accepting_new.load(Ordering::SeqCst),
        }
    }

    /// Drop every queued task and job, delete the drained jobs' spool files,
    /// and cancel every live batch session. In-flight fetches and deliveries
    /// are not interrupted.
    pub async fn drain_queues(&self) -> (usize, usize) {
        let tasks = {
            let mut queue = self.queues.tasks.lock().await;
            let n = queue.len();
            queue.clear();
            n
        };
        let jobs: Vec<UploadJob> = {
            let mut queue = self.queues.jobs.lock().await;
            queue.drain(..).collect()
        };
        for job in &jobs {
            self.cleanup_spool(job).await;
        }

        let sessions: Vec<RequesterId> = {
            let batches = self.sessions.batches.lock().await;
            batches.keys().copied().collect()
        };
        for requester in sessions {
            self.cancel_batch(requester).await;
        }

        info!(tasks, jobs = jobs.len(), "Queues drained");
        self.emit_event(Event::QueuesDrained {
            tasks,
            jobs: jobs.len(),
        });
        (tasks, jobs.len())
    }

    /// Drop every cached dialog map. Returns how many requesters were cached.
    pub async fn clear_entity_cache(&self) -> usize {
        let dropped = self.entities.clear().await;
        info!(dropped, "Entity cache cleared");
        self.emit_event(Event::EntityCacheCleared);
        dropped
    }

    /// Drop all per-requester state: batch session, cached dialogs, progress
    /// notice, and (when idle) the delivery lock. Queued tasks are left to
    /// run; grants and balances are untouched.
    pub async fn forget_requester(&self, subject: RequesterId) {
        self.cancel_batch(subject).await;
        self.entities.forget(subject).await;
        self.clear_progress_notice(subject).await;

        {
            let mut locks = self.sessions.delivery_locks.lock().await;
            if let Some(lock) = locks.get(&subject)
                && lock.clone().try_lock_owned().is_ok()
            {
                // Nobody is mid-delivery; safe to drop the entry. An in-use
                // lock stays so the in-flight job keeps its serialization.
                locks.remove(&subject);
            }
        }

        info!(subject = subject.0, "Requester state forgotten");
        self.emit_event(Event::RequesterForgotten { subject });
    }
}
