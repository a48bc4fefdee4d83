//! Admission gate: premium grants, token balances, and the purge loop
//!
//! The controller owns the grant map and token balances exclusively; every
//! mutation runs inside one mutex so check-and-decrement style operations
//! stay indivisible under parallel callers. Grants persist through the
//! [`GrantStore`] seam on every mutation; token balances are volatile.

use crate::config::AccessConfig;
use crate::error::Result;
use crate::store::{GrantRecord, GrantStore};
use crate::types::{AccessLevel, RequesterId};
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct AccessState {
    grants: HashMap<RequesterId, GrantRecord>,
    balances: HashMap<RequesterId, u32>,
    /// Subjects who already collected a referral credit, to stop repeats
    credited: HashSet<RequesterId>,
}

/// Grant/token store plus the admission operations built on it
pub struct AccessController {
    admin: RequesterId,
    free_batch_limit: u32,
    signup_tokens: u32,
    referral_bonus: u32,
    store: Arc<dyn GrantStore>,
    state: Mutex<AccessState>,
}

impl AccessController {
    /// Load persisted grants and pin the admin entry.
    ///
    /// The admin is always present with an unbounded expiry; a persisted
    /// admin entry only contributes its batch limit.
    pub async fn open(config: &AccessConfig, store: Arc<dyn GrantStore>) -> Result<Self> {
        let mut grants = store.load().await?;
        let admin = config.admin_id;

        let admin_limit = grants
            .get(&admin)
            .map(|record| record.batch_limit)
            .unwrap_or(config.free_batch_limit);
        grants.insert(admin, GrantRecord::unbounded(admin_limit));

        info!(
            grants = grants.len(),
            admin = admin.0,
            "Access controller loaded"
        );

        Ok(Self {
            admin,
            free_batch_limit: config.free_batch_limit,
            signup_tokens: config.signup_tokens,
            referral_bonus: config.referral_bonus,
            store,
            state: Mutex::new(AccessState {
                grants,
                balances: HashMap::new(),
                credited: HashSet::new(),
            }),
        })
    }

    /// The pinned admin subject.
    pub fn admin(&self) -> RequesterId {
        self.admin
    }

    /// Premium if the subject holds an unexpired grant, free otherwise.
    pub async fn check_access(&self, subject: RequesterId) -> AccessLevel {
        let state = self.state.lock().await;
        let now = Utc::now();
        match state.grants.get(&subject) {
            Some(record) if !record.is_expired_at(now) => AccessLevel::Premium,
            _ => AccessLevel::Free,
        }
    }

    /// Convenience wrapper over [`check_access`](Self::check_access).
    pub async fn is_premium(&self, subject: RequesterId) -> bool {
        self.check_access(subject).await == AccessLevel::Premium
    }

    /// Atomically consume one token. Returns false when the balance is zero;
    /// the balance never goes negative, even under concurrent callers.
    pub async fn consume_token(&self, subject: RequesterId) -> bool {
        let mut state = self.state.lock().await;
        let signup = self.signup_tokens;
        let balance = state.balances.entry(subject).or_insert(signup);
        if *balance > 0 {
            *balance -= 1;
            debug!(subject = subject.0, remaining = *balance, "Token consumed");
            true
        } else {
            false
        }
    }

    /// Current token balance for a subject.
    pub async fn balance(&self, subject: RequesterId) -> u32 {
        let mut state = self.state.lock().await;
        let signup = self.signup_tokens;
        *state.balances.entry(subject).or_insert(signup)
    }

    /// Add tokens to a subject's balance, returning the new balance.
    pub async fn credit_tokens(&self, subject: RequesterId, count: u32) -> u32 {
        let mut state = self.state.lock().await;
        let signup = self.signup_tokens;
        let balance = state.balances.entry(subject).or_insert(signup);
        *balance = balance.saturating_add(count);
        info!(subject = subject.0, balance = *balance, "Tokens credited");
        *balance
    }

    /// Pay the referral bonus to both sides of a first-time referral.
    ///
    /// Self-referrals and repeat referrals by the same new subject are
    /// rejected without crediting anyone.
    pub async fn credit_referral(&self, new_subject: RequesterId, inviter: RequesterId) -> bool {
        let mut state = self.state.lock().await;
        if new_subject == inviter || state.credited.contains(&new_subject) {
            return false;
        }
        state.credited.insert(new_subject);
        let signup = self.signup_tokens;
        let bonus = self.referral_bonus;
        for subject in [inviter, new_subject] {
            let balance = state.balances.entry(subject).or_insert(signup);
            *balance = balance.saturating_add(bonus);
        }
        info!(
            new_subject = new_subject.0,
            inviter = inviter.0,
            bonus,
            "Referral credited"
        );
        true
    }

    /// Idempotent upsert of a premium grant expiring `days` from now.
    ///
    /// Granting to the admin only adjusts the batch limit; the admin's
    /// expiry stays unbounded.
    pub async fn grant(&self, subject: RequesterId, days: i64, batch_limit: u32) -> Result<()> {
        let mut state = self.state.lock().await;
        let record = if subject == self.admin {
            GrantRecord::unbounded(batch_limit)
        } else {
            GrantRecord {
                expiry: Utc::now() + ChronoDuration::days(days),
                batch_limit,
            }
        };
        state.grants.insert(subject, record);
        self.store.save(&state.grants).await?;
        info!(subject = subject.0, days, batch_limit, "Premium granted");
        Ok(())
    }

    /// Remove a subject's grant. Returns whether anything was removed; the
    /// admin entry is never removed.
    pub async fn revoke(&self, subject: RequesterId) -> Result<bool> {
        if subject == self.admin {
            warn!(subject = subject.0, "Refusing to revoke the admin grant");
            return Ok(false);
        }
        let mut state = self.state.lock().await;
        let removed = state.grants.remove(&subject).is_some();
        if removed {
            self.store.save(&state.grants).await?;
            info!(subject = subject.0, "Premium revoked");
        }
        Ok(removed)
    }

    /// Batch-size ceiling: the active grant's limit, or the free ceiling.
    pub async fn batch_limit(&self, subject: RequesterId) -> u32 {
        let state = self.state.lock().await;
        let now = Utc::now();
        match state.grants.get(&subject) {
            Some(record) if !record.is_expired_at(now) => record.batch_limit,
            _ => self.free_batch_limit,
        }
    }

    /// All active grants, sorted by subject id for stable admin output.
    pub async fn premium_list(&self) -> Vec<(RequesterId, GrantRecord)> {
        let state = self.state.lock().await;
        let now = Utc::now();
        let mut list: Vec<(RequesterId, GrantRecord)> = state
            .grants
            .iter()
            .filter(|(_, record)| !record.is_expired_at(now))
            .map(|(subject, record)| (*subject, record.clone()))
            .collect();
        list.sort_by_key(|(subject, _)| *subject);
        list
    }

    /// Whether any grant entry exists for the subject, expired or not.
    pub async fn has_grant_entry(&self, subject: RequesterId) -> bool {
        self.state.lock().await.grants.contains_key(&subject)
    }

    /// Drop expired grants, never touching the admin entry. Persists only
    /// when something was removed. Returns the number of removals.
    pub async fn purge_expired(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let admin = self.admin;
        let before = state.grants.len();
        state
            .grants
            .retain(|subject, record| *subject == admin || !record.is_expired_at(now));
        let removed = before - state.grants.len();
        if removed > 0 {
            self.store.save(&state.grants).await?;
            info!(removed, "Purged expired grants");
        }
        Ok(removed)
    }

    /// Spawn the periodic purge loop; stops when `cancel` fires.
    pub fn spawn_purge_loop(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so startup does not
            // double-purge right after open().
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = controller.purge_expired().await {
                            warn!(error = %e, "Grant purge failed");
                        }
                    }
                    _ = cancel.cancelled() => {
                        debug!("Purge loop stopped");
                        break;
                    }
                }
            }
        })
    }
}
