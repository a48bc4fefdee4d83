//! Rate-limit backoff shared by the fetch and deliver pools
//!
//! Upstream rate-limit signals carry a mandatory wait; both pools pause for
//! that wait plus a configured margin, with optional jitter so parallel
//! workers limited at the same instant do not all resume together. The two
//! pools differ only in what happens after the pause: fetch requeues the task
//! with a capped attempt count, deliver retries the same job for as long as
//! the upstream keeps signaling.
//!
//! # Example
//!
//! ```no_run
//! use tg_relay::backoff::{FloodPolicy, deliver_with_flood_retry};
//! use tg_relay::config::FloodConfig;
//!
//! # async fn example() -> tg_relay::Result<()> {
//! let policy = FloodPolicy::new(&FloodConfig::default());
//! deliver_with_flood_retry(
//!     &policy,
//!     || async { Ok::<_, tg_relay::Error>(()) },
//!     |wait| eprintln!("rate limited, pausing {wait:?}"),
//! )
//! .await?;
//! # Ok(())
//! # }
//! ```

use crate::config::FloodConfig;
use crate::error::Result;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Pause policy applied to every upstream rate-limit signal
#[derive(Debug, Clone)]
pub struct FloodPolicy {
    margin: Duration,
    jitter: bool,
}

impl FloodPolicy {
    /// Build the policy from its config section.
    pub fn new(config: &FloodConfig) -> Self {
        Self {
            margin: config.margin,
            jitter: config.jitter,
        }
    }

    /// Total pause for a signaled wait: the wait itself plus the margin,
    /// with the margin jittered up to 2x when jitter is enabled. The
    /// signaled wait is never shortened.
    pub fn pause_for(&self, wait: Duration) -> Duration {
        let margin = if self.jitter {
            add_jitter(self.margin)
        } else {
            self.margin
        };
        wait.saturating_add(margin)
    }

    /// Sleep for the full pause computed from a signaled wait.
    pub async fn sleep(&self, wait: Duration) {
        tokio::time::sleep(self.pause_for(wait)).await;
    }
}

/// Add random jitter to a delay to prevent thundering herd
///
/// Jitter is uniformly distributed between 0% and 100% of the delay, so the
/// result lands between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}

/// Run a delivery operation, pausing and retrying on every rate-limit signal.
///
/// Any other error returns immediately. `on_limited` fires once per signal
/// before the pause, with the signaled wait, so callers can log or emit an
/// event per retry.
pub async fn deliver_with_flood_retry<F, Fut, T, N>(
    policy: &FloodPolicy,
    mut operation: F,
    mut on_limited: N,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    N: FnMut(Duration),
{
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => match e.rate_limit_wait() {
                Some(wait) => {
                    on_limited(wait);
                    policy.sleep(wait).await;
                }
                None => return Err(e),
            },
        }
    }
}
