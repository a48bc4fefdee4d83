//! Configuration types for tg-relay

use crate::types::RequesterId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Access and grant-store settings (admin subject, persistence, token economy)
///
/// Groups settings consumed by the admission gate and grant store.
/// Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccessConfig {
    /// The admin subject; always premium with unbounded expiry
    #[serde(default = "default_admin_id")]
    pub admin_id: RequesterId,

    /// Where the grant store file lives (default: "state/grants.json")
    #[serde(default = "default_grants_path")]
    pub grants_path: PathBuf,

    /// How often expired grants are purged (default: 1 hour)
    #[serde(default = "default_purge_interval", with = "duration_secs_serde")]
    pub purge_interval: Duration,

    /// Batch-size ceiling for subjects without a grant (default: 10)
    #[serde(default = "default_free_batch_limit")]
    pub free_batch_limit: u32,

    /// Token balance a previously unseen subject starts with (default: 0)
    #[serde(default)]
    pub signup_tokens: u32,

    /// Tokens paid to both sides of a successful referral (default: 3)
    #[serde(default = "default_referral_bonus")]
    pub referral_bonus: u32,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            admin_id: default_admin_id(),
            grants_path: default_grants_path(),
            purge_interval: default_purge_interval(),
            free_batch_limit: default_free_batch_limit(),
            signup_tokens: 0,
            referral_bonus: default_referral_bonus(),
        }
    }
}

/// Pipeline settings (spool storage, worker counts, queue behavior, timeouts)
///
/// Groups settings for the task/send queues and the two worker pools.
/// Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Directory for spooled payloads between fetch and delivery
    /// (default: "spool")
    #[serde(default = "default_spool_dir")]
    pub spool_dir: PathBuf,

    /// Download worker count (default: 4x available parallelism)
    #[serde(default = "default_download_workers")]
    pub download_workers: usize,

    /// Upload worker count (default: 2x available parallelism)
    #[serde(default = "default_upload_workers")]
    pub upload_workers: usize,

    /// Send-queue depth at which download workers stop pulling new tasks
    /// (default: 64)
    #[serde(default = "default_send_queue_watermark")]
    pub send_queue_watermark: usize,

    /// How long an idle worker sleeps before polling its queue again
    /// (default: 100 ms)
    #[serde(default = "default_queue_poll_interval", with = "duration_millis_serde")]
    pub queue_poll_interval: Duration,

    /// Pause after each successful delivery, applied before the requester
    /// lock is released (None = no pacing)
    #[serde(default = "default_upload_pacing", with = "optional_duration_millis_serde")]
    pub upload_pacing: Option<Duration>,

    /// Extra fetch attempts after a rate-limited first try (default: 2)
    #[serde(default = "default_fetch_retry_limit")]
    pub fetch_retry_limit: u32,

    /// Upper bound on a single fetch call; 0 disables (default: 10 minutes)
    #[serde(default = "default_fetch_timeout", with = "duration_secs_serde")]
    pub fetch_timeout: Duration,

    /// Upper bound on a single deliver call; 0 disables (default: 10 minutes)
    #[serde(default = "default_deliver_timeout", with = "duration_secs_serde")]
    pub deliver_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            spool_dir: default_spool_dir(),
            download_workers: default_download_workers(),
            upload_workers: default_upload_workers(),
            send_queue_watermark: default_send_queue_watermark(),
            queue_poll_interval: default_queue_poll_interval(),
            upload_pacing: default_upload_pacing(),
            fetch_retry_limit: default_fetch_retry_limit(),
            fetch_timeout: default_fetch_timeout(),
            deliver_timeout: default_deliver_timeout(),
        }
    }
}

/// Rate-limit backoff settings shared by both pools
///
/// Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FloodConfig {
    /// Fixed margin added on top of every signaled wait (default: 1 s)
    #[serde(default = "default_flood_margin", with = "duration_millis_serde")]
    pub margin: Duration,

    /// Add random jitter on top of wait + margin (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for FloodConfig {
    fn default() -> Self {
        Self {
            margin: default_flood_margin(),
            jitter: true,
        }
    }
}

/// Main configuration for MediaRelay
///
/// Fields are organized into logical sub-configs:
/// - [`access`](AccessConfig) — admin subject, grant persistence, tokens
/// - [`pipeline`](PipelineConfig) — spool storage, workers, queues, timeouts
/// - [`flood`](FloodConfig) — rate-limit backoff policy
///
/// All sub-config fields are flattened so the JSON format stays un-nested.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Access and grant-store settings
    #[serde(flatten)]
    pub access: AccessConfig,

    /// Pipeline settings
    #[serde(flatten)]
    pub pipeline: PipelineConfig,

    /// Rate-limit backoff settings
    #[serde(flatten)]
    pub flood: FloodConfig,
}

// Convenience accessors for the paths components reach for most often.
impl Config {
    /// Spool directory for intermediate payloads
    pub fn spool_dir(&self) -> &PathBuf {
        &self.pipeline.spool_dir
    }

    /// Grant store file path
    pub fn grants_path(&self) -> &PathBuf {
        &self.access.grants_path
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.access.admin_id.get() == 0 {
            return Err(crate::error::Error::Config {
                message: "admin_id must be set to a real subject id".into(),
                key: Some("admin_id".into()),
            });
        }
        if self.pipeline.download_workers == 0 {
            return Err(crate::error::Error::Config {
                message: "download_workers must be at least 1".into(),
                key: Some("download_workers".into()),
            });
        }
        if self.pipeline.upload_workers == 0 {
            return Err(crate::error::Error::Config {
                message: "upload_workers must be at least 1".into(),
                key: Some("upload_workers".into()),
            });
        }
        if self.pipeline.send_queue_watermark == 0 {
            return Err(crate::error::Error::Config {
                message: "send_queue_watermark must be at least 1".into(),
                key: Some("send_queue_watermark".into()),
            });
        }
        if self.pipeline.spool_dir.as_os_str().is_empty() {
            return Err(crate::error::Error::Config {
                message: "spool_dir must not be empty".into(),
                key: Some("spool_dir".into()),
            });
        }
        Ok(())
    }
}

fn default_admin_id() -> RequesterId {
    RequesterId::new(0)
}

fn default_grants_path() -> PathBuf {
    PathBuf::from("state/grants.json")
}

fn default_purge_interval() -> Duration {
    Duration::from_secs(3600)
}

fn default_free_batch_limit() -> u32 {
    10
}

fn default_referral_bonus() -> u32 {
    3
}

fn default_spool_dir() -> PathBuf {
    PathBuf::from("spool")
}

fn default_download_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 4)
        .unwrap_or(8)
}

fn default_upload_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(4)
}

fn default_send_queue_watermark() -> usize {
    64
}

fn default_queue_poll_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_upload_pacing() -> Option<Duration> {
    Some(Duration::from_secs(1))
}

fn default_fetch_retry_limit() -> u32 {
    2
}

fn default_fetch_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_deliver_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_flood_margin() -> Duration {
    Duration::from_secs(1)
}

fn default_true() -> bool {
    true
}

// Duration serialization helpers (integer seconds / milliseconds)
mod duration_secs_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

mod duration_millis_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

mod optional_duration_millis_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
