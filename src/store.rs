//! Durable grant storage
//!
//! The access controller owns grants in memory; this module is the
//! persistence seam behind it. The default implementation is a JSON flat
//! file mapping subject id to grant record, written on every mutation with
//! already-expired entries filtered out.

use crate::error::Result;
use crate::types::RequesterId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::warn;

/// One premium entitlement as held in memory and persisted
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantRecord {
    /// When premium treatment ends
    pub expiry: DateTime<Utc>,
    /// Batch-size ceiling attached to the grant
    pub batch_limit: u32,
}

impl GrantRecord {
    /// Whether the grant has lapsed as of `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry <= now
    }

    /// A grant that never lapses in practice (admin entry).
    pub fn unbounded(batch_limit: u32) -> Self {
        Self {
            expiry: far_future(),
            batch_limit,
        }
    }
}

/// Expiry stamp for the admin entry: end of year 9999, which keeps the
/// serialized form a plain four-digit-year RFC 3339 timestamp.
pub fn far_future() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(253_402_300_799, 0).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Persistence seam for the grant map.
///
/// `load` runs once at startup; `save` runs on every mutation and after a
/// purge that removed something. Implementations must drop entries already
/// expired at save time and tolerate loading from nothing.
#[async_trait::async_trait]
pub trait GrantStore: Send + Sync {
    /// Load all persisted grants; no backing data yields an empty map.
    async fn load(&self) -> Result<HashMap<RequesterId, GrantRecord>>;

    /// Persist the grant map, excluding entries already expired.
    async fn save(&self, grants: &HashMap<RequesterId, GrantRecord>) -> Result<()>;
}

/// Flat-file [`GrantStore`]: one pretty-printed JSON object, subject ids as
/// keys, written in place. The parent directory is created on first save.
pub struct JsonGrantStore {
    path: PathBuf,
}

impl JsonGrantStore {
    /// Create a store backed by `path`. Nothing is touched until the first
    /// load or save.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The backing file path.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait::async_trait]
impl GrantStore for JsonGrantStore {
    async fn load(&self) -> Result<HashMap<RequesterId, GrantRecord>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(HashMap::new());
            }
            Err(e) => return Err(e.into()),
        };
        let grants: HashMap<RequesterId, GrantRecord> = serde_json::from_slice(&bytes)?;
        Ok(grants)
    }

    async fn save(&self, grants: &HashMap<RequesterId, GrantRecord>) -> Result<()> {
        let now = Utc::now();
        let live: HashMap<&RequesterId, &GrantRecord> = grants
            .iter()
            .filter(|(_, record)| !record.is_expired_at(now))
            .collect();

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_vec_pretty(&live)?;
        if let Err(e) = tokio::fs::write(&self.path, &json).await {
            warn!(path = %self.path.display(), error = %e, "Failed to write grant store");
            return Err(e.into());
        }
        Ok(())
    }
}
