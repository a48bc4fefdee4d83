//! Messenger transport seam consumed by the relay pipeline
//!
//! The pipeline never speaks the upstream wire protocol itself; everything it
//! needs from the messaging system goes through [`MessengerClient`].
//! Implementations wrap a real client library and map its failures onto the
//! crate error taxonomy — in particular, upstream rate-limit signals must come
//! back as [`Error::RateLimited`](crate::error::Error::RateLimited) with the
//! signaled wait attached, since both worker pools key their backoff on it.

use crate::error::Result;
use crate::types::{MediaKind, MessageId, RequesterId, VideoMeta};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Resolved address of a chat, ready for upstream calls
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PeerHandle {
    /// Private chat reachable only through the requester's own dialogs
    Private {
        /// Canonical chat id (the `-100`-prefixed form)
        chat_id: i64,
        /// Per-session credential the upstream requires alongside the id
        access_hash: i64,
    },
    /// Public chat addressed by handle
    Public(String),
}

/// Dialog map for one requester: canonical chat id → peer handle
///
/// Built once per requester by [`MessengerClient::load_peers`] and cached by
/// the pipeline; only private references consult it.
pub type PeerMap = HashMap<i64, PeerHandle>;

/// One remote item as the pipeline sees it
#[derive(Debug, Clone)]
pub struct RemoteItem {
    /// Item id within its chat
    pub id: MessageId,
    /// Attached media payload, if any
    pub media: Option<RemoteMedia>,
    /// Caption text carried by the item
    pub caption: Option<String>,
}

impl RemoteItem {
    /// Whether this item carries a relayable payload.
    pub fn has_media(&self) -> bool {
        self.media.is_some()
    }
}

/// Description of an item's media payload
#[derive(Debug, Clone)]
pub struct RemoteMedia {
    /// Payload kind; drives delivery framing
    pub kind: MediaKind,
    /// Server-reported payload size in bytes, when known
    pub size: Option<u64>,
    /// Original file name, when the payload carries one
    pub file_name: Option<String>,
    /// Streaming attributes, present for videos
    pub video: Option<VideoMeta>,
}

/// Media kind to match during a forward scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaFilter {
    /// Photo items only
    Photos,
    /// Video items only
    Videos,
}

/// Framing applied to an outgoing payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaFraming {
    /// Streamable video carrying duration and dimensions
    Streaming(VideoMeta),
    /// Photo rendered inline
    Inline,
    /// Generic attachment, with the original file name when known
    Attachment {
        /// File name to present to the recipient
        file_name: Option<String>,
    },
}

impl MediaFraming {
    /// Derive the framing for a payload from its kind and metadata.
    ///
    /// A video without streaming attributes degrades to an attachment rather
    /// than claiming streamability it cannot back up.
    pub fn derive(
        kind: MediaKind,
        video: Option<VideoMeta>,
        file_name: Option<String>,
    ) -> Self {
        match (kind, video) {
            (MediaKind::Video, Some(meta)) => Self::Streaming(meta),
            (MediaKind::Photo, _) => Self::Inline,
            _ => Self::Attachment { file_name },
        }
    }
}

/// Fully framed outgoing payload handed to the transport
#[must_use]
#[derive(Debug, Clone)]
pub struct MediaDelivery {
    /// Spool file holding the payload bytes
    pub payload: PathBuf,
    /// Presentation framing
    pub framing: MediaFraming,
    /// Caption to attach
    pub caption: Option<String>,
    /// Thumbnail image beside the payload, for streaming framing
    pub thumbnail: Option<PathBuf>,
}

/// Interface to the upstream messaging system
///
/// One implementation serves every requester; calls carry the requester so
/// implementations backed by per-user sessions can route to the right one.
/// All methods map upstream failures onto the crate taxonomy: a rate-limit
/// signal becomes `RateLimited { wait }`, a dead or missing session becomes
/// `Session`, an unreachable chat or item becomes `SourceUnavailable`.
#[async_trait]
pub trait MessengerClient: Send + Sync {
    /// Load the requester's dialog map for private-chat resolution.
    ///
    /// # Errors
    ///
    /// Returns `Session` when the requester has no usable session, or
    /// `RateLimited` when the upstream throttles the dialog listing.
    async fn load_peers(&self, requester: RequesterId) -> Result<PeerMap>;

    /// Fetch a single item by id.
    ///
    /// # Errors
    ///
    /// Returns `SourceUnavailable` when the item does not exist or the peer
    /// cannot be read.
    async fn fetch_item(
        &self,
        requester: RequesterId,
        peer: &PeerHandle,
        item: MessageId,
    ) -> Result<RemoteItem>;

    /// Scan items of one media kind strictly after `anchor`, ascending by id,
    /// at most `limit` items.
    async fn scan_media(
        &self,
        requester: RequesterId,
        peer: &PeerHandle,
        anchor: MessageId,
        filter: MediaFilter,
        limit: u32,
    ) -> Result<Vec<RemoteItem>>;

    /// Download an item's payload into the spool file at `dest`.
    ///
    /// # Errors
    ///
    /// Returns `RateLimited` with the signaled wait on throttling, or
    /// `TransferFailed` on any other interruption.
    async fn download_media(
        &self,
        requester: RequesterId,
        peer: &PeerHandle,
        item: &RemoteItem,
        dest: &Path,
    ) -> Result<()>;

    /// Download a video thumbnail next to the payload.
    ///
    /// Returns `Ok(None)` when the item has no thumbnail; failure to fetch an
    /// existing thumbnail is an error the caller may choose to tolerate.
    async fn download_thumbnail(
        &self,
        requester: RequesterId,
        peer: &PeerHandle,
        item: &RemoteItem,
        dest: &Path,
    ) -> Result<Option<PathBuf>>;

    /// Deliver a framed payload to the requester.
    ///
    /// # Errors
    ///
    /// Returns `RateLimited` with the signaled wait on throttling, or
    /// `TransferFailed` on any other interruption.
    async fn send_media(&self, requester: RequesterId, delivery: &MediaDelivery) -> Result<()>;

    /// Server-side copy of an item straight to the requester, skipping the
    /// download/upload pipeline. Not every item is copyable; callers fall
    /// back to the pipeline on any error.
    async fn copy_item(
        &self,
        requester: RequesterId,
        peer: &PeerHandle,
        item: MessageId,
    ) -> Result<()>;

    /// Send a short text notice to the requester, returning its id so it can
    /// be edited or deleted later (progress and completion surfaces).
    async fn send_notice(&self, requester: RequesterId, text: &str) -> Result<MessageId>;

    /// Edit a previously sent notice in place.
    async fn edit_notice(
        &self,
        requester: RequesterId,
        notice: MessageId,
        text: &str,
    ) -> Result<()>;

    /// Delete a previously sent notice.
    async fn delete_notice(&self, requester: RequesterId, notice: MessageId) -> Result<()>;
}
