//! Core types for tg-relay

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Unique identifier for a requesting user (and grant subject)
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequesterId(pub i64);

impl RequesterId {
    /// Create a new RequesterId
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the inner i64 value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<i64> for RequesterId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl From<RequesterId> for i64 {
    fn from(id: RequesterId) -> Self {
        id.0
    }
}

impl PartialEq<i64> for RequesterId {
    fn eq(&self, other: &i64) -> bool {
        self.0 == *other
    }
}

impl PartialEq<RequesterId> for i64 {
    fn eq(&self, other: &RequesterId) -> bool {
        *self == other.0
    }
}

impl std::fmt::Display for RequesterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RequesterId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Identifier minted for each admitted relay task, used for tracing and
/// spool-file naming
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl TaskId {
    /// Create a new TaskId
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the inner u64 value
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a text notice in the destination chat (progress indicator)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl MessageId {
    /// Create a new MessageId
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the inner i64 value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether a source chat is addressed through the requester's private dialog
/// list or by public handle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Reachable only through the requester's own dialogs
    Private,
    /// Reachable by public handle
    Public,
}

/// A source chat reference, already in canonical form
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRef {
    /// Canonical private chat id (`-100 * internal id` from the link form)
    Private(i64),
    /// Public chat handle
    Public(String),
}

impl ChatRef {
    /// Visibility class of this reference
    pub fn visibility(&self) -> Visibility {
        match self {
            ChatRef::Private(_) => Visibility::Private,
            ChatRef::Public(_) => Visibility::Public,
        }
    }
}

impl std::fmt::Display for ChatRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatRef::Private(id) => write!(f, "{id}"),
            ChatRef::Public(handle) => write!(f, "{handle}"),
        }
    }
}

/// One media item in the upstream system: a chat reference plus an item id
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    /// The chat holding the item
    pub chat: ChatRef,
    /// Item id within the chat
    pub item: i64,
}

impl std::fmt::Display for SourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.chat, self.item)
    }
}

/// Kind of media carried by an item, driving delivery framing
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Streamable video
    Video,
    /// Inline photo
    Photo,
    /// Anything else, delivered as a generic attachment
    Document,
}

impl MediaKind {
    /// Spool-file extension for this kind
    pub fn extension(&self) -> &'static str {
        match self {
            MediaKind::Video => "mp4",
            MediaKind::Photo => "jpg",
            MediaKind::Document => "bin",
        }
    }
}

/// Inline video metadata forwarded from fetch to delivery framing
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoMeta {
    /// Playback length in seconds
    pub duration_secs: u32,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
}

/// An admitted relay task waiting for (or undergoing) fetch
#[derive(Clone, Debug)]
pub struct DownloadTask {
    /// Task identifier minted at admission
    pub id: TaskId,
    /// Requesting user, also the delivery destination
    pub requester: RequesterId,
    /// What to fetch
    pub source: SourceRef,
    /// Fetch attempts performed so far (rate-limit requeues)
    pub attempts: u32,
    /// Whether the task belongs to a batch session
    pub batch: bool,
}

/// A fetched payload waiting for (or undergoing) delivery
#[derive(Clone, Debug)]
pub struct UploadJob {
    /// Task identifier carried over from the originating task
    pub task: TaskId,
    /// Delivery destination
    pub requester: RequesterId,
    /// Spool file holding the payload
    pub payload: PathBuf,
    /// Media kind, drives framing
    pub kind: MediaKind,
    /// Video metadata when kind is Video
    pub video: Option<VideoMeta>,
    /// Original attachment name for documents
    pub file_name: Option<String>,
    /// Caption text carried from the source item
    pub caption: String,
    /// Spooled single-frame thumbnail for video, when the source had one
    pub thumbnail: Option<PathBuf>,
    /// Whether the job belongs to a batch session
    pub batch: bool,
}

/// Access class returned by the admission gate
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    /// Active time-boxed grant; bypasses token consumption
    Premium,
    /// No active grant; each relay consumes a token
    Free,
}

/// Outcome of a single-item relay request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Delivered through the server-side fast copy, no pipeline round trip
    Copied(TaskId),
    /// Admitted to the task queue for the full fetch/deliver pipeline
    Queued(TaskId),
}

/// Pipeline stage reporting a rate-limit signal
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStage {
    /// Download side (source fetch)
    Fetch,
    /// Upload side (destination delivery)
    Deliver,
}

/// Snapshot of queue depths for the admin surface
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct QueueDepths {
    /// Tasks waiting for a download worker
    pub tasks: usize,
    /// Jobs waiting for an upload worker
    pub jobs: usize,
    /// Whether new relays are still admitted
    pub accepting_new: bool,
}

/// Event emitted during relay lifecycle
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Task admitted to the task queue
    TaskQueued {
        /// Task identifier
        task: TaskId,
        /// Requesting user
        requester: RequesterId,
    },

    /// Rate-limited fetch pushed back for another attempt
    TaskRequeued {
        /// Task identifier
        task: TaskId,
        /// Requesting user
        requester: RequesterId,
        /// Attempt number just completed
        attempt: u32,
    },

    /// Task dropped on the fetch side (terminal, no retry)
    TaskDropped {
        /// Task identifier
        task: TaskId,
        /// Requesting user
        requester: RequesterId,
        /// Why the task was dropped
        reason: String,
    },

    /// Payload fetched and spooled; job handed to the send queue
    PayloadSpooled {
        /// Task identifier
        task: TaskId,
        /// Requesting user
        requester: RequesterId,
        /// Media kind of the spooled payload
        kind: MediaKind,
    },

    /// Payload delivered to the requester
    Delivered {
        /// Task identifier
        task: TaskId,
        /// Requesting user
        requester: RequesterId,
        /// Position within the requester's batch (1 for singles)
        sent: u32,
        /// Batch size when part of a batch
        #[serde(skip_serializing_if = "Option::is_none")]
        total: Option<u32>,
    },

    /// Delivery abandoned after a non-rate-limit transport failure
    JobAbandoned {
        /// Task identifier
        task: TaskId,
        /// Requesting user
        requester: RequesterId,
        /// Error message
        error: String,
    },

    /// Single-item relay completed through the server-side fast copy
    FastPathDelivered {
        /// Task identifier
        task: TaskId,
        /// Requesting user
        requester: RequesterId,
    },

    /// Upstream rate-limit signal observed
    RateLimited {
        /// Stage that hit the limit
        stage: PipelineStage,
        /// Signaled mandatory wait in seconds
        wait_secs: u64,
        /// Task identifier
        task: TaskId,
    },

    /// Batch mode opened; awaiting a size choice
    BatchOpened {
        /// Requesting user
        requester: RequesterId,
        /// Batch-size ceiling offered
        limit: u32,
    },

    /// Batch size accepted; awaiting the first reference
    BatchSized {
        /// Requesting user
        requester: RequesterId,
        /// Accepted size
        total: u32,
    },

    /// Forward scan finished; tasks enqueued for the batch
    BatchQueued {
        /// Requesting user
        requester: RequesterId,
        /// Tasks enqueued by this reference
        queued: u32,
        /// Requested batch size
        total: u32,
    },

    /// Batch cancelled; bookkeeping cleared, queued tasks still run
    BatchCancelled {
        /// Requesting user
        requester: RequesterId,
    },

    /// Batch finished; delivered may be short of total
    BatchComplete {
        /// Requesting user
        requester: RequesterId,
        /// Jobs actually delivered
        delivered: u32,
        /// Requested batch size
        total: u32,
    },

    /// Premium grant created or extended
    GrantUpdated {
        /// Grant subject
        subject: RequesterId,
        /// Grant length in days
        days: i64,
        /// Batch-size ceiling on the grant
        batch_limit: u32,
    },

    /// Premium grant revoked
    GrantRevoked {
        /// Grant subject
        subject: RequesterId,
    },

    /// Tokens credited to a subject
    TokensCredited {
        /// Credited subject
        subject: RequesterId,
        /// Balance after the credit
        balance: u32,
    },

    /// Both queues drained by the admin surface
    QueuesDrained {
        /// Tasks removed from the task queue
        tasks: usize,
        /// Jobs removed from the send queue
        jobs: usize,
    },

    /// Entity cache cleared by the admin surface
    EntityCacheCleared,

    /// Per-requester state dropped (logout or admin cleanup)
    RequesterForgotten {
        /// Forgotten subject
        subject: RequesterId,
    },

    /// Graceful shutdown initiated
    Shutdown,
}
