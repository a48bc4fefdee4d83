//! Error types for tg-relay
//!
//! This module provides error handling for the library, including:
//! - The relay failure taxonomy (reference, source, media, transfer, access)
//! - Rate-limit signals carrying their mandatory wait duration
//! - Ambient variants for store I/O, serialization, and configuration
//! - A classifier used by both pipeline stages to pick a retry policy

use std::time::Duration;
use thiserror::Error;

/// Result type alias for tg-relay operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for tg-relay
///
/// This is the primary error type used throughout the library. Each variant
/// includes contextual information to help diagnose issues; the pipeline
/// dispatches its drop/retry policy on the variant, so callers should
/// construct the most specific variant available.
#[derive(Debug, Error)]
pub enum Error {
    /// Supplied text does not match either source-reference form
    #[error("invalid source reference: {0}")]
    InvalidReference(String),

    /// Chat or item cannot be resolved for this requester
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// Referenced item exists but carries no media payload
    #[error("no media at {reference}")]
    NoMedia {
        /// The source reference that was media-free
        reference: String,
    },

    /// Upstream rate-limit signal
    ///
    /// Carries the mandatory wait the upstream demanded. Fetch-side handling
    /// sleeps and requeues up to a cap; deliver-side handling sleeps and
    /// retries the same job until it succeeds.
    #[error("rate limited, retry after {}s", wait.as_secs())]
    RateLimited {
        /// Mandatory wait before the next call to the upstream
        wait: Duration,
    },

    /// Payload transfer failed in either direction
    #[error("transfer failed: {0}")]
    TransferFailed(String),

    /// Requester lacks premium treatment and has no token to consume,
    /// or the operation is reserved to the admin
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Conversation step mismatch or invalid selection; the session state
    /// is left unchanged so the requester can retry
    #[error("session error: {0}")]
    Session(String),

    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "spool_dir")
        key: Option<String>,
    },

    /// I/O error (spool files, grant store file)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error (grant store file, events)
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Shutdown in progress - not accepting new relays
    #[error("shutdown in progress: not accepting new relays")]
    ShuttingDown,
}

impl Error {
    /// The mandatory wait if this is a rate-limit signal, `None` otherwise.
    ///
    /// Both worker pools branch on this to separate the sleep-and-requeue /
    /// sleep-and-retry paths from terminal failures.
    pub fn rate_limit_wait(&self) -> Option<Duration> {
        match self {
            Error::RateLimited { wait } => Some(*wait),
            _ => None,
        }
    }

    /// Whether surfacing this error to the requester makes sense
    /// synchronously (detected outside a pool, e.g. while parsing or
    /// admitting a request).
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Error::InvalidReference(_)
                | Error::SourceUnavailable(_)
                | Error::NoMedia { .. }
                | Error::AccessDenied(_)
                | Error::Session(_)
        )
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // Display messages: every variant renders its context
    // -----------------------------------------------------------------------

    #[test]
    fn display_messages_include_context() {
        let cases: Vec<(Error, &str)> = vec![
            (
                Error::InvalidReference("t.me/garbage".into()),
                "invalid source reference: t.me/garbage",
            ),
            (
                Error::SourceUnavailable("chat -1001 not in dialogs".into()),
                "source unavailable: chat -1001 not in dialogs",
            ),
            (
                Error::NoMedia {
                    reference: "mychannel/42".into(),
                },
                "no media at mychannel/42",
            ),
            (
                Error::RateLimited {
                    wait: Duration::from_secs(30),
                },
                "rate limited, retry after 30s",
            ),
            (
                Error::TransferFailed("connection reset".into()),
                "transfer failed: connection reset",
            ),
            (
                Error::AccessDenied("no tokens left".into()),
                "access denied: no tokens left",
            ),
            (
                Error::Session("pick a listed size".into()),
                "session error: pick a listed size",
            ),
            (
                Error::ShuttingDown,
                "shutdown in progress: not accepting new relays",
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(
                error.to_string(),
                expected,
                "Display output drifted for {error:?}"
            );
        }
    }

    #[test]
    fn config_display_shows_message_not_key() {
        let err = Error::Config {
            message: "spool_dir must not be empty".into(),
            key: Some("pipeline.spool_dir".into()),
        };
        assert_eq!(err.to_string(), "configuration error: spool_dir must not be empty");
    }

    #[test]
    fn no_media_carries_context_text_without_chaining() {
        use std::error::Error as _;

        let err = Error::NoMedia {
            reference: "mychannel/42".into(),
        };
        assert!(
            err.source().is_none(),
            "the media-free reference is display context, not a wrapped error"
        );
        assert_eq!(err.to_string(), "no media at mychannel/42");
    }

    // -----------------------------------------------------------------------
    // rate_limit_wait: the policy dispatch hinge
    // -----------------------------------------------------------------------

    #[test]
    fn rate_limit_wait_returns_signaled_duration() {
        let err = Error::RateLimited {
            wait: Duration::from_secs(17),
        };
        assert_eq!(
            err.rate_limit_wait(),
            Some(Duration::from_secs(17)),
            "RateLimited must expose its mandatory wait"
        );
    }

    #[test]
    fn rate_limit_wait_is_none_for_every_other_variant() {
        let others: Vec<Error> = vec![
            Error::InvalidReference("x".into()),
            Error::SourceUnavailable("x".into()),
            Error::NoMedia {
                reference: "x".into(),
            },
            Error::TransferFailed("x".into()),
            Error::AccessDenied("x".into()),
            Error::Session("x".into()),
            Error::ShuttingDown,
            Error::Io(std::io::Error::other("disk fail")),
        ];
        for err in others {
            assert!(
                err.rate_limit_wait().is_none(),
                "{err:?} must not classify as a rate-limit signal"
            );
        }
    }

    // -----------------------------------------------------------------------
    // is_user_facing: which failures get surfaced synchronously
    // -----------------------------------------------------------------------

    #[test]
    fn user_facing_covers_admission_and_session_failures() {
        assert!(Error::InvalidReference("x".into()).is_user_facing());
        assert!(Error::AccessDenied("x".into()).is_user_facing());
        assert!(Error::Session("x".into()).is_user_facing());
        assert!(
            Error::NoMedia {
                reference: "x".into()
            }
            .is_user_facing()
        );
        assert!(Error::SourceUnavailable("x".into()).is_user_facing());
    }

    #[test]
    fn pool_internal_failures_are_not_user_facing() {
        assert!(
            !Error::RateLimited {
                wait: Duration::from_secs(1)
            }
            .is_user_facing(),
            "rate limits are handled inside the pools, never surfaced raw"
        );
        assert!(!Error::TransferFailed("x".into()).is_user_facing());
        assert!(!Error::ShuttingDown.is_user_facing());
        assert!(!Error::Io(std::io::Error::other("disk fail")).is_user_facing());
    }

    // -----------------------------------------------------------------------
    // From conversions for ambient errors
    // -----------------------------------------------------------------------

    #[test]
    fn io_error_converts_via_from() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)), "expected Io variant, got {err:?}");
    }

    #[test]
    fn serde_error_converts_via_from() {
        let bad = serde_json::from_str::<serde_json::Value>("{not json");
        let err: Error = bad.unwrap_err().into();
        assert!(
            matches!(err, Error::Serialization(_)),
            "expected Serialization variant, got {err:?}"
        );
    }
}
