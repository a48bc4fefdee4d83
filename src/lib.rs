//! # tg-relay
//!
//! Backend library for relaying media out of restricted messenger chats.
//!
//! ## Design Philosophy
//!
//! tg-relay is designed to be:
//! - **Transport-agnostic** - Any messenger backend can plug in behind one trait
//! - **Sensible defaults** - Works out of the box with zero configuration
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//! - **Event-driven** - Consumers subscribe to events, no polling required
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tg_relay::{Config, JsonGrantStore, MediaRelay, MessengerClient};
//!
//! async fn connect_messenger() -> Arc<dyn MessengerClient> {
//!     unimplemented!("bring your own messenger transport")
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let store = Arc::new(JsonGrantStore::new(config.access.grants_path.clone()));
//!     let relay = MediaRelay::new(config, connect_messenger().await, store).await?;
//!
//!     // Subscribe to events
//!     let mut events = relay.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     relay.start().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Grants, token balances, and admission control
pub mod access;
/// Rate-limit backoff policy
pub mod backoff;
/// Messenger transport abstraction
pub mod client;
/// Configuration types
pub mod config;
/// Error types
pub mod error;
/// Source link parsing
pub mod link;
/// Core relay implementation (decomposed into focused submodules)
pub mod relay;
/// Grant persistence layer
pub mod store;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use access::AccessController;
pub use client::{
    MediaDelivery, MediaFilter, MediaFraming, MessengerClient, PeerHandle, PeerMap, RemoteItem,
    RemoteMedia,
};
pub use config::{AccessConfig, Config, FloodConfig, PipelineConfig};
pub use error::{Error, Result};
pub use link::parse_source_ref;
pub use relay::{BatchStep, MediaRelay};
pub use store::{GrantRecord, GrantStore, JsonGrantStore};
pub use types::{
    AccessLevel, ChatRef, DownloadTask, Event, MediaKind, MessageId, PipelineStage, QueueDepths,
    RelayOutcome, RequesterId, SourceRef, TaskId, UploadJob, VideoMeta,
};

/// Helper function to run the relay with graceful signal handling.
///
/// Waits for a termination signal and then calls the relay's `shutdown()`
/// method, which stops admitting work and drains in-flight deliveries.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use tg_relay::{Config, JsonGrantStore, MediaRelay, MessengerClient, run_with_shutdown};
///
/// # async fn connect_messenger() -> Arc<dyn MessengerClient> { unimplemented!() }
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = Config::default();
///     let store = Arc::new(JsonGrantStore::new(config.access.grants_path.clone()));
///     let relay = MediaRelay::new(config, connect_messenger().await, store).await?;
///     relay.start().await;
///
///     // Run with automatic signal handling
///     run_with_shutdown(relay).await;
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(relay: MediaRelay) {
    wait_for_signal().await;
    relay.shutdown().await;
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Registration can fail in sandboxed environments; degrade to whatever
    // handler set is available rather than refusing to run.
    match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("SIGTERM received, shutting down the relay"),
                _ = sigint.recv() => tracing::info!("SIGINT received, shutting down the relay"),
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable, listening for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("SIGINT received, shutting down the relay");
            } else {
                tracing::error!("No unix signal handlers available, falling back to ctrl_c");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "SIGINT handler unavailable, listening for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("SIGTERM received, shutting down the relay");
            } else {
                tracing::error!("No unix signal handlers available, falling back to ctrl_c");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Ctrl+C received, shutting down the relay"),
        Err(e) => tracing::error!(error = %e, "Unable to listen for Ctrl+C"),
    }
}
