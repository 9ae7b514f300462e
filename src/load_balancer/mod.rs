//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Health events from heartbeats
//!     → manager.rs (single consumer, routes to the named upstream)
//!     → upstream.rs (tracker + heartbeat set + readiness flag)
//!     → tracker.rs:
//!         track/untrack healthy backends
//!         least-connections pick for each forward
//!         cancellation wiring between backends and in-flight connections
//! ```
//!
//! # Design Decisions
//! - Active connections are tracked as cancellable handles, not counters,
//!   so evicting a backend aborts its in-flight connections
//! - All tracker map mutations run under one mutex; the critical section
//!   never performs I/O
//! - Least-connections ties break on the first minimum; the winner's count
//!   rises immediately, so later ties land elsewhere

pub mod manager;
pub mod tracker;
pub mod upstream;

use thiserror::Error;

pub use manager::UpstreamManager;
pub use tracker::{CancelCause, ConnectionGuard, ConnectionId, ConnectionTracker};
pub use upstream::Upstream;

/// Errors surfaced by upstream lookup and backend selection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpstreamError {
    #[error("upstream is not ready for requests")]
    NotReady,

    #[error("upstream '{0}' was not found")]
    NotFound(String),
}
