//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Probe (checker.rs):
//!     TCP dial with deadline
//!     → Success / Failed with edge detection
//!
//! Heartbeat (heartbeat.rs):
//!     Periodic timer per backend
//!     → run probe under timeout
//!     → emit status-change events to the shared channel
//!     → consumed by the upstream manager
//! ```
//!
//! # Design Decisions
//! - Probes report `changed` so consumers only see transitions
//! - A probe timeout is an expected outcome, not an error
//! - Heartbeats stop via cancellation tokens; event emission races the
//!   stop token so a full channel can never wedge shutdown

pub mod checker;
pub mod heartbeat;

pub use checker::{Checked, HealthCheck, ProbeStatus, TcpHealthCheck};
pub use heartbeat::{BackendHealth, BackendHeartbeat, HealthEvent, UpstreamHeartbeats};
