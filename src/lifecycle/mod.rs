//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (main.rs):
//!     Load config → Validate → Build forwarder + listeners → Serve
//!
//! Shutdown (shutdown.rs):
//!     Signal received → listeners stop accepting → manager stops
//!     → trackers cancel → in-flight connections drain
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - One root cancellation token; every long-running task descends from it
//! - Ordered shutdown: stop accept, stop health, cancel connections

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::wait_for_signal;
