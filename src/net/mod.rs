//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop)
//!     → tls.rs (mandatory mTLS handshake, identity extraction)
//!     → policy check (OU vs upstream tags)
//!     → Hand off to the forwarder
//! ```

pub mod listener;
pub mod tls;

pub use listener::{DownstreamListener, ListenerError, Server};
pub use tls::{ClientIdentity, TlsError};
