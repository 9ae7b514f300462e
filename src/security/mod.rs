//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Accepted TLS connection
//!     → policy.rs (client OU vs upstream tags, deny by default)
//!     → rate_limit.rs (per-client token bucket, drop on empty)
//!     → forwarder
//! ```
//!
//! # Design Decisions
//! - Authorization happens before any rate-limit token is spent
//! - Denials are audit-logged with user and upstream
//! - Buckets are per client identity and live for the process lifetime

pub mod policy;
pub mod rate_limit;

pub use policy::{PolicyEnforcer, PolicyError, PolicyQuery};
pub use rate_limit::PerClientRateLimiter;
