//! Configuration subsystem.
//!
//! # Data Flow
//! ```text
//! TOML file on disk
//!     → loader.rs (parse, read certificate material)
//!     → validation.rs (semantic checks, referential integrity)
//!     → schema.rs types consumed by the rest of the proxy
//! ```
//!
//! # Design Decisions
//! - Configuration is loaded once at startup; no runtime reloads
//! - Validation collects every error instead of stopping at the first
//! - Certificate paths are resolved at load time so a bad path is fatal early

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{
    BalancerConfig, HealthCheckConfig, ListenerConfig, ObservabilityConfig, RateLimitConfig,
    TlsConfig, UpstreamConfig,
};
