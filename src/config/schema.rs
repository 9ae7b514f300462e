//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the balancer.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the load balancer.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct BalancerConfig {
    /// TLS material for the downstream (client-facing) side.
    pub tls: TlsConfig,

    /// Listener definitions mapping bind addresses to upstreams.
    pub listeners: Vec<ListenerConfig>,

    /// Upstream pool definitions.
    pub upstreams: Vec<UpstreamConfig>,

    /// Active health check settings.
    pub health_check: HealthCheckConfig,

    /// Per-client rate limiting configuration.
    pub rate_limit: RateLimitConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// TLS configuration for downstream listeners.
///
/// The root CA anchors both client-certificate verification and the server
/// certificate chain. Backends are dialed over plaintext TCP; there is no
/// upstream-side TLS.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TlsConfig {
    /// Path to the root CA certificate (PEM).
    pub root_ca_path: String,

    /// Path to the server certificate (PEM).
    pub cert_path: String,

    /// Path to the server private key (PEM).
    pub key_path: String,
}

/// A single downstream listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenerConfig {
    /// Bind address (e.g., "127.0.0.1:9000").
    pub bind_address: String,

    /// Name of the upstream this listener forwards to.
    pub upstream: String,
}

/// A named pool of interchangeable backends.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    /// Unique upstream name; listeners route by this.
    pub name: String,

    /// Organizational units authorized to reach this upstream.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Backend TCP addresses.
    #[serde(default)]
    pub backends: Vec<String>,
}

/// Active health check configuration, applied to every backend.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Probe interval in seconds.
    pub interval_secs: u64,

    /// Per-probe timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_secs: 2,
            timeout_secs: 1,
        }
    }
}

/// Rate limiting configuration, shared defaults for all per-client buckets.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Bucket capacity per client.
    pub max_tokens: u32,

    /// Continuous refill rate in tokens per second.
    /// An infinite rate disables rate limiting entirely.
    pub token_refill_per_second: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_tokens: 10,
            token_refill_per_second: 10.0,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable the Prometheus metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
