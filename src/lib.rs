//! Layer-4 Reverse Proxy with Mutual TLS

pub mod config;
pub mod forwarder;
pub mod health;
pub mod lifecycle;
pub mod load_balancer;
pub mod net;
pub mod observability;
pub mod security;

pub use config::schema::BalancerConfig;
pub use forwarder::{ForwardRequest, Forwarder, LeastConnectionsForwarder};
pub use lifecycle::Shutdown;
pub use net::{DownstreamListener, Server};
