//! Backend health probes.
//!
//! # Responsibilities
//! - Probe a single backend address for liveness
//! - Detect status edges so heartbeats emit only on transitions
//!
//! # Design Decisions
//! - The TCP probe dials and immediately closes; reachability is the signal
//! - Probe timeouts are normal operation and carry no error
//! - Last status starts at an Init sentinel so the first probe always
//!   reports a change

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

/// Result of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    Success,
    Failed,
}

/// Last observed status, including the pre-first-probe sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LastStatus {
    Init,
    Success,
    Failed,
}

impl LastStatus {
    fn matches(self, status: ProbeStatus) -> bool {
        matches!(
            (self, status),
            (LastStatus::Success, ProbeStatus::Success) | (LastStatus::Failed, ProbeStatus::Failed)
        )
    }
}

impl From<ProbeStatus> for LastStatus {
    fn from(status: ProbeStatus) -> Self {
        match status {
            ProbeStatus::Success => LastStatus::Success,
            ProbeStatus::Failed => LastStatus::Failed,
        }
    }
}

/// Outcome of one probe, with edge detection against the previous probe.
#[derive(Debug)]
pub struct Checked {
    pub status: ProbeStatus,
    /// True iff this result differs from the previous probe's result.
    pub changed: bool,
    pub error: Option<std::io::Error>,
}

/// A health probe capability for a single backend.
#[async_trait]
pub trait HealthCheck: Send {
    async fn check(&mut self, deadline: Duration) -> Checked;
}

/// TCP dial probe. A completed connection means healthy; the connection is
/// closed immediately after.
pub struct TcpHealthCheck {
    addr: String,
    last: LastStatus,
}

impl TcpHealthCheck {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            last: LastStatus::Init,
        }
    }
}

#[async_trait]
impl HealthCheck for TcpHealthCheck {
    async fn check(&mut self, deadline: Duration) -> Checked {
        let (status, error) = match tokio::time::timeout(deadline, TcpStream::connect(&self.addr)).await
        {
            Ok(Ok(stream)) => {
                drop(stream);
                (ProbeStatus::Success, None)
            }
            Ok(Err(e)) => (ProbeStatus::Failed, Some(e)),
            // Hitting the deadline is expected when the backend is slow or gone
            Err(_) => (ProbeStatus::Failed, None),
        };

        let changed = !self.last.matches(status);
        self.last = status.into();

        Checked {
            status,
            changed,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_probe_healthy_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut probe = TcpHealthCheck::new(addr.to_string());
        let checked = probe.check(Duration::from_secs(1)).await;

        assert_eq!(checked.status, ProbeStatus::Success);
        assert!(checked.changed);
        assert!(checked.error.is_none());
    }

    #[tokio::test]
    async fn test_probe_unreachable_backend() {
        let mut probe = TcpHealthCheck::new("127.0.0.1:1");
        let checked = probe.check(Duration::from_secs(1)).await;

        assert_eq!(checked.status, ProbeStatus::Failed);
        assert!(checked.changed);
    }

    #[tokio::test]
    async fn test_edge_detection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut probe = TcpHealthCheck::new(addr.to_string());
        assert!(probe.check(Duration::from_secs(1)).await.changed);
        // Same result again: no edge
        assert!(!probe.check(Duration::from_secs(1)).await.changed);

        drop(listener);
        let checked = probe.check(Duration::from_secs(1)).await;
        assert_eq!(checked.status, ProbeStatus::Failed);
        assert!(checked.changed);
        // Still down: no edge
        assert!(!probe.check(Duration::from_secs(1)).await.changed);
    }
}
