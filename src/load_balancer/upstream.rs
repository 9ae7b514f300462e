//! A named pool of interchangeable backends.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

use crate::health::UpstreamHeartbeats;
use crate::load_balancer::tracker::ConnectionTracker;
use crate::load_balancer::UpstreamError;

/// One upstream: its connection tracker, its heartbeat set, and a readiness
/// flag that flips on the first healthy backend.
///
/// The flag is sticky: an upstream that has ever been ready stays ready even
/// if every backend later fails. Selection still refuses in that state
/// because the healthy-backend map is empty.
#[derive(Debug)]
pub struct Upstream {
    pub name: String,
    ready: AtomicBool,
    ready_notify: Notify,
    pub tracker: ConnectionTracker,
    pub heartbeats: UpstreamHeartbeats,
}

impl Upstream {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            tracker: ConnectionTracker::new(name.clone()),
            heartbeats: UpstreamHeartbeats::new(name.clone()),
            ready: AtomicBool::new(false),
            ready_notify: Notify::new(),
            name,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Mark the upstream ready and wake anyone waiting on it.
    pub fn mark_ready(&self) {
        if !self.ready.swap(true, Ordering::AcqRel) {
            self.ready_notify.notify_waiters();
        }
    }

    /// Wait up to `timeout` for the upstream to become ready.
    ///
    /// Mostly a convenience for tests and startup grace; readiness can be
    /// stale by the time the caller acts on it, so normal traffic should
    /// just call the tracker and handle `NotReady`.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), UpstreamError> {
        let wait = async {
            loop {
                let notified = self.ready_notify.notified();
                if self.is_ready() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| UpstreamError::NotReady)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_ready_times_out() {
        let upstream = Upstream::new("web");
        assert_eq!(
            upstream.wait_ready(Duration::from_millis(20)).await,
            Err(UpstreamError::NotReady)
        );
    }

    #[tokio::test]
    async fn test_wait_ready_wakes_on_mark() {
        let upstream = std::sync::Arc::new(Upstream::new("web"));

        let waiter = {
            let upstream = upstream.clone();
            tokio::spawn(async move { upstream.wait_ready(Duration::from_secs(1)).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        upstream.mark_ready();

        assert_eq!(waiter.await.unwrap(), Ok(()));
        // Sticky: stays ready
        assert!(upstream.is_ready());
    }
}
