//! Per-backend heartbeats and their per-upstream lifecycle.
//!
//! # Responsibilities
//! - Run one probe loop per backend at a fixed period
//! - Emit status-change events to the shared manager channel
//! - Start/stop heartbeats as a group per upstream

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::health::checker::{HealthCheck, ProbeStatus};

/// Backend status as reported to the upstream manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendHealth {
    Healthy,
    Unhealthy,
}

/// A status-change event for one backend.
#[derive(Debug)]
pub struct HealthEvent {
    pub upstream: String,
    pub addr: String,
    pub status: BackendHealth,
    /// Probe error, if the transition was caused by one.
    pub error: Option<std::io::Error>,
}

/// Periodic health probe for a single backend.
pub struct BackendHeartbeat {
    pub upstream: String,
    pub addr: String,
    pub checker: Box<dyn HealthCheck>,
    pub period: Duration,
    pub timeout: Duration,
}

impl BackendHeartbeat {
    /// Run one probe and emit an event if the status changed.
    ///
    /// Returns false once the heartbeat should stop: either the stop token
    /// fired or the event channel closed.
    async fn beat(&mut self, out: &mpsc::Sender<HealthEvent>, stop: &CancellationToken) -> bool {
        let checked = self.checker.check(self.timeout).await;

        let event = if checked.error.is_some() {
            HealthEvent {
                upstream: self.upstream.clone(),
                addr: self.addr.clone(),
                status: BackendHealth::Unhealthy,
                error: checked.error,
            }
        } else if checked.changed {
            let status = match checked.status {
                ProbeStatus::Success => BackendHealth::Healthy,
                ProbeStatus::Failed => BackendHealth::Unhealthy,
            };
            HealthEvent {
                upstream: self.upstream.clone(),
                addr: self.addr.clone(),
                status,
                error: None,
            }
        } else {
            return true;
        };

        // Race the send against the stop token so a full channel cannot
        // wedge shutdown.
        tokio::select! {
            _ = stop.cancelled() => false,
            sent = out.send(event) => sent.is_ok(),
        }
    }

    /// Probe loop. The first probe fires immediately, then every `period`.
    pub async fn run(mut self, out: mpsc::Sender<HealthEvent>, stop: CancellationToken) {
        tracing::info!(upstream = %self.upstream, backend = %self.addr, "Heartbeat running");

        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    if !self.beat(&out, &stop).await {
                        break;
                    }
                }
            }
        }

        tracing::info!(upstream = %self.upstream, backend = %self.addr, "Heartbeat stopped");
    }
}

#[derive(Debug)]
struct HeartbeatHandle {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// Heartbeats for every backend of one upstream.
#[derive(Debug)]
pub struct UpstreamHeartbeats {
    upstream: String,
    inner: Mutex<HashMap<String, HeartbeatHandle>>,
}

impl UpstreamHeartbeats {
    pub fn new(upstream: impl Into<String>) -> Self {
        Self {
            upstream: upstream.into(),
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn a heartbeat, forwarding its events to `out`.
    ///
    /// Starting a second heartbeat for the same address stops the previous
    /// one first.
    pub fn start(&self, heartbeat: BackendHeartbeat, out: mpsc::Sender<HealthEvent>) {
        let stop = CancellationToken::new();
        let addr = heartbeat.addr.clone();
        let task = tokio::spawn(heartbeat.run(out, stop.clone()));

        let mut inner = self.inner.lock().expect("heartbeat mutex poisoned");
        if let Some(previous) = inner.insert(addr, HeartbeatHandle { stop, task }) {
            previous.stop.cancel();
        }
    }

    /// Stop the heartbeat for one backend. Idempotent.
    pub fn stop(&self, addr: &str) {
        let mut inner = self.inner.lock().expect("heartbeat mutex poisoned");
        if let Some(handle) = inner.remove(addr) {
            handle.stop.cancel();
        }
    }

    /// Stop every heartbeat and wait for the probe tasks to finish.
    pub async fn stop_all(&self) {
        let handles: Vec<HeartbeatHandle> = {
            let mut inner = self.inner.lock().expect("heartbeat mutex poisoned");
            inner.drain().map(|(_, handle)| handle).collect()
        };

        for handle in &handles {
            handle.stop.cancel();
        }
        for handle in handles {
            let _ = handle.task.await;
        }
        tracing::debug!(upstream = %self.upstream, "All heartbeats stopped");
    }
}
