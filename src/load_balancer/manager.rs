//! Upstream registry and health-event consumption.
//!
//! # Responsibilities
//! - Own every upstream by name
//! - Run the single consumer over the shared health-event channel
//! - Translate health transitions into tracker track/untrack calls
//! - Tear everything down in order on stop

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{HealthCheckConfig, UpstreamConfig};
use crate::health::{
    BackendHealth, BackendHeartbeat, HealthEvent, TcpHealthCheck,
};
use crate::load_balancer::tracker::CancelCause;
use crate::load_balancer::upstream::Upstream;
use crate::load_balancer::UpstreamError;
use crate::observability::metrics;

/// Capacity of the shared health-event channel. Emitters block (racing
/// their stop token) when it fills; events are never dropped.
const HEALTH_EVENT_BUFFER: usize = 16;

/// Owns all upstreams and routes health events to their trackers.
pub struct UpstreamManager {
    upstreams: RwLock<HashMap<String, Arc<Upstream>>>,
    /// Taken (dropped) on stop to close the event channel.
    events_tx: Mutex<Option<mpsc::Sender<HealthEvent>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl UpstreamManager {
    /// Create the manager and spawn its event consumer.
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::channel(HEALTH_EVENT_BUFFER);
        let manager = Arc::new(Self {
            upstreams: RwLock::new(HashMap::new()),
            events_tx: Mutex::new(Some(tx)),
            consumer: Mutex::new(None),
        });

        let consumer = tokio::spawn(Arc::clone(&manager).consume(rx));
        *manager.consumer.lock().expect("manager mutex poisoned") = Some(consumer);

        manager
    }

    async fn consume(self: Arc<Self>, mut rx: mpsc::Receiver<HealthEvent>) {
        while let Some(event) = rx.recv().await {
            match event.status {
                BackendHealth::Healthy => self.handle_healthy(&event.upstream, &event.addr),
                BackendHealth::Unhealthy => {
                    if let Some(error) = &event.error {
                        tracing::error!(
                            upstream = %event.upstream,
                            backend = %event.addr,
                            error = %error,
                            "Backend probe error"
                        );
                    }
                    self.handle_unhealthy(&event.upstream, &event.addr);
                }
            }
        }
    }

    fn handle_healthy(&self, upstream: &str, addr: &str) {
        tracing::info!(upstream = %upstream, backend = %addr, "Backend healthy");
        let Ok(up) = self.get_upstream(upstream) else {
            tracing::error!(upstream = %upstream, "Health event for unknown upstream");
            return;
        };
        up.tracker.track_backend(addr);
        up.mark_ready();
        metrics::record_backend_health(addr, true);
    }

    fn handle_unhealthy(&self, upstream: &str, addr: &str) {
        tracing::info!(upstream = %upstream, backend = %addr, "Backend unhealthy");
        let Ok(up) = self.get_upstream(upstream) else {
            tracing::error!(upstream = %upstream, "Health event for unknown upstream");
            return;
        };
        up.tracker.untrack_backend(addr, CancelCause::BackendUnhealthy);
        metrics::record_backend_health(addr, false);
    }

    /// Create the upstream described by `config` (if new) and start a
    /// heartbeat for each of its backends.
    pub fn load_upstream(&self, config: &UpstreamConfig, health: &HealthCheckConfig) {
        let up = {
            let mut upstreams = self.upstreams.write().expect("manager lock poisoned");
            Arc::clone(
                upstreams
                    .entry(config.name.clone())
                    .or_insert_with(|| Arc::new(Upstream::new(config.name.clone()))),
            )
        };

        let tx = {
            let events_tx = self.events_tx.lock().expect("manager mutex poisoned");
            match events_tx.as_ref() {
                Some(tx) => tx.clone(),
                // Already stopped; nothing to probe for
                None => return,
            }
        };

        for backend in &config.backends {
            up.heartbeats.start(
                BackendHeartbeat {
                    upstream: config.name.clone(),
                    addr: backend.clone(),
                    checker: Box::new(TcpHealthCheck::new(backend.clone())),
                    period: Duration::from_secs(health.interval_secs),
                    timeout: Duration::from_secs(health.timeout_secs),
                },
                tx.clone(),
            );
        }
    }

    pub fn get_upstream(&self, name: &str) -> Result<Arc<Upstream>, UpstreamError> {
        let upstreams = self.upstreams.read().expect("manager lock poisoned");
        upstreams
            .get(name)
            .cloned()
            .ok_or_else(|| UpstreamError::NotFound(name.to_string()))
    }

    /// Tear down: close the event channel, stop every heartbeat, cancel
    /// every tracker (aborting all in-flight connections), then wait for
    /// the consumer to drain.
    pub async fn stop(&self) {
        self.events_tx
            .lock()
            .expect("manager mutex poisoned")
            .take();

        let upstreams: Vec<Arc<Upstream>> = {
            let upstreams = self.upstreams.read().expect("manager lock poisoned");
            upstreams.values().cloned().collect()
        };
        for up in &upstreams {
            up.heartbeats.stop_all().await;
        }
        for up in &upstreams {
            up.tracker.cancel_all(CancelCause::BackendRemoved);
        }

        let consumer = self.consumer.lock().expect("manager mutex poisoned").take();
        if let Some(consumer) = consumer {
            let _ = consumer.await;
        }
        tracing::info!("Upstream manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn eventually(mut probe: impl FnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while tokio::time::Instant::now() < deadline {
            if probe() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        probe()
    }

    fn fast_health() -> HealthCheckConfig {
        HealthCheckConfig {
            interval_secs: 1,
            timeout_secs: 1,
        }
    }

    #[tokio::test]
    async fn test_healthy_event_tracks_and_readies() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = backend.local_addr().unwrap().to_string();

        let manager = UpstreamManager::new();
        manager.load_upstream(
            &UpstreamConfig {
                name: "web".into(),
                tags: vec![],
                backends: vec![addr.clone()],
            },
            &fast_health(),
        );

        let up = manager.get_upstream("web").unwrap();
        up.wait_ready(Duration::from_secs(2)).await.unwrap();

        let parent = tokio_util::sync::CancellationToken::new();
        let guard = up.tracker.next(&parent).unwrap();
        assert_eq!(guard.addr(), addr);

        drop(guard);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_dead_backend_gets_untracked() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = backend.local_addr().unwrap().to_string();

        let manager = UpstreamManager::new();
        manager.load_upstream(
            &UpstreamConfig {
                name: "web".into(),
                tags: vec![],
                backends: vec![addr.clone()],
            },
            &fast_health(),
        );

        let up = manager.get_upstream("web").unwrap();
        up.wait_ready(Duration::from_secs(2)).await.unwrap();

        drop(backend);
        let parent = tokio_util::sync::CancellationToken::new();
        assert!(
            eventually(|| up.tracker.next(&parent).is_err()).await,
            "backend never left the healthy set"
        );

        // Ready is sticky even with no healthy backends left
        assert!(up.is_ready());
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_upstream() {
        let manager = UpstreamManager::new();
        assert_eq!(
            manager.get_upstream("nope").unwrap_err(),
            UpstreamError::NotFound("nope".into())
        );
        manager.stop().await;
    }
}
