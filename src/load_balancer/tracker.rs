//! Connection tracking and backend selection.
//!
//! # Responsibilities
//! - Track the healthy backends of one upstream
//! - Track every in-flight connection against the backend serving it
//! - Pick the least-loaded backend for each new connection
//! - Propagate backend eviction to every connection routed through it
//!
//! # State Machine
//! ```text
//!        track_backend            untrack_backend(cause)
//!  ──▶ Untracked ─────▶ Tracked ───────────────────▶ Untracked
//!        ▲                 │  (backend token fires; every
//!        │                 │   routed connection observes
//!        │                 ▼   the cause and deregisters)
//!        └──── (re-tracked when healthy again)
//! ```
//!
//! # Design Decisions
//! - Connection ID is u64; identity for deregistration, nothing more
//! - Each connection gets one watcher task that listens to the backend
//!   token, the caller's token, and the connection's own token; whichever
//!   fires first settles the cause, cancels the connection, removes it from
//!   the active set, and ends the watcher. A released connection therefore
//!   holds no leftover subscription a later eviction could re-fire
//! - Cancellation causes ride in OnceLock slots written before the token
//!   they describe is fired

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use tokio_util::sync::CancellationToken;

pub type ConnectionId = u64;

/// Why a connection scope was cancelled from the balancer side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelCause {
    BackendUnhealthy,
    BackendRemoved,
}

impl std::fmt::Display for CancelCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelCause::BackendUnhealthy => write!(f, "backend is unhealthy"),
            CancelCause::BackendRemoved => write!(f, "backend config has been removed"),
        }
    }
}

#[derive(Debug)]
struct BackendEntry {
    cancel: CancellationToken,
    cause: Arc<OnceLock<CancelCause>>,
}

#[derive(Default, Debug)]
struct TrackerState {
    /// Healthy backends by address, each with its set of active connections.
    /// The set size is the backend's active-connection count.
    healthy_backends: HashMap<String, HashSet<ConnectionId>>,
    /// Cancellation handle per tracked backend. Keys mirror
    /// `healthy_backends` exactly; both maps change together under the lock.
    backend_cancel: HashMap<String, BackendEntry>,
}

/// Tracks healthy backends and in-flight connections for one upstream.
#[derive(Debug)]
pub struct ConnectionTracker {
    upstream: String,
    /// Parent of every backend token; cancelling it tears down everything.
    root: CancellationToken,
    root_cause: Arc<OnceLock<CancelCause>>,
    next_id: AtomicU64,
    state: Arc<Mutex<TrackerState>>,
}

impl ConnectionTracker {
    pub fn new(upstream: impl Into<String>) -> Self {
        Self {
            upstream: upstream.into(),
            root: CancellationToken::new(),
            root_cause: Arc::new(OnceLock::new()),
            next_id: AtomicU64::new(0),
            state: Arc::new(Mutex::new(TrackerState::default())),
        }
    }

    /// Start routing connections to `addr`. Idempotent.
    pub fn track_backend(&self, addr: &str) {
        let mut state = self.state.lock().expect("tracker mutex poisoned");
        if !state.healthy_backends.contains_key(addr) {
            tracing::info!(upstream = %self.upstream, addr = %addr, "Tracking backend");
            state.healthy_backends.insert(addr.to_string(), HashSet::new());
            state.backend_cancel.insert(
                addr.to_string(),
                BackendEntry {
                    cancel: self.root.child_token(),
                    cause: Arc::new(OnceLock::new()),
                },
            );
        }
    }

    /// Stop routing to `addr` and cancel every connection currently routed
    /// through it with `cause`. Idempotent; connections observe the
    /// cancellation asynchronously.
    pub fn untrack_backend(&self, addr: &str, cause: CancelCause) {
        let mut state = self.state.lock().expect("tracker mutex poisoned");
        // Heartbeats can report the same transition more than once; only the
        // first untrack does anything.
        if let Some(entry) = state.backend_cancel.remove(addr) {
            tracing::info!(
                upstream = %self.upstream,
                addr = %addr,
                reason = %cause,
                "Untracking backend"
            );
            state.healthy_backends.remove(addr);
            let _ = entry.cause.set(cause);
            entry.cancel.cancel();
        }
    }

    /// Number of connections currently routed to `addr`.
    pub fn backend_active_conns(&self, addr: &str) -> usize {
        let state = self.state.lock().expect("tracker mutex poisoned");
        state
            .healthy_backends
            .get(addr)
            .map(|conns| conns.len())
            .unwrap_or(0)
    }

    /// Cancel every backend and, transitively, every in-flight connection.
    pub fn cancel_all(&self, cause: CancelCause) {
        let _ = self.root_cause.set(cause);
        self.root.cancel();
    }

    /// Pick the least-loaded healthy backend and register a connection
    /// against it.
    ///
    /// The returned guard carries the scope the caller must run the dial and
    /// copies under: it is cancelled when the caller's `parent` token fires
    /// or when the backend is untracked. Dropping the guard releases the
    /// connection.
    pub fn next(&self, parent: &CancellationToken) -> Result<ConnectionGuard, super::UpstreamError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let (addr, backend_cancel, backend_cause) = {
            let mut state = self.state.lock().expect("tracker mutex poisoned");
            if state.healthy_backends.is_empty() {
                return Err(super::UpstreamError::NotReady);
            }
            let addr = least_connections(&state.healthy_backends);
            if let Some(conns) = state.healthy_backends.get_mut(&addr) {
                conns.insert(id);
            }
            let entry = &state.backend_cancel[&addr];
            (addr, entry.cancel.clone(), Arc::clone(&entry.cause))
        };

        Ok(self.attach(parent, addr, id, backend_cancel, backend_cause))
    }

    /// Wire the dual-cancellation watcher for an already-registered
    /// connection and hand out its guard.
    fn attach(
        &self,
        parent: &CancellationToken,
        addr: String,
        id: ConnectionId,
        backend_cancel: CancellationToken,
        backend_cause: Arc<OnceLock<CancelCause>>,
    ) -> ConnectionGuard {
        let effective = CancellationToken::new();
        let cause = Arc::new(OnceLock::new());

        let watcher_effective = effective.clone();
        let watcher_cause = Arc::clone(&cause);
        let root_cause = Arc::clone(&self.root_cause);
        let parent = parent.clone();
        let state = Arc::clone(&self.state);
        let watcher_addr = addr.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = backend_cancel.cancelled() => {
                    let cause = backend_cause
                        .get()
                        .copied()
                        .or_else(|| root_cause.get().copied())
                        .unwrap_or(CancelCause::BackendRemoved);
                    let _ = watcher_cause.set(cause);
                    watcher_effective.cancel();
                }
                _ = parent.cancelled() => {
                    watcher_effective.cancel();
                }
                // Released by the guard; nothing left to cancel
                _ = watcher_effective.cancelled() => {}
            }

            let mut state = state.lock().expect("tracker mutex poisoned");
            if let Some(conns) = state.healthy_backends.get_mut(&watcher_addr) {
                conns.remove(&id);
            }
        });

        ConnectionGuard {
            addr,
            effective,
            cause,
        }
    }

    /// Register a connection against a specific backend, bypassing the
    /// least-connections pick. Test seam for exercising selection.
    #[cfg(test)]
    fn seed(&self, parent: &CancellationToken, addr: &str) -> ConnectionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (backend_cancel, backend_cause) = {
            let mut state = self.state.lock().expect("tracker mutex poisoned");
            state
                .healthy_backends
                .get_mut(addr)
                .expect("seeding an untracked backend")
                .insert(id);
            let entry = &state.backend_cancel[addr];
            (entry.cancel.clone(), Arc::clone(&entry.cause))
        };
        self.attach(parent, addr.to_string(), id, backend_cancel, backend_cause)
    }
}

/// Scan for the backend with the fewest active connections. First minimum
/// wins on ties. Callers must hold the state lock.
fn least_connections(healthy_backends: &HashMap<String, HashSet<ConnectionId>>) -> String {
    healthy_backends
        .iter()
        .min_by_key(|(_, conns)| conns.len())
        .map(|(addr, _)| addr.clone())
        .expect("least_connections on empty backend map")
}

/// One registered connection: the scope its I/O runs under, plus its release
/// path. Dropping the guard cancels the scope, which deregisters the
/// connection from its backend's active set.
#[derive(Debug)]
pub struct ConnectionGuard {
    addr: String,
    effective: CancellationToken,
    cause: Arc<OnceLock<CancelCause>>,
}

impl ConnectionGuard {
    /// Address of the backend this connection was routed to.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// The cancellation scope for this connection's dial and copies.
    pub fn token(&self) -> &CancellationToken {
        &self.effective
    }

    /// Wait for the scope to be cancelled.
    pub async fn cancelled(&self) {
        self.effective.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.effective.is_cancelled()
    }

    /// The balancer-side cancellation cause, if the scope was ended by
    /// backend eviction or teardown rather than by the caller.
    pub fn cause(&self) -> Option<CancelCause> {
        self.cause.get().copied()
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.effective.cancel();
    }
}
