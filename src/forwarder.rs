//! Connection forwarding.
//!
//! # Data Flow
//! ```text
//! Accepted, authorized downstream connection
//!     → rate limit check (drop on empty bucket)
//!     → upstream lookup by name
//!     → tracker pick (least connections) + cancellation scope
//!     → dial backend (plaintext TCP)
//!     → splice bytes both ways until EOF, error, or cancellation
//! ```
//!
//! # Design Decisions
//! - Either copy direction finishing tears down both sockets; half-open
//!   states are not preserved at layer 4
//! - No redial: a failed backend dial ends the request
//! - The splice runs under the connection's tracker scope, so evicting the
//!   backend aborts the copies

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::config::BalancerConfig;
use crate::load_balancer::{
    CancelCause, ConnectionGuard, UpstreamError, UpstreamManager,
};
use crate::observability::metrics;
use crate::security::PerClientRateLimiter;

/// How long a forward waits for a not-yet-ready upstream before giving up.
const READY_GRACE: Duration = Duration::from_secs(1);

/// Everything needed to forward one accepted connection.
pub struct ForwardRequest<S> {
    /// Name of the upstream pool to forward to.
    pub upstream: String,
    /// The accepted, already-authenticated downstream connection.
    pub stream: S,
    /// Client identity used as the rate-limit key.
    pub client_key: String,
}

/// Errors produced while forwarding a single connection.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("client '{key}' has exceeded its rate limit")]
    RateLimited { key: String },

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("failed to dial backend: {0}")]
    Dial(#[source] io::Error),

    #[error("connection cancelled: {}", .cause.map(|c| c.to_string()).unwrap_or_else(|| "cancelled by caller".to_string()))]
    Cancelled { cause: Option<CancelCause> },

    #[error("failed to forward connection: {0}")]
    Copy(String),
}

/// The seam between listeners and the forwarding engine. Listeners only
/// ever see this trait, so tests can swap in recording stubs.
pub trait Forwarder: Send + Sync + 'static {
    fn forward<S>(
        &self,
        parent: CancellationToken,
        request: ForwardRequest<S>,
    ) -> impl Future<Output = Result<(), ForwardError>> + Send
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static;
}

/// Production forwarder: least-connections balancing over the manager's
/// healthy backends, gated by the per-client rate limiter.
pub struct LeastConnectionsForwarder {
    manager: Arc<UpstreamManager>,
    rate_limiter: PerClientRateLimiter,
}

impl LeastConnectionsForwarder {
    /// Build the manager, start heartbeats for every configured upstream,
    /// and wrap it all in a forwarder.
    pub fn from_config(config: &BalancerConfig) -> Self {
        let manager = UpstreamManager::new();
        for upstream in &config.upstreams {
            manager.load_upstream(upstream, &config.health_check);
        }
        Self {
            manager,
            rate_limiter: PerClientRateLimiter::new(
                config.rate_limit.max_tokens,
                config.rate_limit.token_refill_per_second,
            ),
        }
    }

    pub fn manager(&self) -> &Arc<UpstreamManager> {
        &self.manager
    }

    /// Stop the manager: heartbeats, trackers, and with them every
    /// in-flight connection.
    pub async fn stop(&self) {
        self.manager.stop().await;
    }

    async fn dial(&self, guard: &ConnectionGuard) -> Result<TcpStream, ForwardError> {
        tokio::select! {
            connected = TcpStream::connect(guard.addr()) => {
                connected.map_err(ForwardError::Dial)
            }
            _ = guard.cancelled() => Err(cancelled_error(guard)),
        }
    }
}

impl Forwarder for LeastConnectionsForwarder {
    async fn forward<S>(
        &self,
        parent: CancellationToken,
        request: ForwardRequest<S>,
    ) -> Result<(), ForwardError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if !self.rate_limiter.allow(&request.client_key) {
            metrics::record_rate_limited(&request.client_key);
            return Err(ForwardError::RateLimited {
                key: request.client_key,
            });
        }

        let upstream = self.manager.get_upstream(&request.upstream)?;
        // Give a freshly started upstream a moment; selection below still
        // decides for itself
        let _ = upstream.wait_ready(READY_GRACE).await;

        let guard = upstream.tracker.next(&parent)?;
        let backend = self.dial(&guard).await?;

        tracing::debug!(
            upstream = %request.upstream,
            backend = %guard.addr(),
            client = %request.client_key,
            "Forwarding connection"
        );
        metrics::record_forward(&request.upstream, guard.addr());

        splice(request.stream, backend, &guard).await
    }
}

/// Copy bytes in both directions until either side finishes or the
/// connection scope is cancelled. Whichever direction ends first tears the
/// other down as well.
async fn splice<S>(
    downstream: S,
    upstream: TcpStream,
    guard: &ConnectionGuard,
) -> Result<(), ForwardError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (down_read, down_write) = tokio::io::split(downstream);
    let (up_read, up_write) = tokio::io::split(upstream);

    let done = CancellationToken::new();
    let inbound = tokio::spawn(copy_half(
        down_read,
        up_write,
        done.clone(),
        guard.token().clone(),
    ));
    let outbound = tokio::spawn(copy_half(
        up_read,
        down_write,
        done.clone(),
        guard.token().clone(),
    ));

    let (inbound, outbound) = tokio::join!(inbound, outbound);

    if guard.is_cancelled() {
        return Err(cancelled_error(guard));
    }

    let mut failures = Vec::new();
    for result in [inbound, outbound] {
        match result {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => failures.push(e.to_string()),
            Err(join) => failures.push(join.to_string()),
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(ForwardError::Copy(failures.join("; ")))
    }
}

/// One copy direction. On completion (EOF, error, peer direction done, or
/// cancellation) it half-closes its write side and fires the shared done
/// token so the opposite direction unwinds too.
async fn copy_half<R, W>(
    mut read: R,
    mut write: W,
    done: CancellationToken,
    cancel: CancellationToken,
) -> io::Result<u64>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let result = tokio::select! {
        copied = tokio::io::copy(&mut read, &mut write) => copied,
        _ = done.cancelled() => Ok(0),
        _ = cancel.cancelled() => Err(io::Error::new(
            io::ErrorKind::ConnectionAborted,
            "connection scope cancelled",
        )),
    };
    let _ = write.shutdown().await;
    done.cancel();
    result
}

fn cancelled_error(guard: &ConnectionGuard) -> ForwardError {
    ForwardError::Cancelled {
        cause: guard.cause(),
    }
}
