//! Downstream TLS listeners.
//!
//! # Responsibilities
//! - Bind one listener per configured route and accept connections
//! - Force the mTLS handshake to completion under a hard deadline
//! - Extract and authorize the client identity before any forwarding
//! - Hand authorized connections to the forwarder
//!
//! # Design Decisions
//! - Per-connection failures are logged and dropped, never propagated to
//!   the accept loop
//! - An accept error is fatal for the whole server: all listeners share a
//!   shutdown token, so one failure tears the rest down
//! - The handshake deadline bounds clients that connect and go silent

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::config::BalancerConfig;
use crate::forwarder::{ForwardRequest, Forwarder};
use crate::net::tls::{self, ClientIdentity};
use crate::security::{PolicyEnforcer, PolicyError, PolicyQuery};

/// The TLS handshake must finish this quickly after accept.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Error type for listener operations.
#[derive(Debug)]
pub enum ListenerError {
    /// Failed to bind to address.
    Bind(std::io::Error),
    /// Failed to accept a connection; fatal for the server.
    Accept(std::io::Error),
    /// TLS setup failed.
    Tls(tls::TlsError),
    /// The handshake failed or overran its deadline.
    Handshake(String),
    /// The peer certificate carries no usable identity.
    NoClientIdentity,
    /// The listener routes to an upstream the policy has never heard of.
    UnknownUpstream(String),
    /// The client identity is not allowed to reach this upstream.
    Unauthorized { user: String, upstream: String },
}

impl std::fmt::Display for ListenerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerError::Bind(e) => write!(f, "Failed to bind: {}", e),
            ListenerError::Accept(e) => write!(f, "Failed to accept: {}", e),
            ListenerError::Tls(e) => write!(f, "TLS setup failed: {}", e),
            ListenerError::Handshake(msg) => write!(f, "Handshake failed: {}", msg),
            ListenerError::NoClientIdentity => {
                write!(f, "Client certificate has no usable identity")
            }
            ListenerError::UnknownUpstream(name) => {
                write!(f, "Upstream '{}' was not found in config", name)
            }
            ListenerError::Unauthorized { user, upstream } => {
                write!(f, "User '{}' is not authorized for '{}'", user, upstream)
            }
        }
    }
}

impl std::error::Error for ListenerError {}

/// One bound listener forwarding to a single named upstream.
pub struct DownstreamListener<F> {
    /// Upstream this listener routes to; policy and forwarding key off it.
    upstream: String,
    listener: TcpListener,
    acceptor: TlsAcceptor,
    policy: Arc<PolicyEnforcer>,
    forwarder: Arc<F>,
}

impl<F: Forwarder> DownstreamListener<F> {
    pub async fn bind(
        bind_address: &str,
        upstream: impl Into<String>,
        acceptor: TlsAcceptor,
        policy: Arc<PolicyEnforcer>,
        forwarder: Arc<F>,
    ) -> Result<Self, ListenerError> {
        let listener = TcpListener::bind(bind_address)
            .await
            .map_err(ListenerError::Bind)?;
        Ok(Self {
            upstream: upstream.into(),
            listener,
            acceptor,
            policy,
            forwarder,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    /// Accept connections until shutdown. Only accept errors end the loop
    /// with an error; everything connection-scoped is logged and dropped.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<(), ListenerError> {
        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                accepted = self.listener.accept() => accepted.map_err(ListenerError::Accept)?,
            };

            let acceptor = self.acceptor.clone();
            let policy = Arc::clone(&self.policy);
            let forwarder = Arc::clone(&self.forwarder);
            let upstream = self.upstream.clone();
            let shutdown = shutdown.clone();

            tokio::spawn(async move {
                match handle_connection(stream, acceptor, policy, forwarder, &upstream, shutdown)
                    .await
                {
                    Ok(()) => {}
                    // Denials are already audit-logged by the policy
                    Err(ListenerError::Unauthorized { .. }) => {}
                    Err(e) => {
                        tracing::error!(
                            upstream = %upstream,
                            peer = %peer,
                            error = %e,
                            "Connection dropped"
                        );
                    }
                }
            });
        }
    }
}

/// Handshake, authenticate, authorize, forward. Any error drops the
/// connection.
async fn handle_connection<F: Forwarder>(
    stream: TcpStream,
    acceptor: TlsAcceptor,
    policy: Arc<PolicyEnforcer>,
    forwarder: Arc<F>,
    upstream: &str,
    shutdown: CancellationToken,
) -> Result<(), ListenerError> {
    // rustls only handshakes on first read/write; force it now so no rate
    // limit token is spent on a connection that never authenticates
    let stream = tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream))
        .await
        .map_err(|_| ListenerError::Handshake("handshake deadline exceeded".to_string()))?
        .map_err(|e| ListenerError::Handshake(e.to_string()))?;

    let identity = authenticate(&stream)?;

    let allowed = policy
        .query(&PolicyQuery {
            user: &identity.common_name,
            ou: &identity.organizational_unit,
            upstream,
        })
        .map_err(|e| match e {
            PolicyError::UnknownUpstream(name) => ListenerError::UnknownUpstream(name),
        })?;
    if !allowed {
        return Err(ListenerError::Unauthorized {
            user: identity.common_name,
            upstream: upstream.to_string(),
        });
    }

    // Forwarding errors are connection-scoped too
    if let Err(e) = forwarder
        .forward(
            shutdown,
            ForwardRequest {
                upstream: upstream.to_string(),
                stream,
                client_key: identity.common_name.clone(),
            },
        )
        .await
    {
        tracing::error!(
            upstream = %upstream,
            user = %identity.common_name,
            error = %e,
            "Forward failed"
        );
    }
    Ok(())
}

fn authenticate(stream: &TlsStream<TcpStream>) -> Result<ClientIdentity, ListenerError> {
    let (_, connection) = stream.get_ref();
    let peer_cert = connection
        .peer_certificates()
        .and_then(|certs| certs.first())
        .ok_or(ListenerError::NoClientIdentity)?;
    tls::client_identity(peer_cert).map_err(|_| ListenerError::NoClientIdentity)
}

/// The full downstream side: every configured listener plus the forwarder
/// they share.
pub struct Server<F> {
    downstreams: Vec<DownstreamListener<F>>,
}

impl<F: Forwarder> Server<F> {
    /// Build the server around an externally supplied forwarder.
    pub async fn with_forwarder(
        config: &BalancerConfig,
        forwarder: Arc<F>,
    ) -> Result<Self, ListenerError> {
        let policy = Arc::new(PolicyEnforcer::from_config(config));
        let acceptor = TlsAcceptor::from(tls::server_config(&config.tls).map_err(ListenerError::Tls)?);

        let mut downstreams = Vec::with_capacity(config.listeners.len());
        for listener in &config.listeners {
            downstreams.push(
                DownstreamListener::bind(
                    &listener.bind_address,
                    listener.upstream.clone(),
                    acceptor.clone(),
                    Arc::clone(&policy),
                    Arc::clone(&forwarder),
                )
                .await?,
            );
        }

        Ok(Self { downstreams })
    }

    /// Bound address of each listener with the upstream it routes to.
    pub fn routes(&self) -> Vec<(SocketAddr, String)> {
        self.downstreams
            .iter()
            .filter_map(|d| {
                d.local_addr()
                    .ok()
                    .map(|addr| (addr, d.upstream.clone()))
            })
            .collect()
    }

    /// Serve every listener until one fails or shutdown fires.
    ///
    /// The first listener error cancels its peers and is returned; a clean
    /// shutdown returns Ok.
    pub async fn listen_and_serve(self, shutdown: CancellationToken) -> Result<(), ListenerError> {
        println!("Load balancer ready for connections...");
        println!("Listening on:");
        for (addr, upstream) in self.routes() {
            println!("{} <-> {}", addr, upstream);
        }

        let mut tasks = JoinSet::new();
        for downstream in self.downstreams {
            let shutdown = shutdown.clone();
            tasks.spawn(downstream.serve(shutdown));
        }

        let mut first_error = None;
        while let Some(finished) = tasks.join_next().await {
            match finished {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                    // One listener down takes the server down
                    shutdown.cancel();
                }
                Err(join) => {
                    tracing::error!(error = %join, "Listener task panicked");
                    shutdown.cancel();
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
