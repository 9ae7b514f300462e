//! Downstream TLS termination.
//!
//! # Responsibilities
//! - Load the root CA, server certificate, and private key
//! - Build the rustls server configuration: TLS 1.3 only, client
//!   certificates required and verified against the root CA
//! - Extract the authenticated subject (CN, first OU) from the peer's leaf
//!   certificate
//!
//! # Design Decisions
//! - Uses rustls (no OpenSSL dependency)
//! - One trust anchor for both directions: the root CA signs the server
//!   certificate and every acceptable client certificate
//! - Handshake deadlines live in the listener, not here

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::config::TlsConfig;

/// Error type for TLS setup and identity extraction.
#[derive(Debug)]
pub enum TlsError {
    /// Certificate or key material could not be read.
    Io(String, std::io::Error),
    /// Certificate or key material was present but unusable.
    Invalid(String),
    /// The peer certificate lacks a usable CN or OU.
    NoClientIdentity,
}

impl std::fmt::Display for TlsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsError::Io(path, e) => write!(f, "failed to read '{}': {}", path, e),
            TlsError::Invalid(msg) => write!(f, "invalid TLS material: {}", msg),
            TlsError::NoClientIdentity => {
                write!(f, "client certificate has no CN or OU set")
            }
        }
    }
}

impl std::error::Error for TlsError {}

/// The authenticated subject of a client certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    /// Common name; identifies the user and keys the rate limiter.
    pub common_name: String,
    /// First organizational unit; the authorization principal.
    pub organizational_unit: String,
}

fn read_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::Io(path.to_string(), e))?;
    let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut BufReader::new(file)).collect();
    let certs = certs.map_err(|e| TlsError::Io(path.to_string(), e))?;
    if certs.is_empty() {
        return Err(TlsError::Invalid(format!("no certificates in '{}'", path)));
    }
    Ok(certs)
}

fn read_private_key(path: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::Io(path.to_string(), e))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| TlsError::Io(path.to_string(), e))?
        .ok_or_else(|| TlsError::Invalid(format!("no private key in '{}'", path)))
}

/// Build the downstream server configuration from certificate paths.
pub fn server_config(tls: &TlsConfig) -> Result<Arc<ServerConfig>, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in read_certs(&tls.root_ca_path)? {
        roots
            .add(cert)
            .map_err(|e| TlsError::Invalid(e.to_string()))?;
    }

    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| TlsError::Invalid(e.to_string()))?;

    let config = ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_client_cert_verifier(verifier)
        .with_single_cert(read_certs(&tls.cert_path)?, read_private_key(&tls.key_path)?)
        .map_err(|e| TlsError::Invalid(e.to_string()))?;

    Ok(Arc::new(config))
}

/// Extract CN and first OU from a verified peer leaf certificate.
pub fn client_identity(cert: &CertificateDer<'_>) -> Result<ClientIdentity, TlsError> {
    let (_, parsed) =
        X509Certificate::from_der(cert.as_ref()).map_err(|_| TlsError::NoClientIdentity)?;

    let common_name = parsed
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .filter(|cn| !cn.is_empty())
        .ok_or(TlsError::NoClientIdentity)?
        .to_string();

    let organizational_unit = parsed
        .subject()
        .iter_organizational_unit()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .filter(|ou| !ou.is_empty())
        .ok_or(TlsError::NoClientIdentity)?
        .to_string();

    Ok(ClientIdentity {
        common_name,
        organizational_unit,
    })
}
