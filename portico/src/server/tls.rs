//! TLS configuration for endpoints.

use std::io::Cursor;
use std::sync::Arc;
use std::{error, fmt};

use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::{ClientHello, ResolvesServerCert};
use tokio_rustls::rustls::sign::CertifiedKey;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor as RustlsAcceptor;
use tracing::debug;

use crate::Error;

/// h2 alpn in plain format for rustls.
pub(crate) const ALPN_H2: &[u8] = b"h2";
pub(crate) const ALPN_HTTP11: &[u8] = b"http/1.1";

/// A PEM-encoded certificate chain.
#[derive(Debug, Clone)]
pub struct Certificate {
    pem: Vec<u8>,
}

impl Certificate {
    pub fn from_pem(pem: impl Into<Vec<u8>>) -> Self {
        Self { pem: pem.into() }
    }
}

/// A PEM-encoded certificate chain plus private key.
#[derive(Debug, Clone)]
pub struct Identity {
    cert: Certificate,
    key: Vec<u8>,
}

impl Identity {
    pub fn from_pem(cert: impl Into<Vec<u8>>, key: impl Into<Vec<u8>>) -> Self {
        Self {
            cert: Certificate::from_pem(cert),
            key: key.into(),
        }
    }
}

/// Supplies TLS identities keyed by server name.
///
/// This is the seam a certificate-managing collaborator plugs into; the
/// endpoint consults it during each TLS handshake that carries SNI.
pub trait HostResolver: Send + Sync + 'static {
    fn resolve(&self, server_name: &str) -> Option<Identity>;
}

/// Configures TLS settings for an endpoint.
#[derive(Clone, Default)]
pub struct ServerTlsConfig {
    identity: Option<Identity>,
    resolver: Option<Arc<dyn HostResolver>>,
}

impl fmt::Debug for ServerTlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerTlsConfig").finish()
    }
}

impl ServerTlsConfig {
    /// Creates a new `ServerTlsConfig`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the [`Identity`] of the endpoint, used directly or as the
    /// fallback when a [`HostResolver`] finds no match.
    pub fn identity(self, identity: Identity) -> Self {
        Self {
            identity: Some(identity),
            ..self
        }
    }

    /// Sets the resolver consulted per handshake for SNI-keyed
    /// identities.
    pub fn host_resolver(self, resolver: Arc<dyn HostResolver>) -> Self {
        Self {
            resolver: Some(resolver),
            ..self
        }
    }

    pub(crate) fn acceptor(&self, alpn: &[&[u8]]) -> Result<TlsAcceptor, Error> {
        let builder = ServerConfig::builder().with_no_client_auth();

        let mut config = match (&self.resolver, &self.identity) {
            (Some(resolver), fallback) => {
                let fallback = match fallback {
                    Some(identity) => Some(certified_key(identity).map_err(Error::tls)?),
                    None => None,
                };
                builder.with_cert_resolver(Arc::new(SniResolver {
                    hosts: resolver.clone(),
                    fallback,
                }))
            }
            (None, Some(identity)) => {
                let (cert, key) = load_identity(identity).map_err(Error::tls)?;
                builder.with_single_cert(cert, key).map_err(Error::tls)?
            }
            (None, None) => {
                return Err(Error::invalid_config(
                    "TLS config needs an identity or a host resolver",
                ))
            }
        };

        config.alpn_protocols = alpn.iter().map(|protocol| protocol.to_vec()).collect();
        Ok(TlsAcceptor {
            inner: Arc::new(config),
        })
    }
}

/// Resolves server certificates from a [`HostResolver`] during the
/// handshake, falling back to the endpoint identity when the name is
/// unknown or absent.
struct SniResolver {
    hosts: Arc<dyn HostResolver>,
    fallback: Option<Arc<CertifiedKey>>,
}

impl fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SniResolver").finish()
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        if let Some(name) = client_hello.server_name() {
            if let Some(identity) = self.hosts.resolve(name) {
                match certified_key(&identity) {
                    Ok(key) => return Some(key),
                    Err(err) => debug!(server_name = name, %err, "unusable resolved identity"),
                }
            }
        }
        self.fallback.clone()
    }
}

#[derive(Clone)]
pub(crate) struct TlsAcceptor {
    inner: Arc<ServerConfig>,
}

impl TlsAcceptor {
    pub(crate) async fn accept(&self, io: TcpStream) -> std::io::Result<TlsStream<TcpStream>> {
        RustlsAcceptor::from(self.inner.clone()).accept(io).await
    }
}

impl fmt::Debug for TlsAcceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsAcceptor").finish()
    }
}

#[derive(Debug)]
pub(crate) enum TlsError {
    CertificateParseError,
    PrivateKeyParseError,
}

impl fmt::Display for TlsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsError::CertificateParseError => write!(f, "error parsing TLS certificate"),
            TlsError::PrivateKeyParseError => write!(
                f,
                "error parsing TLS private key - no RSA or PKCS8-encoded keys found"
            ),
        }
    }
}

impl error::Error for TlsError {}

fn load_identity(
    identity: &Identity,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TlsError> {
    let cert = rustls_pemfile::certs(&mut Cursor::new(&identity.cert.pem))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| TlsError::CertificateParseError)?;

    let Ok(Some(key)) = rustls_pemfile::private_key(&mut Cursor::new(&identity.key)) else {
        return Err(TlsError::PrivateKeyParseError);
    };

    Ok((cert, key))
}

fn certified_key(identity: &Identity) -> Result<Arc<CertifiedKey>, TlsError> {
    let (cert, key) = load_identity(identity)?;
    let signing = tokio_rustls::rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|_| TlsError::PrivateKeyParseError)?;
    Ok(Arc::new(CertifiedKey::new(cert, signing)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_is_rejected() {
        let config = ServerTlsConfig::new();
        assert!(config.acceptor(&[ALPN_H2]).is_err());
    }

    #[test]
    fn garbage_identity_is_rejected() {
        let config = ServerTlsConfig::new().identity(Identity::from_pem("nope", "nope"));
        assert!(config.acceptor(&[ALPN_H2, ALPN_HTTP11]).is_err());
    }
}
