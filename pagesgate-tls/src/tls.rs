//! TLS termination
//!
//! 🔒 Reads the ClientHello before choosing a certificate, so issuance can
//! happen inside the handshake and `acme-tls/1` validations get their
//! challenge certificate.

use crate::challenge::ACME_TLS_ALPN_PROTOCOL;
use crate::resolver::{CertResolver, ResolveError};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::rustls;
use tokio_rustls::rustls::crypto::{CryptoProvider, ring};
use tokio_rustls::rustls::server::{Acceptor, ClientHello, ResolvesServerCert};
use tokio_rustls::rustls::sign::CertifiedKey;
use tokio_rustls::rustls::{ServerConfig, SupportedCipherSuite};
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;

/// ALPN protocols offered on regular connections
pub const HTTP_ALPN_PROTOCOLS: [&[u8]; 3] = [b"h2", b"http/1.1", ACME_TLS_ALPN_PROTOCOL];

/// TLS errors
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("💥 IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("🔧 TLS configuration error: {0}")]
    Config(#[from] rustls::Error),

    #[error("🔍 {0}")]
    Resolve(#[from] ResolveError),
}

fn cipher_suites() -> Vec<SupportedCipherSuite> {
    use ring::cipher_suite::*;
    vec![
        // TLS 1.3
        TLS13_AES_128_GCM_SHA256,
        TLS13_AES_256_GCM_SHA384,
        TLS13_CHACHA20_POLY1305_SHA256,
        // TLS 1.2
        TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
        TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
        TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
    ]
}

/// 🔐 Install ring as the process-wide rustls provider.
///
/// The ACME HTTP client builds its TLS configuration from the process
/// default, which rustls cannot pick by itself when more than one provider
/// is compiled in.
pub fn install_crypto_provider() {
    if CryptoProvider::get_default().is_none() {
        // losing a race against another installer is fine
        let _ = ring::default_provider().install_default();
    }
}

/// Serves one already chosen certificate
#[derive(Debug)]
struct FixedCert(Option<Arc<CertifiedKey>>);

impl ResolvesServerCert for FixedCert {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.0.clone()
    }
}

/// Build the server configuration template: TLS 1.2 and 1.3 with the
/// restricted suite list, advertising `alpn`.
pub fn server_config(alpn: &[&[u8]]) -> Result<ServerConfig, TlsError> {
    let provider = CryptoProvider {
        cipher_suites: cipher_suites(),
        ..ring::default_provider()
    };

    let mut config = ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(FixedCert(None)));
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(config)
}

/// 🔒 Accepts TLS connections, resolving certificates per handshake
pub struct TlsAcceptor {
    resolver: Arc<CertResolver>,
    http: ServerConfig,
    challenge: ServerConfig,
}

impl TlsAcceptor {
    pub fn new(resolver: Arc<CertResolver>) -> Result<Self, TlsError> {
        Ok(Self {
            resolver,
            http: server_config(&HTTP_ALPN_PROTOCOLS)?,
            challenge: server_config(&[ACME_TLS_ALPN_PROTOCOL])?,
        })
    }

    pub fn resolver(&self) -> &Arc<CertResolver> {
        &self.resolver
    }

    /// Run the handshake on `stream`. Returns the TLS stream and the
    /// lower-cased server name.
    pub async fn accept<IO>(&self, stream: IO) -> Result<(TlsStream<IO>, String), TlsError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let start = LazyConfigAcceptor::new(Acceptor::default(), stream).await?;

        let (server_name, alpn) = {
            let hello = start.client_hello();
            let server_name = hello.server_name().map(str::to_ascii_lowercase);
            let alpn: Vec<Vec<u8>> = hello
                .alpn()
                .map(|protocols| protocols.map(<[u8]>::to_vec).collect())
                .unwrap_or_default();
            (server_name, alpn)
        };
        let alpn: Vec<&[u8]> = alpn.iter().map(Vec::as_slice).collect();

        let key = self.resolver.resolve(server_name.as_deref(), &alpn).await?;

        let template = if alpn.contains(&ACME_TLS_ALPN_PROTOCOL) {
            &self.challenge
        } else {
            &self.http
        };
        let mut config = template.clone();
        config.cert_resolver = Arc::new(FixedCert(Some(key)));

        let tls = start.into_stream(Arc::new(config)).await?;
        Ok((tls, server_name.unwrap_or_default()))
    }
}
