//! ACME challenge responders
//!
//! 🎯 Stage challenge answers where the CA will look for them:
//! - TLS-ALPN-01: challenge cache, keyed by domain
//! - HTTP-01: challenge cache, keyed by `domain/token`
//! - DNS-01: a named [`DnsProvider`](crate::dns::DnsProvider)

use crate::acme::{AcmeError, ChallengeType};
use crate::cache::ChallengeCache;
use async_trait::async_trait;
use rcgen::{CertificateParams, CustomExtension, KeyPair};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::rustls::sign::CertifiedKey;

/// ALPN protocol id of TLS-ALPN-01 validation handshakes
pub const ACME_TLS_ALPN_PROTOCOL: &[u8] = b"acme-tls/1";

/// How long a staged challenge stays valid
pub const CHALLENGE_TTL: Duration = Duration::from_secs(60 * 60);

/// Challenge response data
#[derive(Debug, Clone)]
pub struct ChallengeResponse {
    /// Domain being validated, without any `*.` prefix
    pub domain: String,
    /// Challenge type
    pub challenge_type: ChallengeType,
    /// Token for HTTP-01
    pub token: String,
    /// Key authorization
    pub key_authorization: String,
    /// TXT record value for DNS-01
    pub dns_value: String,
}

/// Stages and removes challenge answers
#[async_trait]
pub trait ChallengeHandler: Send + Sync {
    /// 🚀 Make the response visible to the CA
    async fn deploy(&self, challenge: &ChallengeResponse) -> Result<(), AcmeError>;

    /// 🧹 Remove the response again
    async fn cleanup(&self, challenge: &ChallengeResponse) -> Result<(), AcmeError>;
}

/// Cache key of an HTTP-01 answer
pub fn http_challenge_key(domain: &str, token: &str) -> String {
    format!("{}/{}", domain, token)
}

/// 🔒 TLS-ALPN-01 responder
pub struct TlsAlpnChallengeHandler {
    cache: Arc<ChallengeCache>,
}

impl TlsAlpnChallengeHandler {
    pub fn new(cache: Arc<ChallengeCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl ChallengeHandler for TlsAlpnChallengeHandler {
    async fn deploy(&self, challenge: &ChallengeResponse) -> Result<(), AcmeError> {
        self.cache.set(
            challenge.domain.clone(),
            challenge.key_authorization.clone(),
            CHALLENGE_TTL,
        );
        Ok(())
    }

    async fn cleanup(&self, challenge: &ChallengeResponse) -> Result<(), AcmeError> {
        self.cache.remove(&challenge.domain);
        Ok(())
    }
}

/// 🌐 HTTP-01 responder, served by the plain HTTP listener
pub struct HttpChallengeHandler {
    cache: Arc<ChallengeCache>,
}

impl HttpChallengeHandler {
    pub fn new(cache: Arc<ChallengeCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl ChallengeHandler for HttpChallengeHandler {
    async fn deploy(&self, challenge: &ChallengeResponse) -> Result<(), AcmeError> {
        self.cache.set(
            http_challenge_key(&challenge.domain, &challenge.token),
            challenge.key_authorization.clone(),
            CHALLENGE_TTL,
        );
        Ok(())
    }

    async fn cleanup(&self, challenge: &ChallengeResponse) -> Result<(), AcmeError> {
        self.cache.remove(&http_challenge_key(&challenge.domain, &challenge.token));
        Ok(())
    }
}

/// Build the self-signed certificate answering a TLS-ALPN-01 validation
/// handshake for `domain` (RFC 8737).
pub fn challenge_certificate(domain: &str, key_authorization: &str) -> Result<CertifiedKey, AcmeError> {
    let digest = Sha256::digest(key_authorization.as_bytes());

    let mut params = CertificateParams::new(vec![domain.to_string()])
        .map_err(|e| AcmeError::CertGeneration(e.to_string()))?;
    params.custom_extensions = vec![CustomExtension::new_acme_identifier(&digest)];

    let key_pair = KeyPair::generate().map_err(|e| AcmeError::CertGeneration(e.to_string()))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| AcmeError::CertGeneration(e.to_string()))?;

    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|_| AcmeError::CertGeneration("Unsupported key type".to_string()))?;

    Ok(CertifiedKey::new(vec![cert.der().clone()], signing_key))
}
