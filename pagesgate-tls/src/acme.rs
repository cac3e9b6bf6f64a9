//! ACME protocol client using instant-acme
//!
//! 🔐 Certificate issuance against an ACME CA, behind the
//! [`CertificateAuthority`] seam so the orchestrator can be driven by a stub.

use crate::cert_store::{CertStoreError, CertificateOrigin, CertificateResource};
use crate::challenge::{ChallengeHandler, ChallengeResponse};
use async_trait::async_trait;
use instant_acme::{
    Account, AuthorizationStatus, ChallengeType as AcmeChallengeType, Identifier, NewOrder,
    Order, OrderStatus, RetryPolicy,
};
use std::sync::Arc;
use thiserror::Error;

/// ACME error types
#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("🔴 ACME protocol error: {0}")]
    Protocol(#[from] instant_acme::Error),

    #[error("⚠️ Challenge failed: {0}")]
    ChallengeFailed(String),

    #[error("❌ Order failed: {0}")]
    OrderFailed(String),

    #[error("🔧 Certificate generation error: {0}")]
    CertGeneration(String),

    #[error("📜 Invalid certificate: {0}")]
    InvalidCertificate(#[from] CertStoreError),

    #[error("⚙️ Configuration error: {0}")]
    Config(String),
}

/// ACME challenge types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeType {
    /// 🌐 HTTP-01 challenge (port 80)
    Http01,
    /// 📡 DNS-01 challenge
    Dns01,
    /// 🔒 TLS-ALPN-01 challenge (port 443)
    TlsAlpn01,
}

impl ChallengeType {
    fn to_acme(self) -> AcmeChallengeType {
        match self {
            ChallengeType::Http01 => AcmeChallengeType::Http01,
            ChallengeType::Dns01 => AcmeChallengeType::Dns01,
            ChallengeType::TlsAlpn01 => AcmeChallengeType::TlsAlpn01,
        }
    }
}

/// Something that can issue certificates.
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// 📜 Issue a certificate covering `domains`; the first one is canonical.
    async fn obtain(&self, domains: &[String]) -> Result<CertificateResource, AcmeError>;

    /// 🔄 Re-issue `previous` for the names on its leaf.
    async fn renew(&self, previous: &CertificateResource) -> Result<CertificateResource, AcmeError> {
        let mut domains = previous.leaf_domains()?;
        if let Some(pos) = domains.iter().position(|d| d == &previous.domain) {
            let canonical = domains.remove(pos);
            domains.insert(0, canonical);
        }
        self.obtain(&domains).await
    }

    /// Whether wildcard names can be validated (requires DNS-01)
    fn supports_wildcard(&self) -> bool;
}

type Responder = (ChallengeType, Arc<dyn ChallengeHandler>);

/// 🔐 ACME client bound to one account and a set of challenge responders
pub struct AcmeClient {
    account: Account,
    /// Tried in order; the first type the CA offers wins
    handlers: Vec<Responder>,
}

impl AcmeClient {
    pub fn new(account: Account) -> Self {
        Self {
            account,
            handlers: Vec::new(),
        }
    }

    /// 🎯 Register a responder for a challenge type
    pub fn with_handler(mut self, challenge_type: ChallengeType, handler: Arc<dyn ChallengeHandler>) -> Self {
        self.handlers.push((challenge_type, handler));
        self
    }

    pub fn challenge_types(&self) -> Vec<ChallengeType> {
        self.handlers.iter().map(|(t, _)| *t).collect()
    }

    /// Deploy a responder for every pending authorization and wait for the
    /// order to become ready. Deployed responses are pushed to `deployed`.
    async fn authorize(&self, order: &mut Order, deployed: &mut Vec<(Arc<dyn ChallengeHandler>, ChallengeResponse)>) -> Result<(), AcmeError> {
        {
            let mut authorizations = order.authorizations();
            while let Some(result) = authorizations.next().await {
                let mut authz = result?;

                if authz.status == AuthorizationStatus::Valid {
                    tracing::info!("✅ Authorization already valid");
                    continue;
                }

                let identifier = authz.identifier().to_string();
                let domain = identifier.trim_start_matches("*.").to_string();

                let offered: Vec<AcmeChallengeType> =
                    authz.challenges.iter().map(|c| c.r#type.clone()).collect();
                let (challenge_type, handler) = self
                    .handlers
                    .iter()
                    .find(|(t, _)| offered.contains(&t.to_acme()))
                    .cloned()
                    .ok_or_else(|| {
                        AcmeError::ChallengeFailed(format!(
                            "No supported challenge for {} (configured {:?})",
                            identifier,
                            self.challenge_types()
                        ))
                    })?;

                let mut challenge = authz.challenge(challenge_type.to_acme()).ok_or_else(|| {
                    AcmeError::ChallengeFailed(format!("No {:?} challenge available for {}", challenge_type, identifier))
                })?;

                let key_auth = challenge.key_authorization();
                let response = ChallengeResponse {
                    domain: domain.clone(),
                    challenge_type,
                    token: challenge.token.clone(),
                    key_authorization: key_auth.as_str().to_string(),
                    dns_value: key_auth.dns_value(),
                };

                handler.deploy(&response).await?;
                deployed.push((handler, response));
                tracing::info!("🚀 {:?} challenge deployed for {}", challenge_type, identifier);

                challenge.set_ready().await?;
            }
        }

        tracing::info!("⏳ Waiting for order to become ready...");
        let status = order.poll_ready(&RetryPolicy::default()).await?;
        if status != OrderStatus::Ready {
            return Err(AcmeError::OrderFailed(format!(
                "Order status is {:?} (not Ready)",
                status
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl CertificateAuthority for AcmeClient {
    async fn obtain(&self, domains: &[String]) -> Result<CertificateResource, AcmeError> {
        let canonical = domains
            .first()
            .ok_or_else(|| AcmeError::OrderFailed("No domains requested".to_string()))?;

        tracing::info!("🔐 Obtain certificate for domains: {:?}", domains);

        let identifiers: Vec<Identifier> = domains.iter().map(|d| Identifier::Dns(d.clone())).collect();
        let mut order = self.account.new_order(&NewOrder::new(&identifiers)).await?;

        let mut deployed = Vec::new();
        let authorized = self.authorize(&mut order, &mut deployed).await;

        for (handler, response) in &deployed {
            if let Err(e) = handler.cleanup(response).await {
                tracing::warn!("🧹 Challenge cleanup failed for {}: {}", response.domain, e);
            }
        }
        authorized?;

        tracing::info!("🔧 Finalizing order and generating certificate...");
        let key_pem = order.finalize().await?;
        let chain_pem = order.poll_certificate(&RetryPolicy::default()).await?;

        let resource = CertificateResource::from_pem(
            canonical.clone(),
            chain_pem,
            key_pem,
            CertificateOrigin::Acme,
        )?;

        tracing::info!("🎉 Certificate obtained for {:?}, valid until {}", domains, resource.valid_till);
        Ok(resource)
    }

    fn supports_wildcard(&self) -> bool {
        self.handlers.iter().any(|(t, _)| *t == ChallengeType::Dns01)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::mock_certificate;
    use parking_lot::Mutex;

    struct RecordingAuthority {
        requests: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl CertificateAuthority for RecordingAuthority {
        async fn obtain(&self, domains: &[String]) -> Result<CertificateResource, AcmeError> {
            self.requests.lock().push(domains.to_vec());
            Err(AcmeError::OrderFailed("recorded".to_string()))
        }

        fn supports_wildcard(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_default_renew_uses_leaf_names() {
        let authority = RecordingAuthority {
            requests: Mutex::new(Vec::new()),
        };
        let previous = mock_certificate("blog.example.com", "test").unwrap();

        assert!(authority.renew(&previous).await.is_err());
        assert_eq!(
            authority.requests.lock().as_slice(),
            &[vec!["blog.example.com".to_string()]]
        );
    }

    #[test]
    fn test_challenge_type_mapping() {
        assert_eq!(ChallengeType::TlsAlpn01.to_acme(), AcmeChallengeType::TlsAlpn01);
        assert_eq!(ChallengeType::Dns01.to_acme(), AcmeChallengeType::Dns01);
        assert_eq!(ChallengeType::Http01.to_acme(), AcmeChallengeType::Http01);
    }
}
