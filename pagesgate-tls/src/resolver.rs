//! Certificate Resolver
//!
//! 🔍 Picks the certificate for every TLS handshake.
//!
//! Lookup order for a server name:
//! 1. `acme-tls/1` handshakes get a challenge certificate from the cache
//! 2. the primary domain and unclaimed names map to the primary record
//! 3. hot cache of parsed keys (15 minutes)
//! 4. certificate store, scheduling a renewal when one is due
//! 5. on-demand issuance, falling back to a mock certificate

use crate::cache::TtlCache;
use crate::cert_store::{CertStoreError, normalize_key, unix_now};
use crate::challenge::{ACME_TLS_ALPN_PROTOCOL, challenge_certificate};
use crate::manager::{CertError, CertificateManager, ObtainRequest};
use crate::acme::AcmeError;
use async_trait::async_trait;
use pagesgate_core::config::CustomDomain;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_rustls::rustls::sign::CertifiedKey;

/// How long a parsed certificate is reused without consulting the store
pub const HOT_CACHE_TTL: Duration = Duration::from_secs(15 * 60);

/// Handshake resolution errors; each one aborts the handshake.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("🚫 missing domain info via SNI (RFC 4366, Section 3.1)")]
    MissingSni,

    #[error("🎯 no challenge for {0}")]
    NoChallengeForDomain(String),

    #[error("💥 primary certificate missing from the store")]
    PrimaryCertificateMissing,

    #[error("🚫 won't request certificate for {0}")]
    IssuanceNotAllowed(String),

    #[error("💾 {0}")]
    Store(#[from] CertStoreError),

    #[error("📜 unusable certificate for {domain}: {reason}")]
    InvalidCertificate { domain: String, reason: String },

    #[error("🔒 {0}")]
    Challenge(#[from] AcmeError),

    #[error("🛡️ {0}")]
    Certificate(#[from] CertError),
}

/// A custom domain pointing at a tenant's pages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainClaim {
    pub owner: String,
    pub repo: String,
    pub branch: String,
    /// Whether the tenant's repository confirms the domain
    pub authorized: bool,
}

/// Decides which custom domains may have certificates issued.
#[async_trait]
pub trait DomainAuthority: Send + Sync {
    async fn lookup(&self, domain: &str) -> Option<DomainClaim>;
}

/// 📋 Claims taken from the `[[custom_domains]]` configuration table
#[derive(Debug, Default)]
pub struct StaticDomainAuthority {
    claims: HashMap<String, DomainClaim>,
}

impl StaticDomainAuthority {
    pub fn new(domains: &[CustomDomain]) -> Self {
        let claims = domains
            .iter()
            .map(|d| {
                let claim = DomainClaim {
                    owner: d.owner.clone(),
                    repo: d.repo.clone(),
                    branch: d.branch.clone(),
                    authorized: d.authorized,
                };
                (d.domain.trim().trim_end_matches('.').to_ascii_lowercase(), claim)
            })
            .collect();
        Self { claims }
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }
}

#[async_trait]
impl DomainAuthority for StaticDomainAuthority {
    async fn lookup(&self, domain: &str) -> Option<DomainClaim> {
        self.claims.get(domain).cloned()
    }
}

/// Where a server name's certificate lives
#[derive(Debug, PartialEq, Eq)]
struct Target {
    key: String,
    primary: bool,
    issuance_allowed: bool,
    user: Option<String>,
}

/// 🔍 Resolves server names to certificates
pub struct CertResolver {
    manager: Arc<CertificateManager>,
    authority: Arc<dyn DomainAuthority>,
    hot: TtlCache<Arc<CertifiedKey>>,
}

impl CertResolver {
    pub fn new(manager: Arc<CertificateManager>, authority: Arc<dyn DomainAuthority>) -> Self {
        Self {
            manager,
            authority,
            hot: TtlCache::new(),
        }
    }

    pub fn manager(&self) -> &Arc<CertificateManager> {
        &self.manager
    }

    /// Pick the certificate for a handshake.
    #[tracing::instrument(skip(self, alpn))]
    pub async fn resolve(
        &self,
        server_name: Option<&str>,
        alpn: &[&[u8]],
    ) -> Result<Arc<CertifiedKey>, ResolveError> {
        let domain = server_name
            .map(|name| name.trim().trim_end_matches('.').to_ascii_lowercase())
            .filter(|name| !name.is_empty())
            .ok_or(ResolveError::MissingSni)?;

        if alpn.contains(&ACME_TLS_ALPN_PROTOCOL) {
            return self.challenge(&domain);
        }

        let target = self.classify(&domain).await;

        if let Some(key) = self.hot.get(&target.key) {
            tracing::debug!("🔐 Using cached certificate for {}", target.key);
            return Ok(key);
        }

        let resource = match self.manager.store().get(&target.key).await? {
            Some(resource) => {
                if !target.primary {
                    self.manager.schedule_renewal(&target.key, &resource, unix_now());
                }
                resource
            }
            None if target.primary => {
                tracing::error!("💥 Primary certificate missing for {}, the store may be corrupt", domain);
                return Err(ResolveError::PrimaryCertificateMissing);
            }
            None if !target.issuance_allowed => {
                return Err(ResolveError::IssuanceNotAllowed(domain));
            }
            None => {
                let req = ObtainRequest {
                    domains: vec![domain.clone()],
                    previous: None,
                    user: target.user.clone(),
                    primary: false,
                };
                match self.manager.obtain(req).await {
                    Ok(resource) => resource,
                    Err(e) => {
                        tracing::warn!("⚠️ Couldn't obtain certificate for {}: {}", domain, e);
                        self.manager
                            .persist_mock(&target.key, &domain, &e.to_string())
                            .await?
                    }
                }
            }
        };

        let key = resource
            .to_certified_key()
            .map(Arc::new)
            .map_err(|e| ResolveError::InvalidCertificate {
                domain: domain.clone(),
                reason: e.to_string(),
            })?;
        self.hot.set(target.key, key.clone(), HOT_CACHE_TTL);
        Ok(key)
    }

    /// Drop a parsed certificate so the next handshake reads the store again
    pub fn invalidate(&self, domain: &str) {
        self.hot.remove(&normalize_key(domain));
    }

    /// 🧹 Drop expired parsed certificates, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        self.hot.purge_expired()
    }

    fn challenge(&self, domain: &str) -> Result<Arc<CertifiedKey>, ResolveError> {
        let key_authorization = self
            .manager
            .challenge_cache()
            .get(domain)
            .ok_or_else(|| ResolveError::NoChallengeForDomain(domain.to_string()))?;

        tracing::info!("🔒 Answering TLS-ALPN-01 validation for {}", domain);
        Ok(Arc::new(challenge_certificate(domain, &key_authorization)?))
    }

    async fn classify(&self, domain: &str) -> Target {
        let primary = Target {
            key: self.manager.primary_key().to_string(),
            primary: true,
            issuance_allowed: false,
            user: None,
        };

        if self.manager.is_primary_domain(domain) {
            return primary;
        }

        match self.authority.lookup(domain).await {
            Some(claim) if claim.authorized => Target {
                key: normalize_key(domain),
                primary: false,
                issuance_allowed: true,
                user: Some(claim.owner),
            },
            Some(_) => {
                tracing::debug!("🚫 {} is claimed but not authorized, serving the primary certificate", domain);
                primary
            }
            None => {
                tracing::debug!("❓ {} is not a known custom domain, serving the primary certificate", domain);
                primary
            }
        }
    }
}
