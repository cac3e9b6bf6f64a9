//! Certificate Manager
//!
//! 🛡️ Owns everything the certificate lifecycle shares: the store, the ACME
//! budgets, the obtain lock registry, both CA handles and the challenge
//! cache. One instance is built at startup and handed to the resolver and
//! the maintainer.

use crate::acme::{AcmeClient, AcmeError, CertificateAuthority, ChallengeType};
use crate::cache::ChallengeCache;
use crate::cert_store::{
    CertStore, CertStoreError, CertificateOrigin, CertificateResource, RETRY_BACKOFF_SECS,
    RenewalDecision, normalize_key, unix_now,
};
use crate::challenge::{HttpChallengeHandler, TlsAlpnChallengeHandler};
use crate::dns::{DnsChallengeHandler, dns_provider_by_name};
use crate::mock::{MockError, mock_certificate};
use crate::obtain_lock::{ObtainLocks, ObtainSlot};
use crate::rate_limit::AcmeLimiters;
use instant_acme::Account;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;

/// The primary certificate is renewed this long before it expires.
pub const PRIMARY_RENEWAL_WINDOW_SECS: i64 = 30 * 24 * 60 * 60;

const CLIENT_UNINITIALIZED: &str = "ACME client uninitialized. This is a server error, please report!";

/// Orchestrator errors
#[derive(Debug, Error)]
pub enum CertError {
    #[error("💾 Certificate store error: {0}")]
    Store(#[from] CertStoreError),

    #[error("🎭 Mock certificate error: {0}")]
    Mock(#[from] MockError),

    #[error("🚦 rate limit exceeded: 10 certificates per user per 24 hours ({0})")]
    UserRateLimitExceeded(String),

    #[error("⏳ certificate for {0} failed in synchronous request")]
    ConcurrentObtainFailed(String),

    #[error("⚠️ no domains requested")]
    EmptyRequest,
}

/// One call into [`CertificateManager::obtain`]
#[derive(Debug, Clone, Default)]
pub struct ObtainRequest {
    /// Names to cover; the first is canonical
    pub domains: Vec<String>,
    /// Record being renewed, if any
    pub previous: Option<CertificateResource>,
    /// Tenant asking for the certificate (per-user budget)
    pub user: Option<String>,
    /// Use the primary-domain CA handle
    pub primary: bool,
}

impl ObtainRequest {
    pub fn new(domains: Vec<String>) -> Self {
        Self {
            domains,
            ..Default::default()
        }
    }
}

/// 🛡️ Certificate lifecycle manager
pub struct CertificateManager {
    store: Arc<dyn CertStore>,
    limiters: AcmeLimiters,
    locks: Arc<ObtainLocks>,
    /// Custom domains (TLS-ALPN-01, optionally HTTP-01)
    general: Option<Arc<dyn CertificateAuthority>>,
    /// Primary wildcard domain (DNS-01 when configured)
    primary: Option<Arc<dyn CertificateAuthority>>,
    challenges: Arc<ChallengeCache>,
    /// Primary suffix with leading dot, e.g. `.pages.example.org`
    primary_suffix: String,
}

/// Builder for [`CertificateManager`]
pub struct CertificateManagerBuilder {
    store: Arc<dyn CertStore>,
    primary_suffix: String,
    use_rate_limits: bool,
    general: Option<Arc<dyn CertificateAuthority>>,
    primary: Option<Arc<dyn CertificateAuthority>>,
    challenges: Arc<ChallengeCache>,
}

impl CertificateManagerBuilder {
    pub fn rate_limits(mut self, enabled: bool) -> Self {
        self.use_rate_limits = enabled;
        self
    }

    /// CA handle for custom domains
    pub fn general_authority(mut self, authority: Arc<dyn CertificateAuthority>) -> Self {
        self.general = Some(authority);
        self
    }

    /// CA handle for the primary domain
    pub fn primary_authority(mut self, authority: Arc<dyn CertificateAuthority>) -> Self {
        self.primary = Some(authority);
        self
    }

    pub fn challenge_cache(mut self, cache: Arc<ChallengeCache>) -> Self {
        self.challenges = cache;
        self
    }

    /// 🔌 Wire both CA handles to one ACME account.
    ///
    /// The general handle answers TLS-ALPN-01 (and HTTP-01 when the HTTP
    /// listener runs). The primary handle uses DNS-01 when a provider is
    /// named, TLS-ALPN-01 otherwise.
    pub fn acme_account(
        mut self,
        account: Account,
        http_challenges: bool,
        dns_provider: Option<&str>,
    ) -> Result<Self, AcmeError> {
        let tls_alpn = Arc::new(TlsAlpnChallengeHandler::new(self.challenges.clone()));

        let mut general = AcmeClient::new(account.clone())
            .with_handler(ChallengeType::TlsAlpn01, tls_alpn.clone());
        if http_challenges {
            general = general.with_handler(
                ChallengeType::Http01,
                Arc::new(HttpChallengeHandler::new(self.challenges.clone())),
            );
        }

        let primary = match dns_provider {
            Some(name) => {
                let provider = dns_provider_by_name(name)?;
                tracing::info!("📡 Primary domain uses DNS-01 via {}", provider.name());
                AcmeClient::new(account).with_handler(
                    ChallengeType::Dns01,
                    Arc::new(DnsChallengeHandler::new(provider)),
                )
            }
            None => {
                tracing::warn!("⚠️ No DNS provider, the primary domain gets a non-wildcard certificate");
                AcmeClient::new(account).with_handler(ChallengeType::TlsAlpn01, tls_alpn)
            }
        };

        self.general = Some(Arc::new(general));
        self.primary = Some(Arc::new(primary));
        Ok(self)
    }

    pub fn build(self) -> Arc<CertificateManager> {
        let primary_suffix = format!(".{}", self.primary_suffix.trim().trim_start_matches("*.").trim_start_matches('.'))
            .to_ascii_lowercase();

        Arc::new(CertificateManager {
            store: self.store,
            limiters: AcmeLimiters::new(self.use_rate_limits),
            locks: ObtainLocks::new(),
            general: self.general,
            primary: self.primary,
            challenges: self.challenges,
            primary_suffix,
        })
    }
}

impl CertificateManager {
    pub fn builder(store: Arc<dyn CertStore>, primary_suffix: impl Into<String>) -> CertificateManagerBuilder {
        CertificateManagerBuilder {
            store,
            primary_suffix: primary_suffix.into(),
            use_rate_limits: true,
            general: None,
            primary: None,
            challenges: Arc::new(ChallengeCache::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn CertStore> {
        &self.store
    }

    pub fn challenge_cache(&self) -> &Arc<ChallengeCache> {
        &self.challenges
    }

    pub fn locks(&self) -> &Arc<ObtainLocks> {
        &self.locks
    }

    /// Store key of the primary certificate, e.g. `.pages.example.org`
    pub fn primary_key(&self) -> &str {
        &self.primary_suffix
    }

    /// Bare primary apex, e.g. `pages.example.org`
    pub fn primary_apex(&self) -> &str {
        &self.primary_suffix[1..]
    }

    /// Names requested for the primary certificate
    pub fn primary_domains(&self) -> Vec<String> {
        vec![format!("*{}", self.primary_suffix), self.primary_apex().to_string()]
    }

    /// Whether `domain` is the primary apex or one of its subdomains
    pub fn is_primary_domain(&self, domain: &str) -> bool {
        domain.ends_with(&self.primary_suffix) || domain == self.primary_apex()
    }

    /// 📜 Obtain or renew a certificate.
    ///
    /// Issuance failures do not surface as errors: the caller gets the still
    /// valid previous certificate (stamped with a retry cool-down) or a
    /// persisted mock. Errors are reserved for the per-user budget, store
    /// failures, and a concurrent issuance that left nothing in the store.
    #[tracing::instrument(skip_all, fields(domain = req.domains.first().map(String::as_str).unwrap_or_default()))]
    pub async fn obtain(&self, req: ObtainRequest) -> Result<CertificateResource, CertError> {
        let client = if req.primary { self.primary.clone() } else { self.general.clone() };

        let mut domains: Vec<String> = req.domains.iter().map(|d| d.trim().to_ascii_lowercase()).collect();
        let first = domains.first().cloned().ok_or(CertError::EmptyRequest)?;
        let name = normalize_key(&first);

        let wildcard_capable = client.as_ref().is_some_and(|c| c.supports_wildcard());
        if !wildcard_capable && first.starts_with('*') {
            domains.remove(0);
        }
        let subject = domains
            .first()
            .cloned()
            .unwrap_or_else(|| name.trim_start_matches('.').to_string());

        let _guard = match self.locks.acquire(&name) {
            ObtainSlot::Owner(guard) => guard,
            ObtainSlot::Busy(rx) => {
                tracing::debug!("⏳ Waiting for in-flight issuance of {}", name);
                ObtainLocks::wait(rx).await;
                return self
                    .store
                    .get(&name)
                    .await?
                    .ok_or(CertError::ConcurrentObtainFailed(name));
            }
        };

        let Some(client) = client else {
            return self.persist_mock(&name, &subject, CLIENT_UNINITIALIZED).await;
        };

        if domains.is_empty() {
            return self
                .persist_mock(&name, &subject, "wildcard certificate requested from a client without DNS-01")
                .await;
        }

        let previous_acme = req.previous.filter(|p| p.origin == CertificateOrigin::Acme);

        let mut renewed = None;
        if let Some(previous) = previous_acme.as_ref() {
            self.limiters.take_request().await;
            tracing::debug!("🔄 Renewing certificate for {:?}", domains);
            match client.renew(previous).await {
                Ok(res) => renewed = Some(res),
                Err(e) => {
                    tracing::error!("❌ Couldn't renew certificate for {:?}, trying to request a new one: {}", domains, e);
                    self.limiters.take_failure().await;
                }
            }
        }

        let result = match renewed {
            Some(res) => Ok(res),
            None => {
                if let Some(user) = req.user.as_deref() {
                    if !self.limiters.ask_user(user) {
                        tracing::warn!("🚦 User {} exhausted the daily certificate budget", user);
                        return Err(CertError::UserRateLimitExceeded(user.to_string()));
                    }
                }
                self.limiters.take_order().await;
                self.limiters.take_request().await;
                tracing::debug!("📝 Requesting new certificate for {:?}", domains);
                client.obtain(&domains).await
            }
        };

        match result {
            Ok(res) => {
                self.store.put(&name, &res).await?;
                tracing::info!("✅ Stored certificate for {}", name);
                Ok(res)
            }
            Err(e) => {
                tracing::error!("❌ Couldn't obtain a certificate for {:?}: {}", domains, e);
                let now = unix_now();
                if let Some(mut previous) = previous_acme.filter(|p| !p.is_expired(now)) {
                    previous.retry_after = Some(now + RETRY_BACKOFF_SECS);
                    match self.store.put(&name, &previous).await {
                        Ok(()) => return Ok(previous),
                        Err(put_err) => {
                            return self.persist_mock(&name, &subject, &put_err.to_string()).await;
                        }
                    }
                }
                self.persist_mock(&name, &subject, &e.to_string()).await
            }
        }
    }

    /// 🎭 Generate a mock for `subject` and store it under `key`.
    ///
    /// Storing is best effort; the mock is returned either way.
    pub async fn persist_mock(&self, key: &str, subject: &str, message: &str) -> Result<CertificateResource, CertError> {
        let mock = mock_certificate(subject, message)?;
        if let Err(e) = self.store.put(key, &mock).await {
            tracing::error!("💥 Failed to store mock certificate for {}: {}", key, e);
        }
        Ok(mock)
    }

    /// ⏰ Launch a detached renewal for a stored non-primary certificate
    /// when it is due. Returns the renewal task, if one was started.
    pub fn schedule_renewal(
        self: &Arc<Self>,
        key: &str,
        resource: &CertificateResource,
        now: i64,
    ) -> Option<JoinHandle<()>> {
        match resource.renewal_decision(now) {
            RenewalDecision::Valid => None,
            RenewalDecision::Backoff => {
                tracing::debug!("⏸️ Renewal of {} suppressed until {:?}", key, resource.retry_after);
                None
            }
            RenewalDecision::Due => {
                let manager = Arc::clone(self);
                let key = key.to_string();
                let mut previous = resource.clone();
                previous.retry_after = None;
                Some(tokio::spawn(async move {
                    let req = ObtainRequest {
                        domains: vec![key.clone()],
                        previous: Some(previous),
                        ..Default::default()
                    };
                    if let Err(e) = manager.obtain(req).await {
                        tracing::error!("❌ Couldn't renew certificate for {}: {}", key, e);
                    }
                }))
            }
        }
    }

    /// 🔄 Launch a detached renewal of the primary certificate if it
    /// expires within 30 days.
    pub fn schedule_primary_renewal(
        self: &Arc<Self>,
        resource: &CertificateResource,
        now: i64,
    ) -> Option<JoinHandle<()>> {
        if resource.valid_till > now + PRIMARY_RENEWAL_WINDOW_SECS {
            return None;
        }
        tracing::info!("🔄 Primary certificate expires at {}, renewing", resource.valid_till);

        let manager = Arc::clone(self);
        let previous = resource.clone();
        Some(tokio::spawn(async move {
            let req = ObtainRequest {
                domains: manager.primary_domains(),
                previous: Some(previous),
                user: None,
                primary: true,
            };
            if let Err(e) = manager.obtain(req).await {
                tracing::error!("❌ Couldn't renew certificate for main domain: {}", e);
            }
        }))
    }

    /// 🚀 Make sure the primary certificate exists.
    ///
    /// A store read failure is returned (startup must abort). A missing
    /// record triggers issuance through the primary handle; failing that,
    /// a mock is stored so the resolver always finds a primary record.
    pub async fn ensure_primary_certificate(&self) -> Result<CertificateResource, CertError> {
        if let Some(existing) = self.store.get(self.primary_key()).await? {
            tracing::info!("📜 Primary certificate found, valid until {}", existing.valid_till);
            return Ok(existing);
        }

        tracing::info!("🔐 No primary certificate stored, requesting {:?}", self.primary_domains());
        let req = ObtainRequest {
            domains: self.primary_domains(),
            primary: true,
            ..Default::default()
        };
        self.obtain(req).await
    }
}
