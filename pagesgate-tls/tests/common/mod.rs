//! Shared fixtures for certificate lifecycle tests

#![allow(dead_code)]

use async_trait::async_trait;
use pagesgate_tls::acme::{AcmeError, CertificateAuthority};
use pagesgate_tls::cert_store::{
    CertStore, CertStoreError, CertificateOrigin, CertificateResource, MemoryCertStore,
};
use pagesgate_tls::manager::CertificateManager;
use parking_lot::Mutex;
use rcgen::{CertificateParams, KeyPair};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

pub const DAY: i64 = 24 * 60 * 60;
pub const PRIMARY: &str = "pages.example.org";

/// Issue a self-signed "ACME" certificate expiring in `valid_for` seconds.
pub fn issue(domains: &[String], valid_for: i64) -> CertificateResource {
    let mut params = CertificateParams::new(domains.to_vec()).unwrap();
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now - time::Duration::days(1);
    params.not_after = now + time::Duration::seconds(valid_for);

    let key_pair = KeyPair::generate().unwrap();
    let cert = params.self_signed(&key_pair).unwrap();
    CertificateResource::from_pem(
        domains[0].clone(),
        cert.pem(),
        key_pair.serialize_pem(),
        CertificateOrigin::Acme,
    )
    .unwrap()
}

/// Certificate authority stand-in with a call log
pub struct StubAuthority {
    pub requests: Mutex<Vec<Vec<String>>>,
    pub fail: AtomicBool,
    pub delay: Duration,
    pub wildcard: bool,
}

impl StubAuthority {
    pub fn new() -> Arc<Self> {
        Self::with(Duration::ZERO, false)
    }

    pub fn with(delay: Duration, wildcard: bool) -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            delay,
            wildcard,
        })
    }

    pub fn failing() -> Arc<Self> {
        let stub = Self::new();
        stub.fail.store(true, Ordering::SeqCst);
        stub
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl CertificateAuthority for StubAuthority {
    async fn obtain(&self, domains: &[String]) -> Result<CertificateResource, AcmeError> {
        self.requests.lock().push(domains.to_vec());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(AcmeError::OrderFailed("urn:ietf:params:acme:error:rateLimited".to_string()));
        }
        Ok(issue(domains, 90 * DAY))
    }

    fn supports_wildcard(&self) -> bool {
        self.wildcard
    }
}

/// Store wrapper counting every call
#[derive(Default)]
pub struct CountingStore {
    inner: MemoryCertStore,
    pub calls: AtomicUsize,
}

impl CountingStore {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn hit(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl CertStore for CountingStore {
    async fn put(&self, domain: &str, resource: &CertificateResource) -> Result<(), CertStoreError> {
        self.hit();
        self.inner.put(domain, resource).await
    }

    async fn get(&self, domain: &str) -> Result<Option<CertificateResource>, CertStoreError> {
        self.hit();
        self.inner.get(domain).await
    }

    async fn delete(&self, domain: &str) -> Result<(), CertStoreError> {
        self.hit();
        self.inner.delete(domain).await
    }

    async fn items(
        &self,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<(String, CertificateResource)>, CertStoreError> {
        self.hit();
        self.inner.items(page, page_size).await
    }

    async fn compact(&self) -> Result<String, CertStoreError> {
        self.hit();
        self.inner.compact().await
    }

    async fn close(&self) -> Result<(), CertStoreError> {
        self.hit();
        self.inner.close().await
    }
}

/// Manager over `store` with `general` as custom domain CA and `primary`
/// as primary CA; rate limits off.
pub fn manager_with(
    store: Arc<dyn CertStore>,
    general: Option<Arc<StubAuthority>>,
    primary: Option<Arc<StubAuthority>>,
) -> Arc<CertificateManager> {
    let mut builder = CertificateManager::builder(store, PRIMARY).rate_limits(false);
    if let Some(general) = general {
        builder = builder.general_authority(general);
    }
    if let Some(primary) = primary {
        builder = builder.primary_authority(primary);
    }
    builder.build()
}
