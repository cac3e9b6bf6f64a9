//! Certificate storage and management
//!
//! 💾 Persistence contract for certificate resources plus two engines:
//! a process-local map and an embedded single-file JSON store.
//!
//! Keys are normalized at the store boundary: lower-case, and a leading
//! `*.` is rewritten to `.`, so `*.example.com` and `.example.com` address
//! the same record.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio_rustls::rustls::pki_types::CertificateDer;
use tokio_rustls::rustls::sign::CertifiedKey;

/// Certificates expiring within this window are renewed on read.
pub const RENEWAL_WINDOW_SECS: i64 = 7 * 24 * 60 * 60;

/// Cool-down stamped on a certificate after a failed renewal.
pub const RETRY_BACKOFF_SECS: i64 = 6 * 60 * 60;

/// Certificate store errors
#[derive(Debug, Error)]
pub enum CertStoreError {
    #[error("💥 IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("📦 Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("⚠️ Invalid certificate: {0}")]
    Invalid(String),

    #[error("🔒 Certificate store is closed")]
    Closed,
}

/// Current time as unix seconds
pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Normalize a domain into its store key.
pub fn normalize_key(domain: &str) -> String {
    let domain = domain.trim().to_ascii_lowercase();
    match domain.strip_prefix("*.") {
        Some(rest) => format!(".{}", rest),
        None => domain,
    }
}

/// Where a stored certificate came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CertificateOrigin {
    /// Issued by the ACME CA
    #[default]
    Acme,
    /// Self-signed fallback
    Mock,
}

/// Outcome of the renewal eligibility check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalDecision {
    /// More than a week left
    Valid,
    /// Due, but a recent failure asked us to wait
    Backoff,
    /// Renew now
    Due,
}

/// 📜 A stored certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateResource {
    /// Canonical certificate name (first requested domain)
    pub domain: String,
    /// Leaf plus intermediates (PEM)
    pub certificate_chain: String,
    /// Private key (PEM)
    pub private_key: String,
    /// First intermediate, or the leaf itself when self-signed (PEM)
    #[serde(default)]
    pub issuer_certificate: String,
    /// Do not retry issuance before this unix timestamp
    #[serde(default)]
    pub retry_after: Option<i64>,
    /// Leaf expiry (unix seconds)
    pub valid_till: i64,
    #[serde(default)]
    pub origin: CertificateOrigin,
}

impl CertificateResource {
    /// Build a resource from PEM material, reading the expiry from the leaf.
    pub fn from_pem(
        domain: impl Into<String>,
        certificate_chain: String,
        private_key: String,
        origin: CertificateOrigin,
    ) -> Result<Self, CertStoreError> {
        let blocks = pem_certificates(&certificate_chain)?;
        let valid_till = leaf_not_after(&blocks[0])?;
        let issuer_certificate = blocks
            .get(1)
            .map(|der| encode_pem(der))
            .unwrap_or_else(|| encode_pem(&blocks[0]));

        Ok(Self {
            domain: domain.into(),
            certificate_chain,
            private_key,
            issuer_certificate,
            retry_after: None,
            valid_till,
            origin,
        })
    }

    /// ⏰ Whether the leaf has expired at `now`
    pub fn is_expired(&self, now: i64) -> bool {
        self.valid_till <= now
    }

    /// Renewal eligibility at `now`
    pub fn renewal_decision(&self, now: i64) -> RenewalDecision {
        if self.valid_till > now + RENEWAL_WINDOW_SECS {
            return RenewalDecision::Valid;
        }
        match self.retry_after {
            Some(retry_after) if retry_after > now => RenewalDecision::Backoff,
            _ => RenewalDecision::Due,
        }
    }

    /// DNS names covered by the leaf
    pub fn leaf_domains(&self) -> Result<Vec<String>, CertStoreError> {
        let blocks = pem_certificates(&self.certificate_chain)?;
        let (_, cert) = x509_parser::parse_x509_certificate(&blocks[0])
            .map_err(|e| CertStoreError::Invalid(format!("Failed to parse leaf: {}", e)))?;

        let mut domains = Vec::new();
        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for name in &san.value.general_names {
                if let x509_parser::extensions::GeneralName::DNSName(dns) = name {
                    domains.push(dns.to_string());
                }
            }
        }
        if domains.is_empty() {
            domains.push(self.domain.clone());
        }
        Ok(domains)
    }

    /// Convert to a rustls `CertifiedKey` for the handshake.
    pub fn to_certified_key(&self) -> Result<CertifiedKey, CertStoreError> {
        let certs = pem_certificates(&self.certificate_chain)?;

        let mut reader = std::io::Cursor::new(self.private_key.as_bytes());
        let key = rustls_pemfile::private_key(&mut reader)?
            .ok_or_else(|| CertStoreError::Invalid("No private key found".to_string()))?;

        let signing_key = tokio_rustls::rustls::crypto::ring::sign::any_supported_type(&key)
            .map_err(|_| CertStoreError::Invalid("Unsupported key type".to_string()))?;

        Ok(CertifiedKey::new(certs, signing_key))
    }
}

fn pem_certificates(pem: &str) -> Result<Vec<CertificateDer<'static>>, CertStoreError> {
    let mut reader = std::io::Cursor::new(pem.as_bytes());
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(CertStoreError::Invalid("No certificates found".to_string()));
    }
    Ok(certs)
}

fn leaf_not_after(der: &CertificateDer<'_>) -> Result<i64, CertStoreError> {
    let (_, cert) = x509_parser::parse_x509_certificate(der.as_ref())
        .map_err(|e| CertStoreError::Invalid(format!("Failed to parse leaf: {}", e)))?;
    Ok(cert.validity().not_after.timestamp())
}

fn encode_pem(der: &CertificateDer<'_>) -> String {
    use base64::Engine;
    let body = base64::engine::general_purpose::STANDARD.encode(der.as_ref());
    let mut pem = String::from("-----BEGIN CERTIFICATE-----\n");
    for line in body.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");
    pem
}

/// 🗄️ Persistence contract for certificate resources.
///
/// Implementations normalize every key with [`normalize_key`] and must be
/// safe to share between tasks.
#[async_trait]
pub trait CertStore: Send + Sync {
    /// Insert or replace the record for `domain`
    async fn put(&self, domain: &str, resource: &CertificateResource) -> Result<(), CertStoreError>;

    /// Fetch the record for `domain`
    async fn get(&self, domain: &str) -> Result<Option<CertificateResource>, CertStoreError>;

    /// Remove the record for `domain`; missing records are not an error
    async fn delete(&self, domain: &str) -> Result<(), CertStoreError>;

    /// List records ordered by key. `page` starts at 1; `page_size == 0` returns everything.
    async fn items(
        &self,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<(String, CertificateResource)>, CertStoreError>;

    /// Reclaim space and describe what was done
    async fn compact(&self) -> Result<String, CertStoreError>;

    /// Flush and release the store
    async fn close(&self) -> Result<(), CertStoreError>;
}

fn page_of(
    entries: &BTreeMap<String, CertificateResource>,
    page: usize,
    page_size: usize,
) -> Vec<(String, CertificateResource)> {
    let iter = entries.iter().map(|(k, v)| (k.clone(), v.clone()));
    if page_size == 0 {
        return iter.collect();
    }
    let skip = page.saturating_sub(1) * page_size;
    iter.skip(skip).take(page_size).collect()
}

/// 🧠 Process-local store
#[derive(Default)]
pub struct MemoryCertStore {
    entries: RwLock<BTreeMap<String, CertificateResource>>,
}

impl MemoryCertStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CertStore for MemoryCertStore {
    async fn put(&self, domain: &str, resource: &CertificateResource) -> Result<(), CertStoreError> {
        self.entries.write().insert(normalize_key(domain), resource.clone());
        Ok(())
    }

    async fn get(&self, domain: &str) -> Result<Option<CertificateResource>, CertStoreError> {
        Ok(self.entries.read().get(&normalize_key(domain)).cloned())
    }

    async fn delete(&self, domain: &str) -> Result<(), CertStoreError> {
        self.entries.write().remove(&normalize_key(domain));
        Ok(())
    }

    async fn items(
        &self,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<(String, CertificateResource)>, CertStoreError> {
        Ok(page_of(&self.entries.read(), page, page_size))
    }

    async fn compact(&self) -> Result<String, CertStoreError> {
        Ok(format!("{} record(s) in memory, nothing to compact", self.entries.read().len()))
    }

    async fn close(&self) -> Result<(), CertStoreError> {
        Ok(())
    }
}

/// On-disk format of [`FileCertStore`]
#[derive(Serialize, Deserialize, Default)]
struct StoreSnapshot {
    certificates: BTreeMap<String, CertificateResource>,
}

/// 📁 Embedded single-file store.
///
/// The whole store lives in memory and is written back to one JSON file
/// after every mutation (temp file + rename).
pub struct FileCertStore {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, CertificateResource>>,
    /// Serializes writers of the backing file
    flush_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl FileCertStore {
    /// 🚀 Open (or create) the store at `path`
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, CertStoreError> {
        let path = path.as_ref().to_path_buf();
        tracing::info!("📁 Opening certificate store at {:?}", path);

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(content) if content.trim().is_empty() => BTreeMap::new(),
            Ok(content) => {
                let snapshot: StoreSnapshot = serde_json::from_str(&content)?;
                snapshot
                    .certificates
                    .into_iter()
                    .map(|(k, v)| (normalize_key(&k), v))
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        tracing::info!("📜 Loaded {} certificate(s) from disk", entries.len());

        Ok(Self {
            path,
            entries: RwLock::new(entries),
            flush_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), CertStoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CertStoreError::Closed);
        }
        Ok(())
    }

    /// 💾 Apply `change` to a copy of the records, write the copy to disk and
    /// only then publish it. Returns the file size.
    ///
    /// A failed write leaves both the file and the in-memory records as they
    /// were.
    async fn commit<F>(&self, change: F) -> Result<u64, CertStoreError>
    where
        F: FnOnce(&mut BTreeMap<String, CertificateResource>),
    {
        let _guard = self.flush_lock.lock().await;

        let mut next = self.entries.read().clone();
        change(&mut next);
        let bytes = self.write_snapshot(next.clone()).await?;

        *self.entries.write() = next;
        Ok(bytes)
    }

    async fn write_snapshot(
        &self,
        certificates: BTreeMap<String, CertificateResource>,
    ) -> Result<u64, CertStoreError> {
        let json = serde_json::to_vec_pretty(&StoreSnapshot { certificates })?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
        }

        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(json.len() as u64)
    }
}

#[async_trait]
impl CertStore for FileCertStore {
    async fn put(&self, domain: &str, resource: &CertificateResource) -> Result<(), CertStoreError> {
        self.ensure_open()?;
        let key = normalize_key(domain);
        tracing::debug!("💾 Storing certificate under {}", key);
        let resource = resource.clone();
        self.commit(move |entries| {
            entries.insert(key, resource);
        })
        .await?;
        Ok(())
    }

    async fn get(&self, domain: &str) -> Result<Option<CertificateResource>, CertStoreError> {
        self.ensure_open()?;
        Ok(self.entries.read().get(&normalize_key(domain)).cloned())
    }

    async fn delete(&self, domain: &str) -> Result<(), CertStoreError> {
        self.ensure_open()?;
        let key = normalize_key(domain);
        if !self.entries.read().contains_key(&key) {
            return Ok(());
        }
        self.commit(move |entries| {
            entries.remove(&key);
        })
        .await?;
        Ok(())
    }

    async fn items(
        &self,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<(String, CertificateResource)>, CertStoreError> {
        self.ensure_open()?;
        Ok(page_of(&self.entries.read(), page, page_size))
    }

    async fn compact(&self) -> Result<String, CertStoreError> {
        self.ensure_open()?;
        let bytes = self.commit(|_| {}).await?;
        let count = self.entries.read().len();
        Ok(format!("rewrote {} record(s), {} bytes", count, bytes))
    }

    async fn close(&self) -> Result<(), CertStoreError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.commit(|_| {}).await?;
        tracing::info!("🔒 Certificate store closed");
        Ok(())
    }
}

/// Open the configured store engine.
pub async fn open_store(
    settings: &pagesgate_core::config::DatabaseSettings,
) -> Result<Arc<dyn CertStore>, CertStoreError> {
    use pagesgate_core::config::StoreEngine;

    Ok(match settings.engine {
        StoreEngine::File => Arc::new(FileCertStore::open(&settings.path).await?),
        StoreEngine::Memory => {
            tracing::warn!("⚠️ Using in-memory certificate store, certificates are lost on restart");
            Arc::new(MemoryCertStore::new())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(domain: &str, valid_till: i64) -> CertificateResource {
        CertificateResource {
            domain: domain.to_string(),
            certificate_chain: "chain".to_string(),
            private_key: "key".to_string(),
            issuer_certificate: String::new(),
            retry_after: None,
            valid_till,
            origin: CertificateOrigin::Acme,
        }
    }

    #[test]
    fn test_normalize_key() {
        assert_eq!(normalize_key("*.Example.com"), ".example.com");
        assert_eq!(normalize_key(".example.com"), ".example.com");
        assert_eq!(normalize_key(" Blog.Example.com "), "blog.example.com");
    }

    #[test]
    fn test_renewal_decision_boundaries() {
        let now = 1_700_000_000;
        let day = 24 * 60 * 60;

        assert_eq!(resource("a", now + 8 * day).renewal_decision(now), RenewalDecision::Valid);
        assert_eq!(resource("a", now + 6 * day).renewal_decision(now), RenewalDecision::Due);

        let mut backoff = resource("a", now + 6 * day);
        backoff.retry_after = Some(now + RETRY_BACKOFF_SECS);
        assert_eq!(backoff.renewal_decision(now + 60), RenewalDecision::Backoff);
        assert_eq!(
            backoff.renewal_decision(now + RETRY_BACKOFF_SECS + 1),
            RenewalDecision::Due
        );
    }

    #[tokio::test]
    async fn test_memory_store_wildcard_keys() {
        let store = MemoryCertStore::new();
        let res = resource("*.example.com", 42);

        store.put(".example.com", &res).await.unwrap();
        assert_eq!(store.get("*.example.com").await.unwrap(), Some(res.clone()));
        assert_eq!(store.get(".example.com").await.unwrap(), Some(res));
        assert_eq!(store.get("example.com").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_store_upsert_and_delete() {
        let store = MemoryCertStore::new();
        store.put("a.example.com", &resource("a.example.com", 1)).await.unwrap();
        store.put("a.example.com", &resource("a.example.com", 2)).await.unwrap();

        let items = store.items(0, 0).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].1.valid_till, 2);

        store.delete("a.example.com").await.unwrap();
        store.delete("a.example.com").await.unwrap();
        assert!(store.get("a.example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_items_paging() {
        let store = MemoryCertStore::new();
        for name in ["a.test", "b.test", "c.test", "d.test", "e.test"] {
            store.put(name, &resource(name, 1)).await.unwrap();
        }

        assert_eq!(store.items(0, 0).await.unwrap().len(), 5);

        let first: Vec<String> = store.items(1, 2).await.unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(first, vec!["a.test", "b.test"]);

        let last: Vec<String> = store.items(3, 2).await.unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(last, vec!["e.test"]);

        assert!(store.items(4, 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_persists_across_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("certs.json");

        let store = FileCertStore::open(&path).await.unwrap();
        store.put("*.pages.test", &resource("*.pages.test", 10)).await.unwrap();
        store.put("blog.test", &resource("blog.test", 20)).await.unwrap();
        store.delete("blog.test").await.unwrap();
        store.close().await.unwrap();

        assert!(matches!(store.get("blog.test").await, Err(CertStoreError::Closed)));

        let reopened = FileCertStore::open(&path).await.unwrap();
        let items = reopened.items(0, 0).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].0, ".pages.test");
        assert_eq!(reopened.get(".pages.test").await.unwrap().unwrap().valid_till, 10);

        let summary = reopened.compact().await.unwrap();
        assert!(summary.contains("1 record(s)"));
    }

    #[tokio::test]
    async fn test_file_store_failed_write_keeps_previous_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("certs.json");

        let store = FileCertStore::open(&path).await.unwrap();
        store.put("blog.test", &resource("blog.test", 10)).await.unwrap();

        // a directory in place of the temp file makes every write fail
        let tmp = path.with_extension("json.tmp");
        std::fs::create_dir(&tmp).unwrap();

        assert!(store.put("blog.test", &resource("blog.test", 20)).await.is_err());
        assert!(store.put("new.test", &resource("new.test", 30)).await.is_err());
        assert!(store.delete("blog.test").await.is_err());

        assert_eq!(store.get("blog.test").await.unwrap().unwrap().valid_till, 10);
        assert!(store.get("new.test").await.unwrap().is_none());
        assert_eq!(store.items(0, 0).await.unwrap().len(), 1);

        std::fs::remove_dir(&tmp).unwrap();
        let reopened = FileCertStore::open(&path).await.unwrap();
        assert_eq!(reopened.get("blog.test").await.unwrap().unwrap().valid_till, 10);
        assert!(reopened.get("new.test").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("certs.json");
        tokio::fs::write(&path, "{ not json").await.unwrap();

        assert!(matches!(
            FileCertStore::open(&path).await,
            Err(CertStoreError::Serialization(_))
        ));
    }
}
