//! Background maintenance
//!
//! 🧹 Periodically drops certificates that will expire before the next
//! cycle, compacts the store and keeps the primary certificate fresh.
//! Expired challenge answers and parsed certificates are purged as well.

use crate::cert_store::{CertStoreError, unix_now};
use crate::manager::CertificateManager;
use crate::resolver::CertResolver;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Outcome of one maintenance cycle
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Keys removed from the store
    pub deleted: Vec<String>,
    /// Summary returned by the store's compaction
    pub compact_summary: Option<String>,
    /// Expired cache entries dropped
    pub purged: usize,
    /// Detached primary renewal, if one was started
    pub primary_renewal: Option<JoinHandle<()>>,
}

/// 🧹 Certificate store maintainer
pub struct Maintainer {
    manager: Arc<CertificateManager>,
    resolver: Option<Arc<CertResolver>>,
    interval: Duration,
}

impl Maintainer {
    pub fn new(manager: Arc<CertificateManager>, interval: Duration) -> Self {
        Self {
            manager,
            resolver: None,
            interval,
        }
    }

    /// Also evict the resolver's parsed certificates for removed records
    pub fn with_resolver(mut self, resolver: Arc<CertResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Run cycles until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!("🧹 Certificate maintenance every {:?}", self.interval);
        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.sweep().await {
                Ok(report) => {
                    tracing::info!(
                        "🧹 Maintenance cycle removed {} certificate(s)",
                        report.deleted.len()
                    );
                }
                Err(e) => tracing::error!("❌ Maintenance cycle failed: {}", e),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        tracing::info!("🛑 Certificate maintenance stopped");
    }

    /// One maintenance cycle. Store errors abort the cycle; the next one
    /// starts after the regular interval.
    pub async fn sweep(&self) -> Result<SweepReport, CertStoreError> {
        let store = self.manager.store();
        let now = unix_now();
        let threshold = now + self.interval.as_secs() as i64;
        let mut report = SweepReport::default();

        let expiring: Vec<String> = store
            .items(0, 0)
            .await?
            .into_iter()
            .filter(|(key, res)| key != self.manager.primary_key() && res.valid_till < threshold)
            .map(|(key, _)| key)
            .collect();

        for key in expiring {
            match store.delete(&key).await {
                Ok(()) => {
                    tracing::debug!("🗑️ Removed expiring certificate {}", key);
                    if let Some(resolver) = &self.resolver {
                        resolver.invalidate(&key);
                    }
                    report.deleted.push(key);
                }
                Err(e) => tracing::warn!("⚠️ Couldn't remove expiring certificate {}: {}", key, e),
            }
        }

        match store.compact().await {
            Ok(summary) => {
                tracing::debug!("📦 Compacted certificate store: {}", summary);
                report.compact_summary = Some(summary);
            }
            Err(e) => tracing::warn!("⚠️ Couldn't compact certificate store: {}", e),
        }

        report.purged = self.manager.challenge_cache().purge_expired();
        if let Some(resolver) = &self.resolver {
            report.purged += resolver.purge_expired();
        }

        match store.get(self.manager.primary_key()).await? {
            Some(primary) => {
                report.primary_renewal = self.manager.schedule_primary_renewal(&primary, now);
            }
            None => {
                tracing::error!(
                    "💥 Primary certificate {} missing from the store, it may be corrupt",
                    self.manager.primary_key()
                );
            }
        }

        Ok(report)
    }
}
