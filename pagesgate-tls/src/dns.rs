//! DNS-01 providers
//!
//! 📡 Wildcard certificates need DNS-01. Providers are picked by name from
//! configuration; the built-in `exec` provider hands the record to an
//! external program:
//!
//! ```text
//! $EXEC_PATH present _acme-challenge.example.org. <value>
//! $EXEC_PATH cleanup _acme-challenge.example.org. <value>
//! ```

use crate::acme::AcmeError;
use crate::challenge::{ChallengeHandler, ChallengeResponse};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

/// Environment variable naming the `exec` provider's program
pub const EXEC_PATH_ENV: &str = "EXEC_PATH";

/// Creates and removes `_acme-challenge` TXT records
#[async_trait]
pub trait DnsProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Publish `value` as a TXT record at `fqdn`
    async fn present(&self, fqdn: &str, value: &str) -> Result<(), AcmeError>;

    /// Remove the TXT record again
    async fn cleanup(&self, fqdn: &str, value: &str) -> Result<(), AcmeError>;
}

/// Look up a provider by its configured name.
pub fn dns_provider_by_name(name: &str) -> Result<Arc<dyn DnsProvider>, AcmeError> {
    match name {
        "exec" => Ok(Arc::new(ExecDnsProvider::from_env()?)),
        other => Err(AcmeError::Config(format!("Unknown DNS provider: {}", other))),
    }
}

/// Record name for a DNS-01 challenge
pub fn challenge_fqdn(domain: &str) -> String {
    format!("_acme-challenge.{}.", domain.trim_start_matches("*.").trim_end_matches('.'))
}

/// 🛠️ Runs an external program for every record change
pub struct ExecDnsProvider {
    program: PathBuf,
}

impl ExecDnsProvider {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Read the program path from `EXEC_PATH`
    pub fn from_env() -> Result<Self, AcmeError> {
        let program = std::env::var_os(EXEC_PATH_ENV)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| AcmeError::Config(format!("{} must be set for the exec DNS provider", EXEC_PATH_ENV)))?;
        Ok(Self::new(program))
    }

    async fn run(&self, action: &str, fqdn: &str, value: &str) -> Result<(), AcmeError> {
        tracing::debug!("📡 {} {} TXT record via {:?}", action, fqdn, self.program);

        let output = tokio::process::Command::new(&self.program)
            .arg(action)
            .arg(fqdn)
            .arg(value)
            .output()
            .await
            .map_err(|e| AcmeError::ChallengeFailed(format!("Failed to run {:?}: {}", self.program, e)))?;

        if !output.status.success() {
            return Err(AcmeError::ChallengeFailed(format!(
                "{:?} {} exited with {}: {}",
                self.program,
                action,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DnsProvider for ExecDnsProvider {
    fn name(&self) -> &str {
        "exec"
    }

    async fn present(&self, fqdn: &str, value: &str) -> Result<(), AcmeError> {
        self.run("present", fqdn, value).await
    }

    async fn cleanup(&self, fqdn: &str, value: &str) -> Result<(), AcmeError> {
        self.run("cleanup", fqdn, value).await
    }
}

/// DNS-01 challenge handler backed by a provider
pub struct DnsChallengeHandler {
    provider: Arc<dyn DnsProvider>,
}

impl DnsChallengeHandler {
    pub fn new(provider: Arc<dyn DnsProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl ChallengeHandler for DnsChallengeHandler {
    async fn deploy(&self, challenge: &ChallengeResponse) -> Result<(), AcmeError> {
        self.provider
            .present(&challenge_fqdn(&challenge.domain), &challenge.dns_value)
            .await
    }

    async fn cleanup(&self, challenge: &ChallengeResponse) -> Result<(), AcmeError> {
        self.provider
            .cleanup(&challenge_fqdn(&challenge.domain), &challenge.dns_value)
            .await
    }
}
