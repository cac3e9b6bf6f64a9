//! ACME account setup
//!
//! 👤 Loads the persisted account artifact or registers a new account.
//!
//! The artifact is written once with mode 0600 and reused across restarts.
//! If registration succeeds but the artifact cannot be written, the task
//! parks instead of returning: a restart loop would register a new account
//! on every attempt and burn the CA's registration limit.

use base64::Engine;
use instant_acme::{Account, AccountCredentials, ExternalAccountKey, NewAccount};
use pagesgate_core::config::AcmeSettings;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Account setup errors
#[derive(Debug, Error)]
pub enum AccountError {
    #[error("💥 IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("📦 Corrupt account artifact: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("🔴 ACME account error: {0}")]
    Acme(#[from] instant_acme::Error),

    #[error("🔑 Invalid external account binding: {0}")]
    InvalidEab(String),
}

/// On-disk account artifact
#[derive(Serialize, Deserialize)]
pub struct AccountArtifact {
    pub email: String,
    pub credentials: AccountCredentials,
    #[serde(default)]
    pub created_at: i64,
}

/// 🚀 Load the account from `settings.account_config_file`, or register one.
pub async fn load_or_register(settings: &AcmeSettings) -> Result<Account, AccountError> {
    crate::tls::install_crypto_provider();
    let path = settings.account_config_file.as_path();

    match tokio::fs::read_to_string(path).await {
        Ok(content) => {
            let artifact: AccountArtifact = serde_json::from_str(&content)?;
            let account = Account::builder()?
                .from_credentials(artifact.credentials)
                .await?;
            tracing::info!("👤 Loaded ACME account for {:?} from {}", artifact.email, path.display());
            return Ok(account);
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let (account, credentials) = register(settings).await?;

    let artifact = AccountArtifact {
        email: settings.email.clone(),
        credentials,
        created_at: crate::cert_store::unix_now(),
    };
    if let Err(e) = persist(path, &artifact).await {
        tracing::error!(
            "💥 Failed to write ACME account to {}: {}. Waiting for a manual restart to avoid rate limits",
            path.display(),
            e
        );
        return std::future::pending().await;
    }

    tracing::info!("✅ ACME account registered and saved to {}", path.display());
    Ok(account)
}

async fn register(settings: &AcmeSettings) -> Result<(Account, AccountCredentials), AccountError> {
    let contact = (!settings.email.is_empty()).then(|| format!("mailto:{}", settings.email));
    let contact_refs: Vec<&str> = contact.iter().map(|s| s.as_str()).collect();

    let new_account = NewAccount {
        contact: &contact_refs,
        terms_of_service_agreed: settings.accept_terms,
        only_return_existing: false,
    };

    let eab = match settings.eab() {
        Some((kid, hmac)) => {
            tracing::info!("🔑 Registering ACME account with external account binding");
            Some(ExternalAccountKey::new(kid.to_string(), &decode_eab_hmac(hmac)?))
        }
        None => None,
    };

    tracing::info!("👤 Creating ACME account at {}...", settings.api_endpoint);
    let registered = Account::builder()?
        .create(&new_account, settings.api_endpoint.clone(), eab.as_ref())
        .await?;
    Ok(registered)
}

/// EAB HMAC keys are distributed base64url encoded, usually without padding.
fn decode_eab_hmac(hmac: &str) -> Result<Vec<u8>, AccountError> {
    let trimmed = hmac.trim().trim_end_matches('=');
    base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(trimmed)
        .map_err(|e| AccountError::InvalidEab(e.to_string()))
}

async fn persist(path: &Path, artifact: &AccountArtifact) -> Result<(), AccountError> {
    let json = serde_json::to_vec_pretty(artifact)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, json).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_eab_hmac() {
        assert_eq!(decode_eab_hmac("aG1hYy1rZXk").unwrap(), b"hmac-key");
        assert_eq!(decode_eab_hmac("aG1hYy1rZXk=").unwrap(), b"hmac-key");
        assert!(matches!(decode_eab_hmac("not base64!"), Err(AccountError::InvalidEab(_))));
    }

    #[tokio::test]
    async fn test_corrupt_artifact_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acme-account.json");
        tokio::fs::write(&path, "{ definitely not an account").await.unwrap();

        let settings = AcmeSettings {
            account_config_file: path,
            ..Default::default()
        };
        assert!(matches!(load_or_register(&settings).await, Err(AccountError::Corrupt(_))));
    }
}
