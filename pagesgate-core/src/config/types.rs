//! Configuration type definitions
//!
//! These types represent the runtime configuration for Pagesgate.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// ACME directory used by local test setups; exempt from the terms/DNS checks.
pub const MOCK_ACME_DIRECTORY: &str = "https://acme.mock.directory";

/// 🏭 Let's Encrypt production directory
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Root configuration for Pagesgate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Listener configuration
    #[serde(default)]
    pub server: ServerSettings,

    /// Certificate store configuration
    #[serde(default)]
    pub database: DatabaseSettings,

    /// ACME account and issuance configuration
    #[serde(default)]
    pub acme: AcmeSettings,

    /// Custom domains claimed by tenants
    #[serde(default)]
    pub custom_domains: Vec<CustomDomain>,

    /// Background maintenance configuration
    #[serde(default)]
    pub maintenance: MaintenanceSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            server: ServerSettings::default(),
            database: DatabaseSettings::default(),
            acme: AcmeSettings::default(),
            custom_domains: Vec::new(),
            maintenance: MaintenanceSettings::default(),
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Bind host for both listeners
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTPS port
    #[serde(default = "default_port")]
    pub port: u16,

    /// HTTP port (ACME HTTP-01 challenges and redirects)
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Start the plain HTTP listener
    #[serde(default = "default_true")]
    pub http_server_enabled: bool,

    /// Primary domain suffix, e.g. `pages.example.org`
    #[serde(default)]
    pub main_domain: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            http_port: default_http_port(),
            http_server_enabled: true,
            main_domain: String::new(),
        }
    }
}

fn default_host() -> String {
    "[::]".to_string()
}

fn default_port() -> u16 {
    443
}

fn default_http_port() -> u16 {
    80
}

fn default_true() -> bool {
    true
}

/// Certificate store engines
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoreEngine {
    /// Embedded single-file engine
    #[default]
    File,
    /// Process-local engine, nothing survives a restart
    Memory,
}

/// Certificate store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// Store engine
    #[serde(rename = "type", default)]
    pub engine: StoreEngine,

    /// Store file for the `file` engine
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            engine: StoreEngine::File,
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("certs.json")
}

/// ACME account and issuance configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcmeSettings {
    /// Account contact email
    #[serde(default)]
    pub email: String,

    /// ACME directory URL
    #[serde(default = "default_api_endpoint")]
    pub api_endpoint: String,

    /// Accept the CA's terms of service
    #[serde(default)]
    pub accept_terms: bool,

    /// Apply the local ACME rate limits
    #[serde(default = "default_true")]
    pub use_rate_limits: bool,

    /// External account binding HMAC (base64url)
    #[serde(default)]
    pub eab_hmac: Option<String>,

    /// External account binding key id
    #[serde(default)]
    pub eab_kid: Option<String>,

    /// DNS-01 provider name for the wildcard certificate
    #[serde(default)]
    pub dns_provider: Option<String>,

    /// Account artifact location
    #[serde(default = "default_account_file")]
    pub account_config_file: PathBuf,
}

impl Default for AcmeSettings {
    fn default() -> Self {
        Self {
            email: String::new(),
            api_endpoint: default_api_endpoint(),
            accept_terms: false,
            use_rate_limits: true,
            eab_hmac: None,
            eab_kid: None,
            dns_provider: None,
            account_config_file: default_account_file(),
        }
    }
}

impl AcmeSettings {
    /// Both halves of the external account binding, if configured
    pub fn eab(&self) -> Option<(&str, &str)> {
        match (self.eab_kid.as_deref(), self.eab_hmac.as_deref()) {
            (Some(kid), Some(hmac)) if !kid.is_empty() && !hmac.is_empty() => Some((kid, hmac)),
            _ => None,
        }
    }

    /// Configured DNS provider name, ignoring empty strings
    pub fn dns_provider(&self) -> Option<&str> {
        self.dns_provider.as_deref().filter(|p| !p.is_empty())
    }
}

fn default_api_endpoint() -> String {
    LETS_ENCRYPT_PRODUCTION.to_string()
}

fn default_account_file() -> PathBuf {
    PathBuf::from("acme-account.json")
}

/// A tenant-claimed custom domain
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CustomDomain {
    /// Claimed domain name
    pub domain: String,

    /// Owning user or organization
    pub owner: String,

    /// Repository serving the content
    #[serde(default = "default_repo")]
    pub repo: String,

    /// Branch serving the content
    #[serde(default = "default_branch")]
    pub branch: String,

    /// Whether the domain is listed in the tenant's canonical domain file
    #[serde(default = "default_true")]
    pub authorized: bool,
}

fn default_repo() -> String {
    "pages".to_string()
}

fn default_branch() -> String {
    "pages".to_string()
}

/// Background maintenance configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceSettings {
    /// Seconds between store sweeps
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
        }
    }
}

fn default_interval() -> u64 {
    12 * 60 * 60
}

/// Values supplied on the command line or through the environment.
///
/// Every `Some` field replaces the value loaded from the config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub log_level: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub http_port: Option<u16>,
    pub http_server_enabled: Option<bool>,
    pub main_domain: Option<String>,
    pub store_engine: Option<StoreEngine>,
    pub store_path: Option<PathBuf>,
    pub acme_email: Option<String>,
    pub acme_api: Option<String>,
    pub acme_accept_terms: Option<bool>,
    pub acme_use_rate_limits: Option<bool>,
    pub acme_eab_hmac: Option<String>,
    pub acme_eab_kid: Option<String>,
    pub dns_provider: Option<String>,
    pub account_config_file: Option<PathBuf>,
}

impl Config {
    /// 🔀 Apply command line / environment overrides
    pub fn merge(&mut self, overrides: ConfigOverrides) {
        fn set<T>(target: &mut T, value: Option<T>) {
            if let Some(value) = value {
                *target = value;
            }
        }

        set(&mut self.log_level, overrides.log_level);
        set(&mut self.server.host, overrides.host);
        set(&mut self.server.port, overrides.port);
        set(&mut self.server.http_port, overrides.http_port);
        set(&mut self.server.http_server_enabled, overrides.http_server_enabled);
        set(&mut self.server.main_domain, overrides.main_domain);
        set(&mut self.database.engine, overrides.store_engine);
        set(&mut self.database.path, overrides.store_path);
        set(&mut self.acme.email, overrides.acme_email);
        set(&mut self.acme.api_endpoint, overrides.acme_api);
        set(&mut self.acme.accept_terms, overrides.acme_accept_terms);
        set(&mut self.acme.use_rate_limits, overrides.acme_use_rate_limits);
        if overrides.acme_eab_hmac.is_some() {
            self.acme.eab_hmac = overrides.acme_eab_hmac;
        }
        if overrides.acme_eab_kid.is_some() {
            self.acme.eab_kid = overrides.acme_eab_kid;
        }
        if overrides.dns_provider.is_some() {
            self.acme.dns_provider = overrides.dns_provider;
        }
        set(&mut self.acme.account_config_file, overrides.account_config_file);
    }

    /// ✅ Validate the configuration and normalize the primary domain
    pub fn validate(&mut self) -> Result<()> {
        let main = self.server.main_domain.trim().to_ascii_lowercase();
        let main = main.trim_start_matches("*.").trim_start_matches('.');
        if main.is_empty() {
            return Err(Error::Config("no main domain set (PAGES_DOMAIN)".to_string()));
        }
        self.server.main_domain = main.to_string();

        let acme = &self.acme;
        if acme.api_endpoint != MOCK_ACME_DIRECTORY
            && (!acme.accept_terms || acme.dns_provider().is_none())
        {
            return Err(Error::Config(
                "you must set acme.accept_terms and acme.dns_provider, unless api_endpoint is set to https://acme.mock.directory".to_string(),
            ));
        }

        let has_hmac = acme.eab_hmac.as_deref().is_some_and(|v| !v.is_empty());
        let has_kid = acme.eab_kid.as_deref().is_some_and(|v| !v.is_empty());
        if has_hmac != has_kid {
            return Err(Error::Config(
                "acme.eab_hmac and acme.eab_kid must be set together".to_string(),
            ));
        }

        if self.maintenance.interval_secs == 0 {
            return Err(Error::Config("maintenance.interval_secs must be positive".to_string()));
        }

        Ok(())
    }

    /// Primary suffix with its leading dot, e.g. `.pages.example.org`
    pub fn primary_suffix(&self) -> String {
        format!(".{}", self.server.main_domain.trim_start_matches('.'))
    }

    /// Address of the HTTPS listener
    pub fn https_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Address of the HTTP listener
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }

    /// Interval between maintenance sweeps
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance.interval_secs)
    }
}
