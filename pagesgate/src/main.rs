//! Pagesgate - on-demand TLS for a static pages gateway
//!
//! This is the main entry point for the Pagesgate CLI.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use pagesgate_core::config::{
    Config, ConfigLoader, ConfigOverrides, MOCK_ACME_DIRECTORY, StoreEngine,
};
use pagesgate_server::{FallbackHandler, HttpServer, HttpsServer};
use pagesgate_tls::account::{self, AccountError};
use pagesgate_tls::{
    CertResolver, CertStore, CertificateManager, ChallengeCache, Maintainer,
    StaticDomainAuthority, TlsAcceptor, open_store,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Pagesgate - serves custom-domain pages over HTTPS with certificates
/// obtained on demand
#[derive(Parser)]
#[command(name = "pagesgate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (TOML or JSON)
    #[arg(short, long, global = true, env = "PAGES_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(flatten)]
    overrides: OverrideArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Settings that override the configuration file
#[derive(Args, Debug, Default)]
struct OverrideArgs {
    /// Log level when RUST_LOG is unset
    #[arg(long, global = true, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// Bind host for both listeners
    #[arg(long, global = true, env = "HOST")]
    host: Option<String>,

    /// HTTPS port
    #[arg(long, global = true, env = "PORT")]
    port: Option<u16>,

    /// HTTP port
    #[arg(long, global = true, env = "HTTP_PORT")]
    http_port: Option<u16>,

    /// Run the HTTP listener (HTTP-01 challenges and redirects)
    #[arg(long, global = true, env = "ENABLE_HTTP_SERVER")]
    enable_http_server: Option<bool>,

    /// Primary domain suffix, e.g. pages.example.org
    #[arg(long, global = true, env = "PAGES_DOMAIN")]
    pages_domain: Option<String>,

    /// Keep certificates in memory only
    #[arg(long, global = true)]
    memory_store: bool,

    /// Certificate store file
    #[arg(long, global = true, env = "DB_PATH")]
    db_path: Option<PathBuf>,

    /// ACME account email
    #[arg(long, global = true, env = "ACME_EMAIL")]
    acme_email: Option<String>,

    /// ACME directory URL
    #[arg(long, global = true, env = "ACME_API")]
    acme_api: Option<String>,

    /// Accept the CA's terms of service
    #[arg(long, global = true, env = "ACME_ACCEPT_TERMS")]
    acme_accept_terms: Option<bool>,

    /// Apply the ACME rate limits
    #[arg(long, global = true, env = "ACME_USE_RATE_LIMITS")]
    acme_use_rate_limits: Option<bool>,

    /// External account binding HMAC (base64url)
    #[arg(long, global = true, env = "ACME_EAB_HMAC", hide_env_values = true)]
    acme_eab_hmac: Option<String>,

    /// External account binding key id
    #[arg(long, global = true, env = "ACME_EAB_KID")]
    acme_eab_kid: Option<String>,

    /// DNS-01 provider for the primary wildcard certificate
    #[arg(long, global = true, env = "DNS_PROVIDER")]
    dns_provider: Option<String>,

    /// ACME account artifact file
    #[arg(long, global = true, env = "ACME_ACCOUNT_CONFIG")]
    acme_account_config: Option<PathBuf>,
}

impl OverrideArgs {
    fn into_overrides(self) -> ConfigOverrides {
        ConfigOverrides {
            log_level: self.log_level,
            host: self.host,
            port: self.port,
            http_port: self.http_port,
            http_server_enabled: self.enable_http_server,
            main_domain: self.pages_domain,
            store_engine: self.memory_store.then_some(StoreEngine::Memory),
            store_path: self.db_path,
            acme_email: self.acme_email,
            acme_api: self.acme_api,
            acme_accept_terms: self.acme_accept_terms,
            acme_use_rate_limits: self.acme_use_rate_limits,
            acme_eab_hmac: self.acme_eab_hmac,
            acme_eab_kid: self.acme_eab_kid,
            dns_provider: self.dns_provider,
            account_config_file: self.acme_account_config,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP and HTTPS listeners
    Serve,

    /// Manage stored certificates
    Certs {
        #[command(subcommand)]
        action: CertsAction,
    },

    /// Validate the configuration
    Validate,

    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum CertsAction {
    /// Remove certificates so they are obtained again on the next handshake
    Remove {
        /// Domains to remove (`*.example.org` and `.example.org` are the same record)
        #[arg(required = true)]
        domains: Vec<String>,
    },

    /// List stored certificates
    List,
}

fn load_config(path: Option<&std::path::Path>, overrides: OverrideArgs, verbose: bool) -> anyhow::Result<Config> {
    let mut config = ConfigLoader::load_or_default(path)?;
    config.merge(overrides.into_overrides());
    if verbose {
        config.log_level = "debug".to_string();
    }
    Ok(config)
}

fn init_tracing(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pagesgate_tls::install_crypto_provider();
    let cli = Cli::parse();

    if let Commands::Version = cli.command {
        println!("Pagesgate v{}", pagesgate_core::VERSION);
        println!("Built with ❤️ in Rust");
        return Ok(());
    }

    let mut config = load_config(cli.config.as_deref(), cli.overrides, cli.verbose)?;
    init_tracing(&config.log_level);

    match cli.command {
        Commands::Serve => {
            config.validate()?;
            run_server(config).await?;
        }

        Commands::Certs { action } => {
            let store = open_store(&config.database)
                .await
                .context("failed to open certificate store")?;
            let result = manage_certs(store.as_ref(), action).await;
            store.close().await.context("failed to close certificate store")?;
            result?;
        }

        Commands::Validate => match config.validate() {
            Ok(()) => {
                println!("✅ Configuration is valid!");
                println!("   primary domain: {}", config.server.main_domain);
                println!("   ACME directory: {}", config.acme.api_endpoint);
            }
            Err(e) => {
                eprintln!("❌ Configuration Error: {}", e);
                std::process::exit(1);
            }
        },

        Commands::Version => {}
    }

    Ok(())
}

async fn manage_certs(store: &dyn CertStore, action: CertsAction) -> anyhow::Result<()> {
    match action {
        CertsAction::Remove { domains } => {
            for domain in domains {
                store
                    .delete(&domain)
                    .await
                    .with_context(|| format!("failed to remove {}", domain))?;
                println!("🗑️ Removed {}", domain);
            }
        }

        CertsAction::List => {
            let items = store.items(0, 0).await?;
            if items.is_empty() {
                println!("No certificates stored");
            }
            for (key, res) in items {
                println!(
                    "{:<40} {:<40} {:<5} valid until {}{}",
                    key,
                    res.domain,
                    format!("{:?}", res.origin).to_lowercase(),
                    res.valid_till,
                    res.retry_after
                        .map(|t| format!(" (retry after {})", t))
                        .unwrap_or_default()
                );
            }
        }
    }
    Ok(())
}

async fn resolve_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    tokio::net::lookup_host(addr)
        .await
        .with_context(|| format!("invalid listen address {}", addr))?
        .next()
        .with_context(|| format!("no address for {}", addr))
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    tracing::info!("🚀 Starting Pagesgate v{} for {}", pagesgate_core::VERSION, config.server.main_domain);

    let store = open_store(&config.database)
        .await
        .context("failed to open certificate store")?;
    // an unreadable store must stop startup before anything is issued
    store
        .get(&config.primary_suffix())
        .await
        .context("failed to read primary certificate from the store")?;

    let challenges = Arc::new(ChallengeCache::new());
    let mut builder = CertificateManager::builder(store.clone(), config.server.main_domain.clone())
        .rate_limits(config.acme.use_rate_limits)
        .challenge_cache(challenges.clone());

    if config.acme.api_endpoint == MOCK_ACME_DIRECTORY {
        tracing::warn!("🎭 Mock ACME directory configured, only mock certificates will be served");
    } else {
        match account::load_or_register(&config.acme).await {
            Ok(account) => {
                builder = builder.acme_account(
                    account,
                    config.server.http_server_enabled,
                    config.acme.dns_provider(),
                )?;
            }
            Err(e @ (AccountError::Acme(_) | AccountError::InvalidEab(_))) => {
                tracing::error!("❌ Couldn't set up ACME account, serving mock certificates only: {}", e);
            }
            Err(e) => return Err(e).context("failed to load ACME account"),
        }
    }

    let manager = builder.build();
    manager
        .ensure_primary_certificate()
        .await
        .context("failed to set up primary certificate")?;

    let authority = Arc::new(StaticDomainAuthority::new(&config.custom_domains));
    tracing::info!("📋 {} custom domain(s) configured", authority.len());
    let resolver = Arc::new(CertResolver::new(manager.clone(), authority));
    let acceptor = Arc::new(TlsAcceptor::new(resolver.clone())?);

    let cancel = CancellationToken::new();
    let mut tasks = tokio::task::JoinSet::new();

    let maintainer = Maintainer::new(manager.clone(), config.maintenance_interval()).with_resolver(resolver);
    let token = cancel.clone();
    tasks.spawn(async move {
        maintainer.run(token).await;
        Ok::<_, pagesgate_core::Error>(())
    });

    if config.server.http_server_enabled {
        let addr = resolve_addr(&config.http_address()).await?;
        let server = HttpServer::bind(addr, challenges, config.server.port).await?;
        tasks.spawn(server.serve(cancel.clone()));
    }

    let addr = resolve_addr(&config.https_address()).await?;
    let server = HttpsServer::bind(addr, acceptor, Arc::new(FallbackHandler)).await?;
    tasks.spawn(server.serve(cancel.clone()));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for shutdown signal")?;
            tracing::info!("🛑 Shutdown signal received");
        }
        Some(finished) = tasks.join_next() => {
            match finished {
                Ok(Ok(())) => tracing::warn!("⚠️ A listener stopped unexpectedly"),
                Ok(Err(e)) => tracing::error!("❌ Listener failed: {}", e),
                Err(e) => tracing::error!("💥 Listener task panicked: {}", e),
            }
        }
    }

    cancel.cancel();
    while let Some(finished) = tasks.join_next().await {
        if let Ok(Err(e)) = finished {
            tracing::warn!("⚠️ Error during shutdown: {}", e);
        }
    }

    store.close().await.context("failed to close certificate store")?;
    tracing::info!("👋 Pagesgate stopped");
    Ok(())
}
