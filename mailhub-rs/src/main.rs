use anyhow::Context;
use clap::{Parser, Subcommand};
use mailhub_rs::config::{Config, LoggingConfig};
use mailhub_rs::imap::ImapServer;
use mailhub_rs::queue::{MxTransport, QueueProcessor};
use mailhub_rs::security::tls::generate_self_signed_cert;
use mailhub_rs::security::{Authenticator, TlsConfig};
use mailhub_rs::server::Acceptor;
use mailhub_rs::smtp::{LocalDelivery, SmtpServer};
use mailhub_rs::store::open_store;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "mailhub-rs")]
#[command(about = "SMTP and IMAP mail server", long_about = None)]
struct Cli {
    /// Configuration file; defaults are used when it does not exist
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the SMTP and IMAP servers (default)
    Serve,
    /// Create an account with an INBOX
    AddUser {
        /// Full email address
        address: String,
        password: String,
    },
    /// Write a self-signed certificate for development
    GenCert {
        domain: String,
        cert: PathBuf,
        key: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    init_logging(&config.logging);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::AddUser { address, password } => {
            let store = open_store(&config.storage.database_url).await?;
            let authenticator = Authenticator::new(store, config.server.domain.clone());
            authenticator
                .add_user(&address, &password)
                .await
                .with_context(|| format!("failed to add user {}", address))?;
            println!("User {} added", address);
            Ok(())
        }
        Commands::GenCert { domain, cert, key } => {
            generate_self_signed_cert(&domain, &cert, &key)?;
            println!("Certificate written to {} and key to {}", cert.display(), key.display());
            Ok(())
        }
    }
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    let mut config = if path.exists() {
        Config::from_file(path).with_context(|| format!("invalid config {}", path.display()))?
    } else {
        Config::default()
    };
    if config.server.hostname.trim().is_empty() {
        config.server.hostname = gethostname::gethostname().to_string_lossy().into_owned();
    }
    Ok(config)
}

/// RUST_LOG takes precedence over `logging.level`
fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("mailhub_rs={}", logging.level)));
    let registry = tracing_subscriber::registry().with(filter);

    match logging.format.as_str() {
        "json" => registry.with(fmt::layer().json()).init(),
        "compact" => registry.with(fmt::layer().compact()).init(),
        _ => registry.with(fmt::layer().pretty()).init(),
    }
}

fn load_tls(
    protocol: &str,
    enabled: bool,
    cert: &Option<String>,
    key: &Option<String>,
) -> anyhow::Result<Option<TlsConfig>> {
    if !enabled {
        return Ok(None);
    }
    match (cert, key) {
        (Some(cert), Some(key)) => {
            let tls = TlsConfig::from_pem_files(cert, key)
                .with_context(|| format!("failed to load {} TLS certificate", protocol))?;
            Ok(Some(tls))
        }
        _ => anyhow::bail!("{} TLS enabled without certificate and key", protocol),
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    info!("Starting mailhub-rs v{}", env!("CARGO_PKG_VERSION"));
    info!("  Domain: {}", config.server.domain);
    info!("  Hostname: {}", config.server.hostname);
    info!("  Storage: {}", config.storage.database_url);

    let config = Arc::new(config);
    let store = open_store(&config.storage.database_url).await?;
    let shutdown = CancellationToken::new();
    let mut tasks = JoinSet::new();

    let smtp_tls = load_tls(
        "SMTP",
        config.smtp.enable_tls,
        &config.smtp.tls_cert_path,
        &config.smtp.tls_key_path,
    )?;
    let smtp = Acceptor::bind(&config.smtp.listen_addr, smtp_tls, config.smtp.idle_timeout())
        .await
        .with_context(|| format!("failed to bind SMTP on {}", config.smtp.listen_addr))?;
    let smtp_server = Arc::new(SmtpServer::new(config.clone(), store.clone()));
    tasks.spawn(smtp.run(smtp_server, shutdown.clone()));

    let imap_tls = load_tls(
        "IMAP",
        config.imap.enable_tls,
        &config.imap.tls_cert_path,
        &config.imap.tls_key_path,
    )?;
    let imap = Acceptor::bind(&config.imap.listen_addr, imap_tls, config.imap.idle_timeout())
        .await
        .with_context(|| format!("failed to bind IMAP on {}", config.imap.listen_addr))?;
    let imap_server = Arc::new(ImapServer::new(config.clone(), store.clone()));
    tasks.spawn(imap.run(imap_server, shutdown.clone()));

    if config.queue.enabled {
        let delivery = Arc::new(LocalDelivery::new(store.clone(), config.local_domains()));
        let transport = Arc::new(MxTransport::new(
            config.queue.relay_host.clone(),
            config.queue.smtp_port,
            config.server.hostname.clone(),
        ));
        let processor = Arc::new(QueueProcessor::new(&config, delivery, transport));
        tasks.spawn(processor.run(shutdown.clone()));
    } else {
        warn!("Outbound queue disabled; remote mail stays queued");
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for ctrl-c")?;
            info!("Shutdown requested");
        }
        Some(result) = tasks.join_next() => {
            match result {
                Ok(Ok(())) => warn!("A server task exited early"),
                Ok(Err(e)) => error!("Server task failed: {}", e),
                Err(e) => error!("Server task panicked: {}", e),
            }
        }
    }

    shutdown.cancel();
    while let Some(result) = tasks.join_next().await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Server task failed during shutdown: {}", e),
            Err(e) => error!("Server task panicked: {}", e),
        }
    }
    info!("mailhub-rs stopped");
    Ok(())
}
