#![warn(missing_docs)]

//! jailftpd server binary

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use jailftpd::auth::{CredentialOracle, UserTable};
use jailftpd::{signals, FtpConfig, Server};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter};

#[derive(Parser)]
#[command(name = "jailftpd")]
#[command(about = "Chrooted FTP server", long_about = None)]
struct Cli {
    /// Configuration file; defaults apply when it does not exist
    #[arg(short, long, default_value = "/etc/jailftpd.toml", env = "JAILFTPD_CONFIG")]
    config: PathBuf,

    /// Log at debug level
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let from_env = std::env::var_os(EnvFilter::DEFAULT_ENV).is_some();
    let initial = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let (filter, filter_handle) = reload::Layer::new(initial);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();

    let config = FtpConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    if !cli.debug && !from_env {
        filter_handle
            .reload(EnvFilter::new(&config.log_level))
            .context("applying log_level")?;
    }

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "jailftpd starting");

    let config = Arc::new(config);
    let users = UserTable::from_config(&config);
    tracing::info!(users = users.len(), anonymous = config.allow_anonymous, "credentials loaded");
    let oracle: Arc<dyn CredentialOracle> = Arc::new(users);

    let shutdown = CancellationToken::new();
    signals::install(shutdown.clone()).context("installing signal handlers")?;

    let server = Server::bind(Arc::clone(&config), oracle, shutdown)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    server.run().await?;

    Ok(())
}
