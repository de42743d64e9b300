//! hpfeeds broker entry point.
//!
//! # Usage
//!
//! ```text
//! hpfeeds-broker [OPTIONS]
//!
//! Options:
//!   -c, --config <PATH>        TOML config file [default: hpfeeds-broker.toml]
//!       --bind <ADDR>          Listener address, overrides broker.bind_address
//!       --name <NAME>          Server name sent in INFO, overrides broker.name
//!       --echo-to-publisher    Deliver publishes back to a subscribed publisher
//!       --log-level <LEVEL>    Log level when RUST_LOG is unset
//! ```
//!
//! A missing config file is not an error: every setting has a default, and
//! the memory backend then starts with no identities.
//!
//! On Unix, `SIGHUP` re-reads the credential store (the JSON backend's file).
//!
//! # Environment variable overrides
//!
//! | Variable              | Flag          |
//! |-----------------------|---------------|
//! | `HPFEEDS_CONFIG`      | `--config`    |
//! | `HPFEEDS_BIND`        | `--bind`      |
//! | `HPFEEDS_SERVER_NAME` | `--name`      |
//! | `HPFEEDS_LOG_LEVEL`   | `--log-level` |

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use hpfeeds_broker::application::identity::Authenticator;
use hpfeeds_broker::infrastructure::auth::build_authenticator;
use hpfeeds_broker::infrastructure::network::{Broker, BrokerConfig};
use hpfeeds_broker::infrastructure::storage::config::{load_config, AppConfig};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// hpfeeds publish/subscribe broker.
#[derive(Debug, Parser)]
#[command(name = "hpfeeds-broker", about = "hpfeeds publish/subscribe broker", version)]
struct Cli {
    /// Path of the TOML config file.
    #[arg(short, long, default_value = "hpfeeds-broker.toml", env = "HPFEEDS_CONFIG")]
    config: PathBuf,

    /// `host:port` to listen on.
    #[arg(long, env = "HPFEEDS_BIND")]
    bind: Option<String>,

    /// Server name advertised in INFO frames.
    #[arg(long, env = "HPFEEDS_SERVER_NAME")]
    name: Option<String>,

    /// Deliver a publish back to its publisher when it is subscribed too.
    #[arg(long)]
    echo_to_publisher: bool,

    /// Log level used when `RUST_LOG` is not set.
    #[arg(long, env = "HPFEEDS_LOG_LEVEL")]
    log_level: Option<String>,
}

impl Cli {
    /// Lets command-line values win over the config file.
    fn apply_overrides(self, config: &mut AppConfig) {
        if let Some(bind) = self.bind {
            config.broker.bind_address = bind;
        }
        if let Some(name) = self.name {
            config.broker.name = name;
        }
        if self.echo_to_publisher {
            config.broker.echo_to_publisher = true;
        }
        if let Some(level) = self.log_level {
            config.broker.log_level = level;
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone();

    let mut config = load_config(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    cli.apply_overrides(&mut config);
    config.validate().context("invalid configuration")?;

    // `RUST_LOG` wins; otherwise the configured level applies.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.broker.log_level)),
        )
        .init();

    let authenticator =
        build_authenticator(&config.auth).context("failed to initialise credential backend")?;

    let broker = Broker::bind(
        config.broker.bind_address.as_str(),
        Arc::clone(&authenticator),
        BrokerConfig::from(&config.broker),
    )
    .await
    .with_context(|| format!("failed to bind {}", config.broker.bind_address))?;

    info!(
        "hpfeeds broker {:?} starting with {:?} credential backend",
        config.broker.name, config.auth.backend
    );

    tokio::select! {
        result = broker.serve_forever() => result.context("accept loop failed")?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl+C")?;
            info!("received Ctrl+C; shutting down");
        }
        result = refresh_on_hangup(authenticator) => {
            result.context("failed to listen for SIGHUP")?;
        }
    }

    broker.stop().await;
    info!("hpfeeds broker stopped");
    Ok(())
}

/// Refreshes the credential store on every `SIGHUP`.  Only returns if the
/// signal handler cannot be installed.
#[cfg(unix)]
async fn refresh_on_hangup(authenticator: Arc<dyn Authenticator>) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangups = signal(SignalKind::hangup())?;
    while hangups.recv().await.is_some() {
        match authenticator.refresh().await {
            Ok(Some(count)) => info!("SIGHUP: credential store now serves {count} identities"),
            Ok(None) => info!("SIGHUP: credential backend has nothing to re-read"),
            Err(e) => error!("SIGHUP: credential refresh failed, keeping old records: {e}"),
        }
    }
    std::future::pending().await
}

#[cfg(not(unix))]
async fn refresh_on_hangup(_authenticator: Arc<dyn Authenticator>) -> std::io::Result<()> {
    std::future::pending().await
}

// ── Tests ─────────────────────────────────────────────────────────────────────
