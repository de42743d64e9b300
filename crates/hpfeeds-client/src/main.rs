//! hpfeeds command-line client.
//!
//! # Usage
//!
//! ```text
//! hpfeeds-client --ident I --secret S [--host H] [--port P] subscribe -c CHAN [-c CHAN ...]
//! hpfeeds-client --ident I --secret S [--host H] [--port P] publish -c CHAN PAYLOAD
//! ```
//!
//! `subscribe` prints every received message as `[channel] ident: payload`
//! until Ctrl+C or until the broker closes the connection.  `publish` sends a
//! single message and exits once the session has been stopped.
//!
//! # Environment variable overrides
//!
//! | Variable            | Flag          |
//! |---------------------|---------------|
//! | `HPFEEDS_HOST`      | `--host`      |
//! | `HPFEEDS_PORT`      | `--port`      |
//! | `HPFEEDS_IDENT`     | `--ident`     |
//! | `HPFEEDS_SECRET`    | `--secret`    |
//! | `HPFEEDS_LOG_LEVEL` | `--log-level` |

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hpfeeds_client::{ClientSessionService, Message, SessionError};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// hpfeeds publish/subscribe client.
#[derive(Debug, Parser)]
#[command(name = "hpfeeds-client", about = "hpfeeds publish/subscribe client", version)]
struct Cli {
    /// Broker host name or address.
    #[arg(long, default_value = "127.0.0.1", env = "HPFEEDS_HOST")]
    host: String,

    /// Broker TCP port.
    #[arg(short, long, default_value_t = 10000, env = "HPFEEDS_PORT")]
    port: u16,

    /// Identity to authenticate as.
    #[arg(short, long, env = "HPFEEDS_IDENT")]
    ident: String,

    /// Shared secret of the identity.
    #[arg(short, long, env = "HPFEEDS_SECRET", hide_env_values = true)]
    secret: String,

    /// Log level used when `RUST_LOG` is not set.
    #[arg(long, default_value = "warn", env = "HPFEEDS_LOG_LEVEL")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print every message published on the given channels.
    Subscribe {
        #[arg(short = 'c', long = "channel", required = true)]
        channels: Vec<String>,
    },
    /// Publish one message and exit.
    Publish {
        #[arg(short = 'c', long)]
        channel: String,
        payload: String,
    },
}

impl Cli {
    fn endpoint(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("tcp:[{}]:{}", self.host, self.port)
        } else {
            format!("tcp:{}:{}", self.host, self.port)
        }
    }
}

/// Formats a received message for the terminal.
fn format_message(message: &Message) -> String {
    format!(
        "[{}] {}: {}",
        message.channel,
        message.ident,
        String::from_utf8_lossy(&message.payload)
    )
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let endpoint = cli.endpoint();
    let service = ClientSessionService::new(&endpoint, cli.ident.as_str(), cli.secret.as_str())
        .with_context(|| format!("invalid broker address {endpoint}"))?;

    service
        .start()
        .await
        .with_context(|| format!("failed to connect to {endpoint}"))?;
    service
        .when_connected()
        .await
        .with_context(|| format!("session with {endpoint} never became ready"))?;
    info!("connected to {endpoint} as {:?}", cli.ident);

    let result = match cli.command {
        Command::Subscribe { channels } => run_subscribe(&service, channels).await,
        Command::Publish { channel, payload } => service
            .publish(channel, payload.into_bytes())
            .context("failed to publish"),
    };

    service.stop().await;
    result
}

async fn run_subscribe(service: &ClientSessionService, channels: Vec<String>) -> anyhow::Result<()> {
    for channel in channels {
        service
            .subscribe(channel.as_str())
            .with_context(|| format!("failed to subscribe to {channel:?}"))?;
    }

    loop {
        tokio::select! {
            message = service.read() => match message {
                Ok(message) => println!("{}", format_message(&message)),
                Err(SessionError::Closed(reason)) => {
                    warn!("session closed: {reason}");
                    return Ok(());
                }
                Err(e) => return Err(e).context("failed to read from session"),
            },
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for Ctrl+C")?;
                info!("received Ctrl+C; disconnecting");
                return Ok(());
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_parse_subscribe_with_several_channels() {
        let cli = Cli::parse_from([
            "hpfeeds-client",
            "--ident",
            "reader",
            "--secret",
            "s3cret",
            "subscribe",
            "-c",
            "a",
            "-c",
            "b",
        ]);

        assert_eq!(cli.host, "127.0.0.1");
        assert_eq!(cli.port, 10000);
        match cli.command {
            Command::Subscribe { channels } => assert_eq!(channels, vec!["a", "b"]),
            other => panic!("expected subscribe, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_publish() {
        let cli = Cli::parse_from([
            "hpfeeds-client",
            "-i",
            "writer",
            "-s",
            "s3cret",
            "--host",
            "broker.local",
            "-p",
            "20000",
            "publish",
            "-c",
            "events",
            "hello world",
        ]);

        assert_eq!(cli.endpoint(), "tcp:broker.local:20000");
        match cli.command {
            Command::Publish { channel, payload } => {
                assert_eq!(channel, "events");
                assert_eq!(payload, "hello world");
            }
            other => panic!("expected publish, got {other:?}"),
        }
    }

    #[test]
    fn test_subscribe_requires_a_channel() {
        let result = Cli::try_parse_from([
            "hpfeeds-client",
            "-i",
            "reader",
            "-s",
            "x",
            "subscribe",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_ipv6_host_is_bracketed_in_endpoint() {
        let cli = Cli::parse_from([
            "hpfeeds-client",
            "-i",
            "a",
            "-s",
            "b",
            "--host",
            "::1",
            "publish",
            "-c",
            "x",
            "y",
        ]);
        assert_eq!(cli.endpoint(), "tcp:[::1]:10000");
    }

    #[test]
    fn test_format_message_replaces_invalid_utf8() {
        let message = Message {
            ident: "sensor".to_string(),
            channel: "raw".to_string(),
            payload: Bytes::from_static(b"ok \xff"),
        };
        assert_eq!(format_message(&message), "[raw] sensor: ok \u{fffd}");
    }
}
