//! TOML-based configuration for the broker.
//!
//! The broker reads an optional config file passed on the command line.
//! Every field has a default, so a missing file (or a file that only sets a
//! few keys) still yields a complete [`AppConfig`].
//!
//! ```toml
//! [broker]
//! name = "hpfeeds"
//! bind_address = "0.0.0.0:10000"
//! max_frame_size = 1048576
//! outbound_queue_capacity = 1024
//! echo_to_publisher = false
//! log_level = "info"
//!
//! [auth]
//! backend = "memory"
//!
//! [[auth.identities]]
//! ident = "test"
//! secret = "secret"
//! pubchans = ["test-chan"]
//! subchans = ["test-chan"]
//! owner = "some-owner"
//! ```
//!
//! # Serde default values
//!
//! Fields annotated with `#[serde(default = "some_fn")]` use the return value
//! of `some_fn()` when the key is absent from the file.

use std::path::{Path, PathBuf};

use hpfeeds_core::protocol::DEFAULT_MAX_FRAME_SIZE;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::identity::IdentityRecord;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The file parsed but a value is out of range.
    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level broker configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub broker: BrokerSettings,
    #[serde(default)]
    pub auth: AuthSettings,
}

/// Listener and routing behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSettings {
    /// Server name advertised in every INFO frame.
    #[serde(default = "default_name")]
    pub name: String,
    /// `host:port` the TCP listener binds to.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Largest frame, in bytes, accepted from a peer.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// Frames buffered per connection before publishes to it are dropped.
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
    /// Deliver a publish back to its publisher when it is subscribed too.
    #[serde(default)]
    pub echo_to_publisher: bool,
    /// `tracing` log level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Which credential backend resolves identities.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthBackend {
    /// Identities listed inline under `[[auth.identities]]`.
    #[default]
    Memory,
    /// A JSON file of identities, see `auth.path`.
    Json,
    /// `HPFEEDS_<IDENT>_*` environment variables.
    Env,
}

/// Credential backend selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AuthSettings {
    #[serde(default)]
    pub backend: AuthBackend,
    /// JSON identity file, required when `backend = "json"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Inline identities for the memory backend.
    #[serde(default)]
    pub identities: Vec<IdentityEntry>,
}

/// One inline identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdentityEntry {
    pub ident: String,
    pub secret: String,
    #[serde(default)]
    pub pubchans: Vec<String>,
    #[serde(default)]
    pub subchans: Vec<String>,
    #[serde(default)]
    pub owner: String,
}

impl From<&IdentityEntry> for IdentityRecord {
    fn from(entry: &IdentityEntry) -> Self {
        IdentityRecord::new(entry.ident.clone(), entry.secret.as_bytes())
            .with_pubchans(entry.pubchans.iter().cloned())
            .with_subchans(entry.subchans.iter().cloned())
            .with_owner(entry.owner.clone())
    }
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_name() -> String {
    "hpfeeds".to_string()
}
fn default_bind_address() -> String {
    "0.0.0.0:10000".to_string()
}
fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}
fn default_outbound_queue_capacity() -> usize {
    1024
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            name: default_name(),
            bind_address: default_bind_address(),
            max_frame_size: default_max_frame_size(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
            echo_to_publisher: false,
            log_level: default_log_level(),
        }
    }
}

impl AppConfig {
    /// Checks values that parse fine but cannot run.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_host_port(&self.broker.bind_address) {
            return Err(ConfigError::Invalid {
                field: "broker.bind_address",
                reason: format!("{:?} is not a host:port address", self.broker.bind_address),
            });
        }
        if self.broker.name.len() > u8::MAX as usize {
            return Err(ConfigError::Invalid {
                field: "broker.name",
                reason: "must be at most 255 bytes".to_string(),
            });
        }
        if self.broker.max_frame_size < 5 {
            return Err(ConfigError::Invalid {
                field: "broker.max_frame_size",
                reason: "must be at least 5 bytes".to_string(),
            });
        }
        if self.broker.outbound_queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "broker.outbound_queue_capacity",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.auth.backend == AuthBackend::Json && self.auth.path.is_none() {
            return Err(ConfigError::Invalid {
                field: "auth.path",
                reason: "required when auth.backend = \"json\"".to_string(),
            });
        }
        Ok(())
    }
}

/// `host:port` with a non-empty host and a numeric port.  Name resolution
/// happens at bind time.
fn is_host_port(address: &str) -> bool {
    match address.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

/// Loads `AppConfig` from `path`, returning `AppConfig::default()` if the
/// file does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found"
/// and [`ConfigError::Parse`] if the TOML is malformed.  Values are not
/// checked here; call [`AppConfig::validate`] once overrides are applied.
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str::<AppConfig>(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
