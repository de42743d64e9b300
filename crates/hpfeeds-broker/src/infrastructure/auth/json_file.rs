//! Credential store backed by a JSON file.
//!
//! File layout, keyed by identifier:
//!
//! ```json
//! {
//!   "test": {
//!     "secret": "secret",
//!     "pubchans": ["test-chan"],
//!     "subchans": ["test-chan"],
//!     "owner": "some-owner"
//!   }
//! }
//! ```
//!
//! The file is parsed once at startup.  [`JsonFileAuthenticator::reload`]
//! re-reads it (the broker binary does so on `SIGHUP`); lookups made after a successful reload see the new records
//! while connections that already authenticated keep the record they got.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

use crate::application::identity::{Authenticator, IdentityRecord, LookupError};

/// Errors raised while loading an identity file.
#[derive(Debug, Error)]
pub enum AuthBackendError {
    #[error("I/O error reading identity file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse identity file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Deserialize)]
struct JsonIdentity {
    secret: String,
    #[serde(default)]
    pubchans: Vec<String>,
    #[serde(default)]
    subchans: Vec<String>,
    #[serde(default)]
    owner: String,
}

/// Identities loaded from a JSON file.
#[derive(Debug)]
pub struct JsonFileAuthenticator {
    path: PathBuf,
    records: RwLock<HashMap<String, IdentityRecord>>,
}

impl JsonFileAuthenticator {
    /// Reads and parses `path`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthBackendError`] if the file cannot be read or is not a
    /// valid identity map.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, AuthBackendError> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|source| AuthBackendError::Io {
            path: path.clone(),
            source,
        })?;
        let records = parse_identities(&path, &content)?;
        info!("loaded {} identities from {}", records.len(), path.display());
        Ok(Self {
            path,
            records: RwLock::new(records),
        })
    }

    /// Re-reads the file, replacing every record.  Returns the new count.
    ///
    /// On error the previous records stay in place.
    pub async fn reload(&self) -> Result<usize, AuthBackendError> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| AuthBackendError::Io {
                path: self.path.clone(),
                source,
            })?;
        let fresh = parse_identities(&self.path, &content)?;
        let count = fresh.len();
        *self.records.write().await = fresh;
        info!("reloaded {count} identities from {}", self.path.display());
        Ok(count)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn parse_identities(
    path: &Path,
    content: &str,
) -> Result<HashMap<String, IdentityRecord>, AuthBackendError> {
    let raw: HashMap<String, JsonIdentity> =
        serde_json::from_str(content).map_err(|source| AuthBackendError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    Ok(raw
        .into_iter()
        .map(|(ident, entry)| {
            let record = IdentityRecord::new(ident.clone(), entry.secret.into_bytes())
                .with_pubchans(entry.pubchans)
                .with_subchans(entry.subchans)
                .with_owner(entry.owner);
            (ident, record)
        })
        .collect())
}

#[async_trait]
impl Authenticator for JsonFileAuthenticator {
    async fn lookup(&self, ident: &str) -> Result<IdentityRecord, LookupError> {
        self.records
            .read()
            .await
            .get(ident)
            .cloned()
            .ok_or(LookupError::NotFound)
    }

    async fn refresh(&self) -> Result<Option<usize>, LookupError> {
        self.reload()
            .await
            .map(Some)
            .map_err(|e| LookupError::Backend(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDENTITIES: &str = r#"{
        "test": {
            "secret": "secret",
            "pubchans": ["test-chan"],
            "subchans": ["test-chan"],
            "owner": "some-owner"
        }
    }"#;

    fn write_file(dir: &tempfile::TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("auth.json");
        std::fs::write(&path, content).expect("write identity file");
        path
    }

    #[tokio::test]
    async fn test_load_parses_identity_map() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, IDENTITIES);

        // Act
        let auth = JsonFileAuthenticator::load(&path).unwrap();
        let record = auth.lookup("test").await.unwrap();

        // Assert
        assert_eq!(record.secret, b"secret".to_vec());
        assert!(record.may_publish("test-chan"));
        assert!(record.may_subscribe("test-chan"));
        assert_eq!(record.owner, "some-owner");
        assert_eq!(auth.lookup("other").await, Err(LookupError::NotFound));
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = JsonFileAuthenticator::load(dir.path().join("absent.json"));
        assert!(matches!(result, Err(AuthBackendError::Io { .. })));
    }

    #[test]
    fn test_load_rejects_entry_without_secret() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, r#"{"test": {"pubchans": []}}"#);
        let result = JsonFileAuthenticator::load(&path);
        assert!(matches!(result, Err(AuthBackendError::Parse { .. })));
    }

    #[tokio::test]
    async fn test_reload_picks_up_new_records() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, IDENTITIES);
        let auth = JsonFileAuthenticator::load(&path).unwrap();

        // Act
        write_file(&dir, r#"{"fresh": {"secret": "s3"}}"#);
        let count = auth.reload().await.unwrap();

        // Assert
        assert_eq!(count, 1);
        assert_eq!(auth.lookup("test").await, Err(LookupError::NotFound));
        assert_eq!(auth.lookup("fresh").await.unwrap().secret, b"s3".to_vec());
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_previous_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, IDENTITIES);
        let auth = JsonFileAuthenticator::load(&path).unwrap();

        write_file(&dir, "not json");
        assert!(auth.reload().await.is_err());
        assert!(auth.lookup("test").await.is_ok());
    }
}
