//! Credential backends implementing [`Authenticator`].
//!
//! # Sub-modules
//!
//! - **`memory`**    – identities fixed at startup, from the TOML config or
//!   built in code (tests).
//! - **`json_file`** – identities loaded from a JSON file, re-read by
//!   [`Authenticator::refresh`].
//! - **`env`**       – identities read from `HPFEEDS_<IDENT>_*` variables.

pub mod env;
pub mod json_file;
pub mod memory;

use std::sync::Arc;

use tracing::{info, warn};

use crate::application::identity::{Authenticator, IdentityRecord};
use crate::infrastructure::storage::config::{AuthBackend, AuthSettings};

pub use env::EnvAuthenticator;
pub use json_file::{AuthBackendError, JsonFileAuthenticator};
pub use memory::MemoryAuthenticator;

/// Builds the backend selected in `[auth]`.
///
/// # Errors
///
/// Returns [`AuthBackendError`] if the JSON backend is selected and its file
/// cannot be loaded.
pub fn build_authenticator(
    settings: &AuthSettings,
) -> Result<Arc<dyn Authenticator>, AuthBackendError> {
    let authenticator: Arc<dyn Authenticator> = match settings.backend {
        AuthBackend::Memory => {
            let memory =
                MemoryAuthenticator::new(settings.identities.iter().map(IdentityRecord::from));
            if memory.is_empty() {
                warn!("memory credential backend has no identities; every AUTH will fail");
            } else {
                info!("memory credential backend serves {} identities", memory.len());
            }
            Arc::new(memory)
        }
        AuthBackend::Json => {
            // `AppConfig::validate` guarantees a path for this backend.
            let path = settings.path.clone().unwrap_or_default();
            Arc::new(JsonFileAuthenticator::load(path)?)
        }
        AuthBackend::Env => Arc::new(EnvAuthenticator::new()),
    };
    Ok(authenticator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::identity::LookupError;
    use crate::infrastructure::storage::config::IdentityEntry;

    #[tokio::test]
    async fn test_memory_backend_serves_inline_identities() {
        // Arrange
        let settings = AuthSettings {
            backend: AuthBackend::Memory,
            path: None,
            identities: vec![IdentityEntry {
                ident: "test".to_string(),
                secret: "secret".to_string(),
                pubchans: vec!["test-chan".to_string()],
                subchans: vec![],
                owner: String::new(),
            }],
        };

        // Act
        let auth = build_authenticator(&settings).unwrap();

        // Assert
        assert!(auth.lookup("test").await.unwrap().may_publish("test-chan"));
        assert_eq!(auth.lookup("other").await, Err(LookupError::NotFound));
    }

    #[tokio::test]
    async fn test_refresh_rereads_json_backend_only() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.json");
        std::fs::write(&path, r#"{"old": {"secret": "s1"}}"#).unwrap();
        let json = build_authenticator(&AuthSettings {
            backend: AuthBackend::Json,
            path: Some(path.clone()),
            identities: vec![],
        })
        .unwrap();
        let memory = build_authenticator(&AuthSettings::default()).unwrap();

        // Act
        std::fs::write(&path, r#"{"new": {"secret": "s2"}, "other": {"secret": "s3"}}"#).unwrap();
        let refreshed = json.refresh().await;

        // Assert
        assert_eq!(refreshed, Ok(Some(2)));
        assert_eq!(json.lookup("old").await, Err(LookupError::NotFound));
        assert!(json.lookup("new").await.is_ok());
        assert_eq!(memory.refresh().await, Ok(None));
    }

    #[test]
    fn test_json_backend_surfaces_load_errors() {
        let dir = tempfile::tempdir().unwrap();
        let settings = AuthSettings {
            backend: AuthBackend::Json,
            path: Some(dir.path().join("missing.json")),
            identities: vec![],
        };
        assert!(build_authenticator(&settings).is_err());
    }
}
