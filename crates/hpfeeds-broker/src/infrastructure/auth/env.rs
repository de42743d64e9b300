//! Credential store backed by environment variables.
//!
//! For identifier `sensor-01` the backend reads:
//!
//! | Variable                     | Meaning                          |
//! |------------------------------|----------------------------------|
//! | `HPFEEDS_SENSOR_01_SECRET`   | shared secret (required)         |
//! | `HPFEEDS_SENSOR_01_PUBCHANS` | comma-separated publish channels |
//! | `HPFEEDS_SENSOR_01_SUBCHANS` | comma-separated subscribe channels |
//! | `HPFEEDS_SENSOR_01_OWNER`    | owner label                      |
//!
//! Variables are read on every lookup, so changes apply to the next AUTH.
//!
//! Only identifiers made of lowercase ASCII letters, digits and `-` are
//! served.  Anything else (`TEST`, `te_st`) would share variables with
//! another identifier and is reported as unknown.

use async_trait::async_trait;

use crate::application::identity::{Authenticator, IdentityRecord, LookupError};

const DEFAULT_PREFIX: &str = "HPFEEDS";

#[derive(Debug, Clone)]
pub struct EnvAuthenticator {
    prefix: String,
}

impl Default for EnvAuthenticator {
    fn default() -> Self {
        Self::with_prefix(DEFAULT_PREFIX)
    }
}

impl EnvAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `<prefix>_<IDENT>_*` instead of `HPFEEDS_<IDENT>_*`.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn var_name(&self, ident: &str, suffix: &str) -> String {
        debug_assert!(is_env_ident(ident));
        let key: String = ident
            .chars()
            .map(|c| if c == '-' { '_' } else { c.to_ascii_uppercase() })
            .collect();
        format!("{}_{}_{}", self.prefix, key, suffix)
    }

    fn read(&self, ident: &str, suffix: &str) -> Result<Option<String>, LookupError> {
        match std::env::var(self.var_name(ident, suffix)) {
            Ok(value) => Ok(Some(value)),
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(std::env::VarError::NotUnicode(_)) => Err(LookupError::Backend(format!(
                "{} is not valid unicode",
                self.var_name(ident, suffix)
            ))),
        }
    }
}

/// Identifiers whose variable names cannot collide with another one.
fn is_env_ident(ident: &str) -> bool {
    !ident.is_empty()
        && ident
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

fn split_channels(value: Option<String>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl Authenticator for EnvAuthenticator {
    async fn lookup(&self, ident: &str) -> Result<IdentityRecord, LookupError> {
        if !is_env_ident(ident) {
            return Err(LookupError::NotFound);
        }
        let secret = self.read(ident, "SECRET")?.ok_or(LookupError::NotFound)?;
        let pubchans = split_channels(self.read(ident, "PUBCHANS")?);
        let subchans = split_channels(self.read(ident, "SUBCHANS")?);
        let owner = self.read(ident, "OWNER")?.unwrap_or_default();

        Ok(IdentityRecord::new(ident, secret.into_bytes())
            .with_pubchans(pubchans)
            .with_subchans(subchans)
            .with_owner(owner))
    }
}
