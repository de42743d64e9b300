//! Identities, the `Authenticator` seam and the AUTH verification use case.
//!
//! An *identity* is the principal a client authenticates as.  Besides its
//! shared secret it carries two allow-lists:
//!
//! - `pubchans` – channels the identity may publish to.
//! - `subchans` – channels the identity may subscribe to.
//!
//! Identity records come from an [`Authenticator`] backend (in-memory map,
//! JSON file, environment...).  The broker looks a record up once per AUTH
//! frame and then holds it, unchanged, for the lifetime of that connection.

use std::collections::HashSet;

use async_trait::async_trait;
use hpfeeds_core::protocol::verify_digest;
use thiserror::Error;

/// Credential record for one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRecord {
    pub ident: String,
    pub secret: Vec<u8>,
    pub pubchans: HashSet<String>,
    pub subchans: HashSet<String>,
    /// Free-form owner label, used only for logging.
    pub owner: String,
}

impl IdentityRecord {
    /// Creates a record with empty allow-lists.
    pub fn new(ident: impl Into<String>, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            ident: ident.into(),
            secret: secret.into(),
            pubchans: HashSet::new(),
            subchans: HashSet::new(),
            owner: String::new(),
        }
    }

    pub fn with_pubchans<I, S>(mut self, chans: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pubchans = chans.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_subchans<I, S>(mut self, chans: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subchans = chans.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn may_publish(&self, channel: &str) -> bool {
        self.pubchans.contains(channel)
    }

    pub fn may_subscribe(&self, channel: &str) -> bool {
        self.subchans.contains(channel)
    }
}

/// Errors an [`Authenticator`] backend can report.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LookupError {
    /// No identity with this identifier exists.
    #[error("identity not found")]
    NotFound,
    /// The backend itself failed (unreadable file, bad data, ...).
    #[error("authenticator backend failure: {0}")]
    Backend(String),
}

/// Resolves identifiers to credential records.
///
/// Implementations must be cheap to share between connection tasks; the
/// broker holds one behind an `Arc<dyn Authenticator>`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Looks up `ident`.  Called exactly once per AUTH frame.
    async fn lookup(&self, ident: &str) -> Result<IdentityRecord, LookupError>;

    /// Re-reads the backing store.  Returns how many identities are served
    /// afterwards, or `None` for backends with nothing to re-read.
    async fn refresh(&self) -> Result<Option<usize>, LookupError> {
        Ok(None)
    }
}

/// Why an AUTH frame was refused.
///
/// The distinction is for broker-side logging only; the peer is sent the same
/// ERROR text for every variant so it cannot tell which identifiers exist.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AuthFailure {
    #[error("unknown identity {0:?}")]
    UnknownIdentity(String),
    #[error("digest mismatch for identity {0:?}")]
    DigestMismatch(String),
    #[error("lookup of identity {ident:?} failed: {reason}")]
    Backend { ident: String, reason: String },
}

/// Verifies an AUTH frame against the record returned by `authenticator`.
///
/// # Errors
///
/// Returns [`AuthFailure`] if the identity is unknown, the backend fails, or
/// `digest` is not `SHA1(nonce || secret)`.
pub async fn authenticate(
    authenticator: &dyn Authenticator,
    ident: &str,
    nonce: &[u8],
    digest: &[u8],
) -> Result<IdentityRecord, AuthFailure> {
    let record = match authenticator.lookup(ident).await {
        Ok(record) => record,
        Err(LookupError::NotFound) => return Err(AuthFailure::UnknownIdentity(ident.to_string())),
        Err(LookupError::Backend(reason)) => {
            return Err(AuthFailure::Backend {
                ident: ident.to_string(),
                reason,
            })
        }
    };

    if verify_digest(nonce, &record.secret, digest) {
        Ok(record)
    } else {
        Err(AuthFailure::DigestMismatch(ident.to_string()))
    }
}
