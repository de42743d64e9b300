//! In-memory credential store.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::application::identity::{Authenticator, IdentityRecord, LookupError};

/// Identities held in a plain map, fixed at construction.
#[derive(Debug, Clone, Default)]
pub struct MemoryAuthenticator {
    records: HashMap<String, IdentityRecord>,
}

impl MemoryAuthenticator {
    pub fn new<I>(records: I) -> Self
    where
        I: IntoIterator<Item = IdentityRecord>,
    {
        Self {
            records: records
                .into_iter()
                .map(|record| (record.ident.clone(), record))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl Authenticator for MemoryAuthenticator {
    async fn lookup(&self, ident: &str) -> Result<IdentityRecord, LookupError> {
        self.records.get(ident).cloned().ok_or(LookupError::NotFound)
    }
}
