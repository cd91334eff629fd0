//! In-memory consent store

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use super::{ConsentId, ConsentRecord, ConsentStore, TokenUpdate};
use crate::{Error, Result};

/// Consent store backed by a map; updates are serialized by the write lock.
#[derive(Debug, Default)]
pub struct MemoryConsentStore {
    records: RwLock<HashMap<ConsentId, ConsentRecord>>,
}

impl MemoryConsentStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record as-is
    pub fn insert(&self, record: ConsentRecord) {
        self.records.write().insert(record.id, record);
    }

    /// Snapshot of a record without going through the async contract
    #[must_use]
    pub fn get(&self, id: ConsentId) -> Option<ConsentRecord> {
        self.records.read().get(&id).cloned()
    }
}

#[async_trait]
impl ConsentStore for MemoryConsentStore {
    async fn load(&self, id: ConsentId) -> Result<ConsentRecord> {
        self.get(id)
            .ok_or_else(|| Error::NotFound(format!("consent {id}")))
    }

    async fn update_tokens(&self, update: TokenUpdate) -> Result<ConsentRecord> {
        let mut records = self.records.write();
        let record = records
            .get_mut(&update.consent_id)
            .ok_or_else(|| Error::NotFound(format!("consent {}", update.consent_id)))?;

        // Apply to a copy so a rejected update leaves the record untouched
        let mut next = record.clone();
        next.apply(&update)?;
        *record = next.clone();

        debug!(consent_id = update.consent_id, version = next.version, "Tokens updated");
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consent::tests::{sample_consent, sample_update};

    #[tokio::test]
    async fn load_unknown_consent_is_not_found() {
        let store = MemoryConsentStore::new();
        let err = store.load(7).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn update_bumps_version() {
        let store = MemoryConsentStore::new();
        store.insert(sample_consent(1));

        let consent = store.load(1).await.unwrap();
        let updated = store.update_tokens(sample_update(&consent)).await.unwrap();

        assert_eq!(updated.version, 1);
        assert_eq!(store.load(1).await.unwrap(), updated);
    }

    #[tokio::test]
    async fn second_update_from_same_version_conflicts() {
        let store = MemoryConsentStore::new();
        store.insert(sample_consent(1));
        let consent = store.load(1).await.unwrap();

        store.update_tokens(sample_update(&consent)).await.unwrap();
        let err = store
            .update_tokens(sample_update(&consent))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(store.get(1).unwrap().version, 1);
    }
}
