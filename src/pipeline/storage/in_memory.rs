use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

use super::{PriceStore, StoreError};
use crate::types::CanonicalRecord;

/// In-memory price store for dry runs and tests
#[derive(Clone, Default)]
pub struct InMemoryStore {
    rows: Arc<Mutex<BTreeMap<String, CanonicalRecord>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PriceStore for InMemoryStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn upsert_batch(&self, records: &[CanonicalRecord]) -> Result<usize, StoreError> {
        let mut rows = self
            .rows
            .lock()
            .map_err(|_| StoreError::Backend("in-memory store poisoned".to_string()))?;
        for record in records {
            rows.insert(record.identity_key(), record.clone());
        }
        debug!("Upserted {} rows in memory", records.len());
        Ok(records.len())
    }

    async fn load_all(&self) -> Result<Vec<CanonicalRecord>, StoreError> {
        let rows = self
            .rows
            .lock()
            .map_err(|_| StoreError::Backend("in-memory store poisoned".to_string()))?;
        Ok(rows.values().cloned().collect())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let rows = self
            .rows
            .lock()
            .map_err(|_| StoreError::Backend("in-memory store poisoned".to_string()))?;
        Ok(rows.len())
    }
}
