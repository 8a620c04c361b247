use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use traitsync_core::{ReconciledRecord, SourceRecord, StoredRecord};
use traitsync_storage::{
    DeletePredicate, MemoryRecordStore, RecordStore, StoreError, TraitFilter, TraitOrder,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Insert(String),
    Delete,
}

/// Wraps the memory store, records mutating calls in order and fails chosen inserts.
pub(crate) struct RecordingStore {
    pub(crate) inner: MemoryRecordStore,
    calls: Mutex<Vec<Call>>,
    fail_names: Vec<String>,
    fail_delete: bool,
}

impl RecordingStore {
    pub(crate) fn new(fail_names: &[&str], fail_delete: bool) -> Self {
        Self {
            inner: MemoryRecordStore::new(),
            calls: Mutex::new(Vec::new()),
            fail_names: fail_names.iter().map(|n| n.to_string()).collect(),
            fail_delete,
        }
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecordStore for RecordingStore {
    async fn now(&self) -> Result<DateTime<Utc>, StoreError> {
        self.inner.now().await
    }

    async fn insert(&self, record: &ReconciledRecord) -> Result<StoredRecord, StoreError> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::Insert(record.source_id.clone()));
        if self.fail_names.contains(&record.name) {
            return Err(StoreError::Rejected {
                source_id: record.source_id.clone(),
                reason: "constraint violation".into(),
            });
        }
        self.inner.insert(record).await
    }

    async fn query(
        &self,
        filter: &TraitFilter,
        order: TraitOrder,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<StoredRecord>, usize), StoreError> {
        self.inner.query(filter, order, offset, limit).await
    }

    async fn delete_where(&self, predicate: DeletePredicate) -> Result<u64, StoreError> {
        self.calls.lock().unwrap().push(Call::Delete);
        if self.fail_delete {
            return Err(StoreError::Rejected {
                source_id: "*".into(),
                reason: "connection reset".into(),
            });
        }
        self.inner.delete_where(predicate).await
    }

    async fn upsert_source(&self, source: &SourceRecord) -> Result<SourceRecord, StoreError> {
        self.inner.upsert_source(source).await
    }

    async fn sources(&self) -> Result<Vec<SourceRecord>, StoreError> {
        self.inner.sources().await
    }
}
