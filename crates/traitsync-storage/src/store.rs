//! Record store contract and the in-memory implementation.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;
use traitsync_core::{ReconciledRecord, SourceRecord, StoredRecord};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("schema migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("record {source_id} rejected: {reason}")]
    Rejected { source_id: String, reason: String },
}

/// Row filter for [`RecordStore::query`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraitFilter {
    /// Case-insensitive substring over name and description.
    pub search: Option<String>,
    pub legacy: Option<bool>,
    pub include_superseded: bool,
}

impl Default for TraitFilter {
    fn default() -> Self {
        Self {
            search: None,
            legacy: None,
            include_superseded: true,
        }
    }
}

impl TraitFilter {
    pub fn matches(&self, record: &ReconciledRecord) -> bool {
        if !self.include_superseded && record.superseded {
            return false;
        }
        if let Some(legacy) = self.legacy {
            if record.legacy != legacy {
                return false;
            }
        }
        match self.search.as_deref().map(str::trim) {
            Some(needle) if !needle.is_empty() => {
                let needle = needle.to_lowercase();
                record.name.to_lowercase().contains(&needle)
                    || record
                        .description()
                        .is_some_and(|d| d.to_lowercase().contains(&needle))
            }
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderKey {
    #[default]
    Name,
    PublicationDate,
    IngestedAt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TraitOrder {
    pub key: OrderKey,
    pub descending: bool,
}

impl TraitOrder {
    pub fn by(key: OrderKey) -> Self {
        Self {
            key,
            descending: false,
        }
    }

    pub fn desc(mut self) -> Self {
        self.descending = true;
        self
    }

    fn compare(&self, a: &StoredRecord, b: &StoredRecord) -> Ordering {
        let ordering = match self.key {
            OrderKey::Name => a.record.name.cmp(&b.record.name),
            OrderKey::PublicationDate => a
                .record
                .publication_date
                .as_deref()
                .unwrap_or_default()
                .cmp(b.record.publication_date.as_deref().unwrap_or_default()),
            OrderKey::IngestedAt => a.ingested_at.cmp(&b.ingested_at),
        };
        if self.descending {
            ordering.reverse()
        } else {
            ordering
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletePredicate {
    /// Rows whose `ingested_at` is strictly earlier than the timestamp.
    IngestedBefore(DateTime<Utc>),
}

impl DeletePredicate {
    pub fn matches(&self, stored: &StoredRecord) -> bool {
        match self {
            Self::IngestedBefore(cutoff) => stored.ingested_at < *cutoff,
        }
    }
}

/// Opaque persistence surface consumed by the pipeline and the fetcher.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Clock used for `ingested_at`; run start times are read from it.
    async fn now(&self) -> Result<DateTime<Utc>, StoreError>;

    async fn insert(&self, record: &ReconciledRecord) -> Result<StoredRecord, StoreError>;

    async fn query(
        &self,
        filter: &TraitFilter,
        order: TraitOrder,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<StoredRecord>, usize), StoreError>;

    async fn delete_where(&self, predicate: DeletePredicate) -> Result<u64, StoreError>;

    /// Insert or replace by `url`.
    async fn upsert_source(&self, source: &SourceRecord) -> Result<SourceRecord, StoreError>;

    async fn sources(&self) -> Result<Vec<SourceRecord>, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    traits: Vec<StoredRecord>,
    sources: BTreeMap<String, SourceRecord>,
}

/// Process-local store used when no database is configured.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    state: RwLock<MemoryState>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.traits.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn now(&self) -> Result<DateTime<Utc>, StoreError> {
        Ok(Utc::now())
    }

    async fn insert(&self, record: &ReconciledRecord) -> Result<StoredRecord, StoreError> {
        let mut state = self.state.write().await;
        let stored = StoredRecord {
            id: Uuid::new_v4(),
            ingested_at: Utc::now(),
            record: record.clone(),
        };
        state.traits.push(stored.clone());
        Ok(stored)
    }

    async fn query(
        &self,
        filter: &TraitFilter,
        order: TraitOrder,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<StoredRecord>, usize), StoreError> {
        let state = self.state.read().await;
        let mut rows = state
            .traits
            .iter()
            .filter(|stored| filter.matches(&stored.record))
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| order.compare(a, b));
        let total = rows.len();
        let page = rows.into_iter().skip(offset).take(limit).collect();
        Ok((page, total))
    }

    async fn delete_where(&self, predicate: DeletePredicate) -> Result<u64, StoreError> {
        let mut state = self.state.write().await;
        let before = state.traits.len();
        state.traits.retain(|stored| !predicate.matches(stored));
        Ok((before - state.traits.len()) as u64)
    }

    async fn upsert_source(&self, source: &SourceRecord) -> Result<SourceRecord, StoreError> {
        let mut state = self.state.write().await;
        state.sources.insert(source.url.clone(), source.clone());
        Ok(source.clone())
    }

    async fn sources(&self) -> Result<Vec<SourceRecord>, StoreError> {
        Ok(self.state.read().await.sources.values().cloned().collect())
    }
}
