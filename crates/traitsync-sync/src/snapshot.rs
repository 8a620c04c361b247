//! Generation-based snapshot replacement: insert the new run, then drop older rows.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{info, warn};
use traitsync_core::ReconciledRecord;
use traitsync_storage::{DeletePredicate, RecordStore};
use uuid::Uuid;

use crate::IngestError;

/// Ephemeral context for one pipeline execution.
#[derive(Debug, Clone)]
pub struct IngestionRun {
    pub run_id: Uuid,
    /// Read from the store clock before the bulk fetch starts.
    pub run_start: DateTime<Utc>,
    pub records: Vec<ReconciledRecord>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteSummary {
    pub inserted: usize,
    pub failed: usize,
    pub deleted: u64,
}

pub struct SnapshotWriter {
    store: Arc<dyn RecordStore>,
    insert_concurrency: usize,
}

impl SnapshotWriter {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            insert_concurrency: 1,
        }
    }

    pub fn with_insert_concurrency(mut self, insert_concurrency: usize) -> Self {
        self.insert_concurrency = insert_concurrency.max(1);
        self
    }

    /// Inserts every record, then deletes rows stored before `run.run_start`.
    ///
    /// The delete phase starts only after all inserts have finished and at
    /// least one of them succeeded.
    pub async fn write(&self, run: &IngestionRun) -> Result<WriteSummary, IngestError> {
        if run.records.is_empty() {
            return Err(IngestError::EmptyResult);
        }

        let store = &self.store;
        let records = &run.records;
        let outcomes = stream::iter(0..records.len())
            .map(|idx| async move {
                let record = &records[idx];
                (record, store.insert(record).await)
            })
            .buffer_unordered(self.insert_concurrency)
            .collect::<Vec<_>>()
            .await;

        let mut summary = WriteSummary::default();
        for (record, outcome) in outcomes {
            match outcome {
                Ok(_) => summary.inserted += 1,
                Err(err) => {
                    summary.failed += 1;
                    warn!(
                        run_id = %run.run_id,
                        source_id = %record.source_id,
                        name = %record.name,
                        error = %err,
                        "inserting record failed"
                    );
                }
            }
        }

        if summary.inserted == 0 {
            return Err(IngestError::PartialWriteFailure {
                inserted: 0,
                failed: summary.failed,
                deleted: 0,
                reason: "no record was inserted; previous snapshot kept".to_string(),
            });
        }

        summary.deleted = self
            .store
            .delete_where(DeletePredicate::IngestedBefore(run.run_start))
            .await
            .map_err(|err| IngestError::PartialWriteFailure {
                inserted: summary.inserted,
                failed: summary.failed,
                deleted: 0,
                reason: format!("removing previous snapshot failed: {err}"),
            })?;

        info!(
            run_id = %run.run_id,
            inserted = summary.inserted,
            failed = summary.failed,
            deleted = summary.deleted,
            "snapshot replaced"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Call, RecordingStore};
    use traitsync_core::{Payload, StoredRecord};
    use traitsync_storage::{MemoryRecordStore, TraitFilter, TraitOrder};

    fn record(id: &str, name: &str) -> ReconciledRecord {
        ReconciledRecord {
            source_id: id.into(),
            name: name.into(),
            publication_date: Some("2024-01-01".into()),
            legacy: false,
            superseded: false,
            payload: Payload::new(),
        }
    }

    async fn run_for(store: &dyn RecordStore, records: Vec<ReconciledRecord>) -> IngestionRun {
        IngestionRun {
            run_id: Uuid::new_v4(),
            run_start: store.now().await.unwrap(),
            records,
        }
    }

    async fn all_rows(store: &dyn RecordStore) -> Vec<StoredRecord> {
        store
            .query(&TraitFilter::default(), TraitOrder::default(), 0, usize::MAX)
            .await
            .unwrap()
            .0
    }

    #[tokio::test]
    async fn new_generation_replaces_old_one() {
        let store = Arc::new(RecordingStore::new(&[], false));
        let writer = SnapshotWriter::new(store.clone());

        let first = run_for(store.as_ref(), vec![record("a", "Fire"), record("b", "Air")]).await;
        let summary = writer.write(&first).await.unwrap();
        assert_eq!(summary, WriteSummary { inserted: 2, failed: 0, deleted: 0 });

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = run_for(store.as_ref(), vec![record("c", "Earth")]).await;
        let summary = writer.write(&second).await.unwrap();
        assert_eq!(summary, WriteSummary { inserted: 1, failed: 0, deleted: 2 });

        let rows = all_rows(store.as_ref()).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].record.source_id, "c");
    }

    #[tokio::test]
    async fn inserts_all_finish_before_delete() {
        let store = Arc::new(RecordingStore::new(&["Air"], false));
        let writer = SnapshotWriter::new(store.clone()).with_insert_concurrency(4);
        let run = run_for(
            store.as_ref(),
            vec![record("a", "Fire"), record("b", "Air"), record("c", "Earth")],
        )
        .await;

        let summary = writer.write(&run).await.unwrap();
        assert_eq!(summary.inserted, 2);
        assert_eq!(summary.failed, 1);

        let calls = store.calls();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls.last(), Some(&Call::Delete));
        assert!(calls[..3].iter().all(|c| matches!(c, Call::Insert(_))));
    }

    #[tokio::test]
    async fn all_inserts_failing_never_deletes() {
        let store = Arc::new(RecordingStore::new(&["Fire", "Air"], false));
        store.inner.insert(&record("old", "Old")).await.unwrap();
        let writer = SnapshotWriter::new(store.clone());
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let run = run_for(store.as_ref(), vec![record("a", "Fire"), record("b", "Air")]).await;

        let err = writer.write(&run).await.unwrap_err();
        assert!(matches!(
            err,
            IngestError::PartialWriteFailure { inserted: 0, failed: 2, .. }
        ));
        assert!(!store.calls().contains(&Call::Delete));
        assert_eq!(all_rows(store.as_ref()).await.len(), 1);
    }

    #[tokio::test]
    async fn empty_run_touches_nothing() {
        let store = Arc::new(RecordingStore::new(&[], false));
        let writer = SnapshotWriter::new(store.clone());
        let run = run_for(store.as_ref(), Vec::new()).await;

        assert!(matches!(
            writer.write(&run).await.unwrap_err(),
            IngestError::EmptyResult
        ));
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn delete_failure_keeps_new_rows() {
        let store = Arc::new(RecordingStore::new(&[], true));
        let writer = SnapshotWriter::new(store.clone());
        let run = run_for(store.as_ref(), vec![record("a", "Fire")]).await;

        let err = writer.write(&run).await.unwrap_err();
        assert!(matches!(
            err,
            IngestError::PartialWriteFailure { inserted: 1, .. }
        ));
        assert_eq!(all_rows(store.as_ref()).await.len(), 1);
    }

    #[tokio::test]
    async fn stored_rows_round_trip_modulo_store_fields() {
        let store = Arc::new(MemoryRecordStore::new());
        let writer = SnapshotWriter::new(store.clone());
        let mut fire = record("a", "Fire");
        fire.payload.insert("rarity".into(), "common".into());
        fire.payload
            .insert("trait_group".into(), vec!["Elemental".to_string()].into());
        let records = vec![fire, record("b", "Air")];
        let run = run_for(store.as_ref(), records.clone()).await;
        writer.write(&run).await.unwrap();

        let mut stored = all_rows(store.as_ref())
            .await
            .into_iter()
            .map(|row| {
                assert!(row.ingested_at >= run.run_start);
                row.record
            })
            .collect::<Vec<_>>();
        stored.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        assert_eq!(stored, records);
    }
}
