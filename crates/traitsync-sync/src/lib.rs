//! Ingestion pipeline: bulk fetch, reconcile, classify, replace the stored snapshot.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use traitsync_adapters::{
    BulkSource, ElasticSourceConfig, ElasticTraitSource, FixtureTraitSource, SourceError,
};
use traitsync_core::config::{DEFAULT_ELASTIC_URL, DEFAULT_USER_AGENT, LEGACY_CUTOFF};
use traitsync_storage::{MemoryRecordStore, PgRecordStore, RecordStore};
use uuid::Uuid;

mod reconcile;
mod snapshot;
#[cfg(test)]
mod test_support;

pub use reconcile::{classify, parse_publication_date, reconcile, Classifier};
pub use snapshot::{IngestionRun, SnapshotWriter, WriteSummary};

pub const CRATE_NAME: &str = "traitsync-sync";

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("bulk source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("bulk source returned no records")]
    EmptyResult,
    #[error("partial write failure ({inserted} inserted, {failed} failed, {deleted} deleted): {reason}")]
    PartialWriteFailure {
        inserted: usize,
        failed: usize,
        deleted: u64,
        reason: String,
    },
    #[error("record store unavailable: {0}")]
    StoreUnavailable(String),
}

impl From<SourceError> for IngestError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::EmptyResult => Self::EmptyResult,
            SourceError::Unavailable(msg) => Self::SourceUnavailable(msg),
            SourceError::Malformed(msg) => Self::SourceUnavailable(format!("malformed response: {msg}")),
        }
    }
}

/// Terminal status reported to triggers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RunStatus {
    Done,
    Error { message: String },
}

impl RunStatus {
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestRunSummary {
    pub run_id: Uuid,
    pub run_start: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched: usize,
    pub superseded: usize,
    pub legacy: usize,
    #[serde(flatten)]
    pub write: WriteSummary,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub elastic_url: String,
    pub fixture_path: Option<PathBuf>,
    pub user_agent: String,
    pub insert_concurrency: usize,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty()),
            elastic_url: std::env::var("TRAITSYNC_ELASTIC_URL")
                .unwrap_or_else(|_| DEFAULT_ELASTIC_URL.to_string()),
            fixture_path: std::env::var("TRAITSYNC_FIXTURE_PATH").ok().map(PathBuf::from),
            user_agent: std::env::var("TRAITSYNC_USER_AGENT")
                .unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string()),
            insert_concurrency: std::env::var("TRAITSYNC_INSERT_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1),
            scheduler_enabled: std::env::var("TRAITSYNC_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("SYNC_CRON").unwrap_or_else(|_| "0 0 6 * * *".to_string()),
        }
    }
}

/// Postgres when `DATABASE_URL` is set, otherwise a process-local store.
pub async fn build_store(config: &SyncConfig) -> Result<Arc<dyn RecordStore>> {
    match config.database_url.as_deref() {
        Some(url) => {
            let store = PgRecordStore::connect(url)
                .await
                .context("connecting to DATABASE_URL")?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; records are kept in memory only");
            Ok(Arc::new(MemoryRecordStore::new()))
        }
    }
}

pub fn build_source(config: &SyncConfig) -> Result<Arc<dyn BulkSource>> {
    if let Some(path) = &config.fixture_path {
        info!(path = %path.display(), "reading bulk hits from fixture");
        return Ok(Arc::new(FixtureTraitSource::new(path.clone())));
    }
    let source = ElasticTraitSource::new(ElasticSourceConfig {
        endpoint: config.elastic_url.clone(),
        user_agent: config.user_agent.clone(),
        ..Default::default()
    })?;
    Ok(Arc::new(source))
}

pub struct IngestPipeline {
    source: Arc<dyn BulkSource>,
    store: Arc<dyn RecordStore>,
    writer: SnapshotWriter,
    classifier: Classifier,
    run_lock: Mutex<()>,
}

impl IngestPipeline {
    pub fn new(source: Arc<dyn BulkSource>, store: Arc<dyn RecordStore>) -> Self {
        Self {
            source,
            writer: SnapshotWriter::new(store.clone()),
            store,
            classifier: Classifier::new(LEGACY_CUTOFF),
            run_lock: Mutex::new(()),
        }
    }

    pub fn with_insert_concurrency(mut self, insert_concurrency: usize) -> Self {
        self.writer = self.writer.with_insert_concurrency(insert_concurrency);
        self
    }

    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        let store = build_store(config).await?;
        let source = build_source(config)?;
        Ok(Self::new(source, store).with_insert_concurrency(config.insert_concurrency))
    }

    pub fn store(&self) -> Arc<dyn RecordStore> {
        self.store.clone()
    }

    /// Runs one ingestion. Concurrent callers queue behind the run in progress.
    pub async fn run_once(&self) -> Result<IngestRunSummary, IngestError> {
        let _guard = self.run_lock.lock().await;
        let run_id = Uuid::new_v4();
        let span = info_span!("ingest_run", %run_id, source = self.source.source_id());
        async {
            let run_start = self
                .store
                .now()
                .await
                .map_err(|err| IngestError::StoreUnavailable(err.to_string()))?;

            let hits = self.source.fetch_all().await?;
            let fetched = hits.len();
            let records = self.classifier.apply(reconcile(hits));
            let superseded = records.iter().filter(|r| r.superseded).count();
            let legacy = records.iter().filter(|r| r.legacy).count();
            info!(fetched, superseded, legacy, "reconciled bulk hits");

            let run = IngestionRun {
                run_id,
                run_start,
                records,
            };
            let write = self.writer.write(&run).await?;

            Ok(IngestRunSummary {
                run_id,
                run_start,
                finished_at: Utc::now(),
                fetched,
                superseded,
                legacy,
                write,
            })
        }
        .instrument(span)
        .await
    }

    pub async fn trigger(&self) -> RunStatus {
        match self.run_once().await {
            Ok(summary) => {
                info!(run_id = %summary.run_id, inserted = summary.write.inserted, "ingestion done");
                RunStatus::Done
            }
            Err(err) => {
                error!(error = %err, "ingestion failed");
                RunStatus::Error {
                    message: err.to_string(),
                }
            }
        }
    }
}

pub async fn maybe_build_scheduler(
    pipeline: Arc<IngestPipeline>,
    config: &SyncConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            info!("scheduled ingestion triggered");
            pipeline.trigger().await;
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

pub async fn run_ingestion_from_env() -> Result<RunStatus> {
    let config = SyncConfig::from_env();
    let pipeline = IngestPipeline::from_config(&config).await?;
    Ok(pipeline.trigger().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Call, RecordingStore};
    use async_trait::async_trait;
    use std::io::Write;
    use traitsync_core::{Payload, RawHit};
    use traitsync_storage::{OrderKey, TraitFilter, TraitOrder};

    struct StaticSource(Vec<RawHit>);

    #[async_trait]
    impl BulkSource for StaticSource {
        fn source_id(&self) -> &str {
            "static"
        }

        async fn fetch_all(&self) -> Result<Vec<RawHit>, SourceError> {
            if self.0.is_empty() {
                return Err(SourceError::EmptyResult);
            }
            Ok(self.0.clone())
        }
    }

    struct UnreachableSource;

    #[async_trait]
    impl BulkSource for UnreachableSource {
        fn source_id(&self) -> &str {
            "unreachable"
        }

        async fn fetch_all(&self) -> Result<Vec<RawHit>, SourceError> {
            Err(SourceError::Unavailable("connection refused".into()))
        }
    }

    fn scheduler_config(enabled: bool) -> SyncConfig {
        SyncConfig {
            database_url: None,
            elastic_url: DEFAULT_ELASTIC_URL.to_string(),
            fixture_path: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            insert_concurrency: 1,
            scheduler_enabled: enabled,
            sync_cron: "*/1 * * * * *".to_string(),
        }
    }

    fn hit(id: &str, name: &str, date: Option<&str>) -> RawHit {
        RawHit {
            source_id: id.into(),
            name: name.into(),
            publication_date: date.map(str::to_string),
            legacy_flag: None,
            payload: Payload::new(),
        }
    }

    #[tokio::test]
    async fn empty_bulk_result_makes_no_store_writes() {
        let store = Arc::new(RecordingStore::new(&[], false));
        let pipeline = IngestPipeline::new(Arc::new(StaticSource(Vec::new())), store.clone());

        let err = pipeline.run_once().await.unwrap_err();
        assert!(matches!(err, IngestError::EmptyResult));
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn fixture_run_reconciles_and_classifies() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"hits":{{"hits":[
                {{"_id":"1","_source":{{"name":"Fire","release_date":"2024-01-01"}}}},
                {{"_id":"2","_source":{{"name":"Fire","release_date":"2022-12-01"}}}},
                {{"_id":"3","_source":{{"name":"Air"}}}}
            ]}}}}"#
        )
        .unwrap();

        let store = Arc::new(RecordingStore::new(&[], false));
        let pipeline =
            IngestPipeline::new(Arc::new(FixtureTraitSource::new(file.path())), store.clone());
        let summary = pipeline.run_once().await.unwrap();
        assert_eq!(summary.fetched, 3);
        assert_eq!(summary.superseded, 1);
        assert_eq!(summary.legacy, 1);
        assert_eq!(summary.write.inserted, 3);

        let (canonical, total) = store
            .query(
                &TraitFilter {
                    include_superseded: false,
                    ..Default::default()
                },
                TraitOrder::by(OrderKey::Name),
                0,
                10,
            )
            .await
            .unwrap();
        assert_eq!(total, 2);
        let names = canonical.iter().map(|r| r.record.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["Air", "Fire"]);
        assert_eq!(
            canonical[1].record.publication_date.as_deref(),
            Some("2024-01-01")
        );
    }

    #[tokio::test]
    async fn second_run_replaces_first_generation() {
        let store = Arc::new(RecordingStore::new(&[], false));
        let first = IngestPipeline::new(
            Arc::new(StaticSource(vec![hit("1", "Fire", None), hit("2", "Air", None)])),
            store.clone(),
        );
        first.run_once().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let second = IngestPipeline::new(
            Arc::new(StaticSource(vec![hit("3", "Earth", Some("2024-01-01"))])),
            store.clone(),
        );
        let summary = second.run_once().await.unwrap();
        assert_eq!(summary.write.deleted, 2);
        assert_eq!(store.inner.len().await, 1);

        let calls = store.calls();
        assert_eq!(
            calls,
            vec![
                Call::Insert("1".into()),
                Call::Insert("2".into()),
                Call::Delete,
                Call::Insert("3".into()),
                Call::Delete,
            ]
        );
    }

    #[tokio::test]
    async fn failures_surface_as_error_status() {
        let store = Arc::new(RecordingStore::new(&["Fire"], false));
        let pipeline =
            IngestPipeline::new(Arc::new(StaticSource(vec![hit("1", "Fire", None)])), store);
        let status = pipeline.trigger().await;
        assert!(!status.is_done());
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "error");
        assert!(json["message"].as_str().unwrap().contains("0 inserted"));
    }

    #[tokio::test]
    async fn unavailable_source_aborts_before_any_write() {
        let store = Arc::new(RecordingStore::new(&[], false));
        let pipeline = IngestPipeline::new(Arc::new(UnreachableSource), store.clone());

        let err = pipeline.run_once().await.unwrap_err();
        assert!(matches!(err, IngestError::SourceUnavailable(_)));
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn malformed_fixture_aborts_before_any_write() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{\"hits\": [not json").unwrap();

        let store = Arc::new(RecordingStore::new(&[], false));
        let pipeline =
            IngestPipeline::new(Arc::new(FixtureTraitSource::new(file.path())), store.clone());
        let err = pipeline.run_once().await.unwrap_err();
        assert!(matches!(err, IngestError::SourceUnavailable(_)));
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn disabled_scheduler_is_not_built() {
        let store = Arc::new(RecordingStore::new(&[], false));
        let pipeline = Arc::new(IngestPipeline::new(Arc::new(UnreachableSource), store));
        let sched = maybe_build_scheduler(pipeline, &scheduler_config(false))
            .await
            .unwrap();
        assert!(sched.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn scheduled_job_runs_ingestion() {
        let store = Arc::new(RecordingStore::new(&[], false));
        let pipeline = Arc::new(IngestPipeline::new(
            Arc::new(StaticSource(vec![hit("1", "Fire", Some("2024-01-01"))])),
            store.clone(),
        ));
        let mut sched = maybe_build_scheduler(pipeline, &scheduler_config(true))
            .await
            .unwrap()
            .expect("scheduler enabled");
        sched.start().await.unwrap();

        let mut stored = 0;
        for _ in 0..50 {
            stored = store.inner.len().await;
            if stored > 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        sched.shutdown().await.unwrap();
        assert!(stored >= 1);
    }

    #[test]
    fn run_status_serializes_as_tagged_object() {
        assert_eq!(
            serde_json::to_value(RunStatus::Done).unwrap(),
            serde_json::json!({"status": "done"})
        );
    }

    #[test]
    fn malformed_source_is_reported_as_unavailable() {
        let err = IngestError::from(SourceError::Malformed("expected value".into()));
        assert!(matches!(err, IngestError::SourceUnavailable(_)));
    }
}
