//! JSON API over the record store plus the ingestion trigger.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};
use traitsync_core::config::LEGACY_CUTOFF;
use traitsync_core::StoredRecord;
use traitsync_storage::{OrderKey, RecordStore, StoreError, TraitFilter, TraitOrder};
use traitsync_sync::{classify, maybe_build_scheduler, IngestPipeline, SyncConfig};

pub const CRATE_NAME: &str = "traitsync-web";

const DEFAULT_PAGE_LIMIT: usize = 100;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<IngestPipeline>,
    pub store: Arc<dyn RecordStore>,
}

impl AppState {
    pub fn new(pipeline: Arc<IngestPipeline>) -> Self {
        let store = pipeline.store();
        Self { pipeline, store }
    }
}

#[derive(Debug, Deserialize, Default)]
struct TraitsQuery {
    page: Option<usize>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct SearchRequest {
    #[serde(default)]
    query: Option<String>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
struct Pagination {
    page: usize,
    limit: usize,
    total: usize,
    total_pages: usize,
    has_more: bool,
}

impl Pagination {
    fn new(page: usize, limit: usize, total: usize) -> Self {
        let total_pages = total.div_ceil(limit);
        Self {
            page,
            limit,
            total,
            total_pages,
            has_more: page < total_pages,
        }
    }
}

#[derive(Debug, Serialize)]
struct TraitsPage {
    traits: Vec<StoredRecord>,
    pagination: Pagination,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/scrape", post(scrape_handler))
        .route("/api/traits", get(traits_handler))
        .route("/api/traits/search", post(search_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("TRAITSYNC_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let config = SyncConfig::from_env();
    let pipeline = Arc::new(IngestPipeline::from_config(&config).await?);

    let scheduler = maybe_build_scheduler(pipeline.clone(), &config).await?;
    if let Some(sched) = &scheduler {
        sched.start().await?;
        info!(cron = %config.sync_cron, "ingestion scheduler started");
    }

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving traitsync api");
    axum::serve(listener, app(AppState::new(pipeline))).await?;
    Ok(())
}

async fn scrape_handler(State(state): State<Arc<AppState>>) -> Response {
    let status = state.pipeline.trigger().await;
    Json(status).into_response()
}

async fn traits_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TraitsQuery>,
) -> Response {
    let page = query.page.unwrap_or(1).max(1);
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT).max(1);
    let offset = (page - 1).saturating_mul(limit);

    match state
        .store
        .query(&TraitFilter::default(), TraitOrder::by(OrderKey::Name), offset, limit)
        .await
    {
        Ok((rows, total)) => Json(TraitsPage {
            traits: reclassify(rows),
            pagination: Pagination::new(page, limit, total),
        })
        .into_response(),
        Err(err) => server_error(err),
    }
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<SearchRequest>, JsonRejection>,
) -> Response {
    let query = match body {
        Ok(Json(SearchRequest { query: Some(q) })) if !q.trim().is_empty() => q,
        _ => return bad_request("Missing or invalid query"),
    };

    let filter = TraitFilter {
        search: Some(query),
        ..Default::default()
    };
    match state
        .store
        .query(&filter, TraitOrder::by(OrderKey::Name), 0, usize::MAX)
        .await
    {
        Ok((rows, _)) => Json(reclassify(rows)).into_response(),
        Err(err) => server_error(err),
    }
}

/// Rows written before a cutoff change still report the current classification.
fn reclassify(rows: Vec<StoredRecord>) -> Vec<StoredRecord> {
    let cutoff = LEGACY_CUTOFF;
    rows.into_iter()
        .map(|mut row| {
            row.record = classify(row.record, cutoff);
            row
        })
        .collect()
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

fn server_error(err: StoreError) -> Response {
    error!(error = %err, "record store query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}
