//! Bulk source contracts + the search-index and fixture-file implementations.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use traitsync_core::config::{
    BULK_FETCH_TIMEOUT, BULK_PAGE_SIZE_MAX, DEFAULT_CATEGORY, DEFAULT_ELASTIC_URL,
    DEFAULT_SOURCE_NAME, DEFAULT_USER_AGENT,
};
use traitsync_core::{Payload, PayloadValue, RawHit};

pub const CRATE_NAME: &str = "traitsync-adapters";

/// Payload fields that are always stored as lists. Absent or falsy values become `[]`.
const LIST_FIELDS: &[&str] = &[
    "trait_group",
    "trait_raw",
    "category",
    "source_raw",
    "source_category",
];

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("bulk source unavailable: {0}")]
    Unavailable(String),
    #[error("bulk source response malformed: {0}")]
    Malformed(String),
    #[error("bulk source returned zero hits")]
    EmptyResult,
}

#[async_trait]
pub trait BulkSource: Send + Sync {
    fn source_id(&self) -> &str;

    /// One bounded request for the full record set. Never retries.
    async fn fetch_all(&self) -> Result<Vec<RawHit>, SourceError>;
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    hits: Option<SearchHits>,
}

#[derive(Debug, Deserialize)]
struct SearchHits {
    #[serde(default)]
    hits: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_source", default)]
    source: Map<String, JsonValue>,
}

/// Decode a search response body into raw hits, in response order.
pub fn decode_search_response(body: &[u8]) -> Result<Vec<RawHit>, SourceError> {
    let response: SearchResponse =
        serde_json::from_slice(body).map_err(|err| SourceError::Malformed(err.to_string()))?;
    let hits = response.hits.map(|h| h.hits).unwrap_or_default();
    let returned = hits.len();

    let raw = hits
        .into_iter()
        .filter_map(|hit| search_hit_to_raw(hit.id, hit.source))
        .collect::<Vec<_>>();

    if raw.len() < returned {
        warn!(
            skipped = returned - raw.len(),
            "skipped hits without a usable name"
        );
    }
    if raw.is_empty() {
        return Err(SourceError::EmptyResult);
    }
    Ok(raw)
}

fn search_hit_to_raw(source_id: String, mut source: Map<String, JsonValue>) -> Option<RawHit> {
    let name = match source.remove("name") {
        Some(JsonValue::String(name)) => name,
        _ => {
            warn!(%source_id, "hit has no name");
            return None;
        }
    };
    // Values of an unexpected type stay in the payload.
    let publication_date = match source.remove("release_date") {
        Some(JsonValue::String(date)) => Some(date.trim().to_string()).filter(|d| !d.is_empty()),
        Some(other) => {
            source.insert("release_date".into(), other);
            None
        }
        None => None,
    };
    let legacy_flag = match source.remove("is_legacy") {
        Some(JsonValue::Bool(flag)) => Some(flag),
        Some(other) => {
            source.insert("is_legacy".into(), other);
            None
        }
        None => None,
    };

    let mut payload = source
        .into_iter()
        .filter_map(|(key, value)| json_to_payload(value).map(|v| (key, v)))
        .collect::<Payload>();
    normalize_payload(&mut payload);

    Some(RawHit {
        source_id,
        name,
        publication_date,
        legacy_flag,
        payload,
    })
}

fn json_to_payload(value: JsonValue) -> Option<PayloadValue> {
    match value {
        JsonValue::Null => None,
        JsonValue::Bool(b) => Some(PayloadValue::Bool(b)),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => Some(PayloadValue::Integer(i)),
            None => n.as_f64().map(PayloadValue::Float),
        },
        JsonValue::String(s) => Some(PayloadValue::Text(s)),
        JsonValue::Array(items) if items.iter().all(JsonValue::is_string) => Some(
            PayloadValue::TextList(
                items
                    .into_iter()
                    .filter_map(|item| match item {
                        JsonValue::String(s) => Some(s),
                        _ => None,
                    })
                    .collect(),
            ),
        ),
        other => Some(PayloadValue::Text(other.to_string())),
    }
}

fn scalar_text(value: &PayloadValue) -> String {
    match value {
        PayloadValue::Bool(b) => b.to_string(),
        PayloadValue::Integer(i) => i.to_string(),
        PayloadValue::Float(f) => f.to_string(),
        PayloadValue::Text(s) => s.clone(),
        PayloadValue::TextList(items) => items.join(", "),
    }
}

fn is_falsy(value: &PayloadValue) -> bool {
    match value {
        PayloadValue::Bool(b) => !b,
        PayloadValue::Integer(i) => *i == 0,
        PayloadValue::Float(f) => *f == 0.0 || f.is_nan(),
        PayloadValue::Text(s) => s.is_empty(),
        PayloadValue::TextList(_) => false,
    }
}

fn normalize_payload(payload: &mut Payload) {
    for field in LIST_FIELDS {
        let items = match payload.remove(*field) {
            Some(PayloadValue::TextList(items)) => items,
            Some(value) if is_falsy(&value) => Vec::new(),
            Some(value) => vec![scalar_text(&value)],
            None => Vec::new(),
        };
        payload.insert((*field).to_string(), PayloadValue::TextList(items));
    }

    let first_source = match payload.get("source") {
        Some(PayloadValue::TextList(items)) => Some(items.first().cloned()),
        _ => None,
    };
    match first_source {
        Some(Some(first)) => {
            payload.insert("source".into(), PayloadValue::Text(first));
        }
        Some(None) => {
            payload.remove("source");
        }
        None => {}
    }
    payload
        .entry("source".into())
        .or_insert_with(|| PayloadValue::Text(DEFAULT_SOURCE_NAME.to_string()));

    if let Some(url) = payload.get("url").cloned() {
        payload.entry("source_url".into()).or_insert(url);
    }
}

#[derive(Debug, Clone)]
pub struct ElasticSourceConfig {
    pub endpoint: String,
    pub category: String,
    pub page_size: usize,
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for ElasticSourceConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ELASTIC_URL.to_string(),
            category: DEFAULT_CATEGORY.to_string(),
            page_size: BULK_PAGE_SIZE_MAX,
            timeout: BULK_FETCH_TIMEOUT,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

/// Single-request client for the remote search index.
#[derive(Debug)]
pub struct ElasticTraitSource {
    client: reqwest::Client,
    config: ElasticSourceConfig,
}

impl ElasticTraitSource {
    pub fn new(config: ElasticSourceConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building bulk source client")?;
        Ok(Self { client, config })
    }

    pub fn query_body(&self) -> JsonValue {
        json!({
            "from": 0,
            "size": self.config.page_size.min(BULK_PAGE_SIZE_MAX),
            "query": { "match": { "category": self.config.category } },
        })
    }
}

#[async_trait]
impl BulkSource for ElasticTraitSource {
    fn source_id(&self) -> &str {
        &self.config.endpoint
    }

    async fn fetch_all(&self) -> Result<Vec<RawHit>, SourceError> {
        let span = info_span!("bulk_fetch", endpoint = %self.config.endpoint);
        async {
            let resp = self
                .client
                .post(&self.config.endpoint)
                .json(&self.query_body())
                .send()
                .await
                .map_err(|err| SourceError::Unavailable(err.to_string()))?;

            let status = resp.status();
            if !status.is_success() {
                return Err(SourceError::Unavailable(format!(
                    "http status {} from {}",
                    status.as_u16(),
                    self.config.endpoint
                )));
            }
            let body = resp
                .bytes()
                .await
                .map_err(|err| SourceError::Unavailable(err.to_string()))?;

            let hits = decode_search_response(&body)?;
            info!(hits = hits.len(), "retrieved hits from search index");
            Ok::<_, SourceError>(hits)
        }
        .instrument(span)
        .await
    }
}

/// Reads a captured search response from disk.
#[derive(Debug, Clone)]
pub struct FixtureTraitSource {
    path: PathBuf,
}

impl FixtureTraitSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl BulkSource for FixtureTraitSource {
    fn source_id(&self) -> &str {
        self.path.to_str().unwrap_or("fixture")
    }

    async fn fetch_all(&self) -> Result<Vec<RawHit>, SourceError> {
        let body = tokio::fs::read(&self.path).await.map_err(|err| {
            SourceError::Unavailable(format!("reading {}: {err}", self.path.display()))
        })?;
        decode_search_response(&body)
    }
}
