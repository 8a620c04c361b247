//! Core domain model for traitsync: raw hits, reconciled records and stored rows.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod config;

pub const CRATE_NAME: &str = "traitsync-core";

/// Scalar or list value carried in a record's descriptive payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PayloadValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    TextList(Vec<String>),
}

impl PayloadValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }
}

impl From<&str> for PayloadValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for PayloadValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<String>> for PayloadValue {
    fn from(value: Vec<String>) -> Self {
        Self::TextList(value)
    }
}

/// Open set of descriptive fields copied through ingestion unchanged.
pub type Payload = BTreeMap<String, PayloadValue>;

/// One hit as returned by the bulk source, before reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawHit {
    /// Per-revision identifier assigned by the remote index.
    pub source_id: String,
    /// Logical identity key. Several revisions share one name.
    pub name: String,
    pub publication_date: Option<String>,
    pub legacy_flag: Option<bool>,
    #[serde(default)]
    pub payload: Payload,
}

/// A hit after duplicate resolution and legacy classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciledRecord {
    pub source_id: String,
    pub name: String,
    pub publication_date: Option<String>,
    pub legacy: bool,
    /// True when a newer revision with the same name exists in the run.
    pub superseded: bool,
    #[serde(default)]
    pub payload: Payload,
}

impl ReconciledRecord {
    pub fn from_hit(hit: RawHit, superseded: bool) -> Self {
        Self {
            source_id: hit.source_id,
            name: hit.name,
            publication_date: hit.publication_date,
            legacy: hit.legacy_flag.unwrap_or(false),
            superseded,
            payload: hit.payload,
        }
    }

    pub fn description(&self) -> Option<&str> {
        self.payload.get("description").and_then(PayloadValue::as_text)
    }
}

/// A reconciled record persisted by the record store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: Uuid,
    pub ingested_at: DateTime<Utc>,
    #[serde(flatten)]
    pub record: ReconciledRecord,
}

/// Last-fetched bookkeeping for one origin touched by direct web fetches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub url: String,
    pub last_scraped_at: DateTime<Utc>,
}
