//! Duplicate resolution and legacy classification. Both are pure.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use chrono::{DateTime, NaiveDate};
use traitsync_core::{RawHit, ReconciledRecord};

fn date_key(hit: &RawHit) -> &str {
    hit.publication_date.as_deref().unwrap_or_default()
}

/// Marks every hit except the newest revision of each name as superseded.
///
/// Names match exactly. Within a group the greatest publication date wins
/// (compared as strings, missing dates sort last); on equal dates the hit seen
/// first stays canonical. Output keeps fetch order.
pub fn reconcile(hits: Vec<RawHit>) -> Vec<ReconciledRecord> {
    let mut best: HashMap<&str, usize> = HashMap::new();
    for (idx, hit) in hits.iter().enumerate() {
        match best.entry(hit.name.as_str()) {
            Entry::Vacant(slot) => {
                slot.insert(idx);
            }
            Entry::Occupied(mut slot) => {
                if date_key(hit) > date_key(&hits[*slot.get()]) {
                    slot.insert(idx);
                }
            }
        }
    }
    let canonical: HashSet<usize> = best.into_values().collect();

    hits.into_iter()
        .enumerate()
        .map(|(idx, hit)| ReconciledRecord::from_hit(hit, !canonical.contains(&idx)))
        .collect()
}

/// Accepts `YYYY-MM-DD` or an RFC 3339 timestamp.
pub fn parse_publication_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.date_naive()))
}

/// Sets `legacy` when the publication date predates `cutoff`. Never clears it.
pub fn classify(mut record: ReconciledRecord, cutoff: NaiveDate) -> ReconciledRecord {
    if record.legacy {
        return record;
    }
    if let Some(date) = record
        .publication_date
        .as_deref()
        .and_then(parse_publication_date)
    {
        record.legacy = date < cutoff;
    }
    record
}

#[derive(Debug, Clone, Copy)]
pub struct Classifier {
    cutoff: NaiveDate,
}

impl Classifier {
    pub fn new(cutoff: NaiveDate) -> Self {
        Self { cutoff }
    }

    pub fn cutoff(&self) -> NaiveDate {
        self.cutoff
    }

    pub fn apply(&self, records: Vec<ReconciledRecord>) -> Vec<ReconciledRecord> {
        records
            .into_iter()
            .map(|record| classify(record, self.cutoff))
            .collect()
    }
}
