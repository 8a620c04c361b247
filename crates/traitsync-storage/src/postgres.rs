//! Postgres-backed record store.
//!
//! Expects two tables, created by [`PgRecordStore::migrate`]:
//!
//! ```sql
//! traits  (id uuid PRIMARY KEY, elastic_id text NOT NULL, name text NOT NULL,
//!          release_date text, is_legacy bool NOT NULL, is_replaced bool NOT NULL,
//!          payload jsonb NOT NULL, ingested_at timestamptz NOT NULL DEFAULT now())
//! sources (url text PRIMARY KEY, last_scraped_at timestamptz NOT NULL)
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row};
use traitsync_core::{Payload, ReconciledRecord, SourceRecord, StoredRecord};
use uuid::Uuid;

use crate::store::{DeletePredicate, OrderKey, RecordStore, StoreError, TraitFilter, TraitOrder};

const TRAIT_COLUMNS: &str =
    "id, elastic_id, name, release_date, is_legacy, is_replaced, payload, ingested_at";

#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies the workspace `migrations/` directory.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn push_filter(builder: &mut QueryBuilder<'_, Postgres>, filter: &TraitFilter) {
    builder.push(" WHERE TRUE");
    if let Some(search) = filter.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        let pattern = format!("%{search}%");
        builder
            .push(" AND (name ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR payload->>'description' ILIKE ")
            .push_bind(pattern)
            .push(")");
    }
    if let Some(legacy) = filter.legacy {
        builder.push(" AND is_legacy = ").push_bind(legacy);
    }
    if !filter.include_superseded {
        builder.push(" AND NOT is_replaced");
    }
}

fn order_clause(order: TraitOrder) -> String {
    let column = match order.key {
        OrderKey::Name => "name",
        OrderKey::PublicationDate => "COALESCE(release_date, '')",
        OrderKey::IngestedAt => "ingested_at",
    };
    let direction = if order.descending { "DESC" } else { "ASC" };
    format!(" ORDER BY {column} {direction}, id ASC")
}

fn stored_from_row(row: &PgRow) -> Result<StoredRecord, StoreError> {
    let payload: Json<Payload> = row.try_get("payload")?;
    Ok(StoredRecord {
        id: row.try_get("id")?,
        ingested_at: row.try_get("ingested_at")?,
        record: ReconciledRecord {
            source_id: row.try_get("elastic_id")?,
            name: row.try_get("name")?,
            publication_date: row.try_get("release_date")?,
            legacy: row.try_get("is_legacy")?,
            superseded: row.try_get("is_replaced")?,
            payload: payload.0,
        },
    })
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn now(&self) -> Result<DateTime<Utc>, StoreError> {
        let now = sqlx::query_scalar::<_, DateTime<Utc>>("SELECT now()")
            .fetch_one(&self.pool)
            .await?;
        Ok(now)
    }

    async fn insert(&self, record: &ReconciledRecord) -> Result<StoredRecord, StoreError> {
        let id = Uuid::new_v4();
        let row = sqlx::query(
            r#"
            INSERT INTO traits (id, elastic_id, name, release_date, is_legacy, is_replaced, payload)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING ingested_at
            "#,
        )
        .bind(id)
        .bind(&record.source_id)
        .bind(&record.name)
        .bind(&record.publication_date)
        .bind(record.legacy)
        .bind(record.superseded)
        .bind(Json(&record.payload))
        .fetch_one(&self.pool)
        .await?;

        Ok(StoredRecord {
            id,
            ingested_at: row.try_get("ingested_at")?,
            record: record.clone(),
        })
    }

    async fn query(
        &self,
        filter: &TraitFilter,
        order: TraitOrder,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<StoredRecord>, usize), StoreError> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM traits");
        push_filter(&mut count, filter);
        let total = count
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await?;

        let mut select = QueryBuilder::<Postgres>::new(format!("SELECT {TRAIT_COLUMNS} FROM traits"));
        push_filter(&mut select, filter);
        select.push(order_clause(order));
        select
            .push(" OFFSET ")
            .push_bind(i64::try_from(offset).unwrap_or(i64::MAX))
            .push(" LIMIT ")
            .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        let rows = select.build().fetch_all(&self.pool).await?;

        let records = rows.iter().map(stored_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok((records, total.max(0) as usize))
    }

    async fn delete_where(&self, predicate: DeletePredicate) -> Result<u64, StoreError> {
        let result = match predicate {
            DeletePredicate::IngestedBefore(cutoff) => {
                sqlx::query("DELETE FROM traits WHERE ingested_at < $1")
                    .bind(cutoff)
                    .execute(&self.pool)
                    .await?
            }
        };
        Ok(result.rows_affected())
    }

    async fn upsert_source(&self, source: &SourceRecord) -> Result<SourceRecord, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO sources (url, last_scraped_at)
            VALUES ($1, $2)
            ON CONFLICT (url) DO UPDATE SET last_scraped_at = EXCLUDED.last_scraped_at
            RETURNING url, last_scraped_at
            "#,
        )
        .bind(&source.url)
        .bind(source.last_scraped_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(SourceRecord {
            url: row.try_get("url")?,
            last_scraped_at: row.try_get("last_scraped_at")?,
        })
    }

    async fn sources(&self) -> Result<Vec<SourceRecord>, StoreError> {
        let rows = sqlx::query("SELECT url, last_scraped_at FROM sources ORDER BY url")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<SourceRecord, StoreError> {
                Ok(SourceRecord {
                    url: row.try_get("url")?,
                    last_scraped_at: row.try_get("last_scraped_at")?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_clause_is_stable_and_null_safe() {
        assert_eq!(
            order_clause(TraitOrder::by(OrderKey::PublicationDate).desc()),
            " ORDER BY COALESCE(release_date, '') DESC, id ASC"
        );
        assert_eq!(order_clause(TraitOrder::default()), " ORDER BY name ASC, id ASC");
    }

    #[test]
    fn filter_binds_search_and_flags() {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM traits");
        push_filter(
            &mut builder,
            &TraitFilter {
                search: Some("fire".into()),
                legacy: Some(true),
                include_superseded: false,
            },
        );
        assert_eq!(
            builder.sql(),
            "SELECT COUNT(*) FROM traits WHERE TRUE AND (name ILIKE $1 OR payload->>'description' ILIKE $2) AND is_legacy = $3 AND NOT is_replaced"
        );
    }
}
