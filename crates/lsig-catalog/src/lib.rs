//! Durable entity catalog: one SQLite row per observed identifier, carrying a
//! content fingerprint, lifecycle timestamps, and an active flag.
//!
//! The store owns all persisted state. Rows are never deleted; disappearance
//! is modeled as `is_active = 0`, so a reappearing identifier updates its
//! existing row instead of creating a duplicate.

use std::collections::HashSet;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use lsig_core::{CatalogRecord, Entity, UNKNOWN_TAG};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqliteExecutor, SqlitePool, Transaction};
use thiserror::Error;

pub const CRATE_NAME: &str = "lsig-catalog";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog query failed: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("malformed {column} timestamp in catalog row: {value}")]
    Timestamp {
        column: &'static str,
        value: String,
    },
}

const CREATE_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS catalog (
    url         TEXT NOT NULL UNIQUE,
    fingerprint TEXT NOT NULL,
    name        TEXT,
    description TEXT,
    source      TEXT NOT NULL,
    project     TEXT,
    type        TEXT,
    resource    TEXT,
    first_seen  TEXT NOT NULL,
    last_seen   TEXT NOT NULL,
    is_active   INTEGER NOT NULL DEFAULT 1
)
"#;

const CREATE_SOURCE_INDEX_SQL: &str = r#"
CREATE INDEX IF NOT EXISTS idx_catalog_source_active ON catalog (source, is_active)
"#;

const SELECT_COLUMNS: &str = r#"
SELECT url, fingerprint, name, description, source, project, type, resource,
       first_seen, last_seen, is_active
  FROM catalog
"#;

/// Create-or-refresh as one atomic statement. `first_seen` and the
/// creation-time classification tags survive conflicts; display fields,
/// fingerprint, and `last_seen` always mirror the latest observation.
const UPSERT_SEEN_SQL: &str = r#"
INSERT INTO catalog (
    url, fingerprint, name, description, source, project, type, resource,
    first_seen, last_seen, is_active
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9, 1)
ON CONFLICT(url) DO UPDATE SET
    fingerprint = excluded.fingerprint,
    name        = excluded.name,
    description = excluded.description,
    resource    = excluded.resource,
    last_seen   = excluded.last_seen,
    is_active   = 1
"#;

/// Pooled handle to the catalog database. Cheap to clone; lifecycle is
/// open once, use across N reconciliation runs, close on shutdown.
#[derive(Debug, Clone)]
pub struct CatalogStore {
    pool: SqlitePool,
}

/// Aggregate row counts for the dashboard index page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogCounts {
    pub total: i64,
    pub active: i64,
}

impl CatalogStore {
    pub async fn connect(database_url: &str) -> Result<Self, CatalogError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Ok(Self { pool })
    }

    /// In-memory store for tests and dry runs. Pinned to a single pooled
    /// connection because every SQLite `:memory:` connection is its own
    /// database.
    pub async fn connect_in_memory() -> Result<Self, CatalogError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Idempotently ensures the backing table and indexes exist. Safe to call
    /// on every process start.
    pub async fn initialize(&self) -> Result<(), CatalogError> {
        sqlx::query(CREATE_TABLE_SQL).execute(&self.pool).await?;
        sqlx::query(CREATE_SOURCE_INDEX_SQL)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn get_by_url(&self, url: &str) -> Result<Option<CatalogRecord>, CatalogError> {
        fetch_record(&self.pool, url).await
    }

    pub async fn upsert_seen(
        &self,
        entity: &Entity,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<(), CatalogError> {
        exec_upsert_seen(&self.pool, entity, fingerprint, now).await
    }

    pub async fn mark_inactive(&self, url: &str) -> Result<(), CatalogError> {
        exec_mark_inactive(&self.pool, url).await
    }

    pub async fn list_active_urls(&self, source: &str) -> Result<HashSet<String>, CatalogError> {
        fetch_active_urls(&self.pool, source).await
    }

    /// Most recently seen records first, for the dashboard.
    pub async fn list_recent(&self, limit: i64) -> Result<Vec<CatalogRecord>, CatalogError> {
        let sql = format!("{SELECT_COLUMNS} ORDER BY last_seen DESC, url ASC LIMIT ?1");
        let rows = sqlx::query(&sql).bind(limit).fetch_all(&self.pool).await?;
        rows.into_iter().map(record_from_row).collect()
    }

    pub async fn counts(&self) -> Result<CatalogCounts, CatalogError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total, COALESCE(SUM(is_active), 0) AS active FROM catalog",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(CatalogCounts {
            total: row.try_get("total")?,
            active: row.try_get("active")?,
        })
    }

    /// Opens a transaction scoping one reconciliation run: acquire, mutate,
    /// commit or roll back on drop.
    pub async fn begin(&self) -> Result<CatalogTxn, CatalogError> {
        Ok(CatalogTxn {
            tx: self.pool.begin().await?,
        })
    }
}

/// The catalog operations of one reconciliation run, bound to a single
/// transaction. Dropping without [`CatalogTxn::commit`] rolls back.
pub struct CatalogTxn {
    tx: Transaction<'static, Sqlite>,
}

impl CatalogTxn {
    pub async fn get_by_url(&mut self, url: &str) -> Result<Option<CatalogRecord>, CatalogError> {
        fetch_record(&mut *self.tx, url).await
    }

    pub async fn upsert_seen(
        &mut self,
        entity: &Entity,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<(), CatalogError> {
        exec_upsert_seen(&mut *self.tx, entity, fingerprint, now).await
    }

    pub async fn mark_inactive(&mut self, url: &str) -> Result<(), CatalogError> {
        exec_mark_inactive(&mut *self.tx, url).await
    }

    pub async fn list_active_urls(
        &mut self,
        source: &str,
    ) -> Result<HashSet<String>, CatalogError> {
        fetch_active_urls(&mut *self.tx, source).await
    }

    pub async fn commit(self) -> Result<(), CatalogError> {
        self.tx.commit().await?;
        Ok(())
    }
}

async fn fetch_record<'e>(
    executor: impl SqliteExecutor<'e>,
    url: &str,
) -> Result<Option<CatalogRecord>, CatalogError> {
    let sql = format!("{SELECT_COLUMNS} WHERE url = ?1");
    let row = sqlx::query(&sql).bind(url).fetch_optional(executor).await?;
    row.map(record_from_row).transpose()
}

async fn exec_upsert_seen<'e>(
    executor: impl SqliteExecutor<'e>,
    entity: &Entity,
    fingerprint: &str,
    now: DateTime<Utc>,
) -> Result<(), CatalogError> {
    sqlx::query(UPSERT_SEEN_SQL)
        .bind(&entity.url)
        .bind(fingerprint)
        .bind(&entity.name)
        .bind(&entity.description)
        .bind(&entity.source)
        .bind(entity.project.as_deref().unwrap_or(UNKNOWN_TAG))
        .bind(entity.kind.as_deref().unwrap_or(UNKNOWN_TAG))
        .bind(entity.resource.as_deref())
        .bind(now.to_rfc3339())
        .execute(executor)
        .await?;
    Ok(())
}

async fn exec_mark_inactive<'e>(
    executor: impl SqliteExecutor<'e>,
    url: &str,
) -> Result<(), CatalogError> {
    sqlx::query("UPDATE catalog SET is_active = 0 WHERE url = ?1")
        .bind(url)
        .execute(executor)
        .await?;
    Ok(())
}

async fn fetch_active_urls<'e>(
    executor: impl SqliteExecutor<'e>,
    source: &str,
) -> Result<HashSet<String>, CatalogError> {
    let rows = sqlx::query("SELECT url FROM catalog WHERE source = ?1 AND is_active = 1")
        .bind(source)
        .fetch_all(executor)
        .await?;
    let mut urls = HashSet::with_capacity(rows.len());
    for row in rows {
        urls.insert(row.try_get::<String, _>("url")?);
    }
    Ok(urls)
}

fn record_from_row(row: SqliteRow) -> Result<CatalogRecord, CatalogError> {
    Ok(CatalogRecord {
        url: row.try_get("url")?,
        fingerprint: row.try_get("fingerprint")?,
        name: row
            .try_get::<Option<String>, _>("name")?
            .unwrap_or_default(),
        description: row
            .try_get::<Option<String>, _>("description")?
            .unwrap_or_default(),
        source: row.try_get("source")?,
        project: row
            .try_get::<Option<String>, _>("project")?
            .unwrap_or_else(|| UNKNOWN_TAG.to_string()),
        kind: row
            .try_get::<Option<String>, _>("type")?
            .unwrap_or_else(|| UNKNOWN_TAG.to_string()),
        resource: row.try_get("resource")?,
        first_seen: parse_timestamp("first_seen", row.try_get("first_seen")?)?,
        last_seen: parse_timestamp("last_seen", row.try_get("last_seen")?)?,
        is_active: row.try_get("is_active")?,
    })
}

fn parse_timestamp(column: &'static str, value: String) -> Result<DateTime<Utc>, CatalogError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| CatalogError::Timestamp { column, value })
}
