//! Durable storage for collected items and per-source watermarks.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ifc_core::{CollectedItem, SourceKind};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use thiserror::Error;
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ifc-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("preparing database location {path}: {source}")]
    Location {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt row for {platform_id}: {reason}")]
    Corrupt { platform_id: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertOutcome {
    Stored,
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Watermark {
    pub source_kind: SourceKind,
    pub scope: String,
    pub posted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Range query over stored items. Bounds are half-open: `start <= posted_at < end`.
#[derive(Debug, Clone, Default)]
pub struct ItemQuery {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub source_kind: Option<SourceKind>,
    pub limit: Option<u32>,
}

impl ItemQuery {
    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
            ..Default::default()
        }
    }

    pub fn with_source(mut self, source_kind: SourceKind) -> Self {
        self.source_kind = Some(source_kind);
        self
    }
}

#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Insert the item unless a row with its `platform_id` exists. Atomic across callers.
    async fn upsert_if_absent(&self, item: &CollectedItem) -> Result<InsertOutcome, StorageError>;

    async fn contains(&self, platform_id: &str) -> Result<bool, StorageError>;

    async fn get_watermark(
        &self,
        source_kind: SourceKind,
        scope: &str,
    ) -> Result<Option<DateTime<Utc>>, StorageError>;

    /// Move the watermark forward. Returns false when `posted_at` is not newer than the current value.
    async fn advance_watermark(
        &self,
        source_kind: SourceKind,
        scope: &str,
        posted_at: DateTime<Utc>,
    ) -> Result<bool, StorageError>;

    async fn watermarks(&self) -> Result<Vec<Watermark>, StorageError>;

    /// Items ordered by `posted_at` ascending (ties broken by `platform_id`).
    async fn query(&self, query: &ItemQuery) -> Result<Vec<CollectedItem>, StorageError>;
}

#[derive(Debug, Clone)]
pub struct SqliteItemStore {
    pool: SqlitePool,
}

impl SqliteItemStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a file-backed database (`sqlite://path/to/file.db`), creating it if missing.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));

        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() && parent != Path::new(":memory:") {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|source| StorageError::Location {
                        path: parent.display().to_string(),
                        source,
                    })?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Connect and apply pending migrations.
    pub async fn open(database_url: &str) -> Result<Self, StorageError> {
        let store = Self::connect(database_url).await?;
        store.migrate().await?;
        Ok(store)
    }

    /// Single-connection in-memory database with the schema applied.
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl ItemStore for SqliteItemStore {
    async fn upsert_if_absent(&self, item: &CollectedItem) -> Result<InsertOutcome, StorageError> {
        let result = sqlx::query(
            r#"
            INSERT INTO collected_items
                (platform_id, source_kind, source_detail, parent_id, author_handle,
                 author_display_name, body_text, posted_at_ms, captured_at_ms, fetch_run_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (platform_id) DO NOTHING
            "#,
        )
        .bind(&item.platform_id)
        .bind(item.source_kind.as_str())
        .bind(&item.source_detail)
        .bind(item.parent_id.as_deref())
        .bind(&item.author_handle)
        .bind(&item.author_display_name)
        .bind(&item.body_text)
        .bind(item.posted_at.timestamp_millis())
        .bind(item.captured_at.timestamp_millis())
        .bind(item.fetch_run_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            Ok(InsertOutcome::Stored)
        } else {
            debug!(platform_id = %item.platform_id, "item already stored");
            Ok(InsertOutcome::Duplicate)
        }
    }

    async fn contains(&self, platform_id: &str) -> Result<bool, StorageError> {
        let row = sqlx::query("SELECT 1 FROM collected_items WHERE platform_id = ?")
            .bind(platform_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn get_watermark(
        &self,
        source_kind: SourceKind,
        scope: &str,
    ) -> Result<Option<DateTime<Utc>>, StorageError> {
        let value: Option<i64> = sqlx::query_scalar(
            "SELECT posted_at_ms FROM watermarks WHERE source_kind = ? AND scope = ?",
        )
        .bind(source_kind.as_str())
        .bind(scope)
        .fetch_optional(&self.pool)
        .await?;

        value
            .map(|ms| millis_to_datetime(ms, scope))
            .transpose()
    }

    async fn advance_watermark(
        &self,
        source_kind: SourceKind,
        scope: &str,
        posted_at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            INSERT INTO watermarks (source_kind, scope, posted_at_ms, updated_at_ms)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (source_kind, scope) DO UPDATE
               SET posted_at_ms = excluded.posted_at_ms,
                   updated_at_ms = excluded.updated_at_ms
             WHERE excluded.posted_at_ms > watermarks.posted_at_ms
            "#,
        )
        .bind(source_kind.as_str())
        .bind(scope)
        .bind(posted_at.timestamp_millis())
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn watermarks(&self) -> Result<Vec<Watermark>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT source_kind, scope, posted_at_ms, updated_at_ms
              FROM watermarks
             ORDER BY source_kind, scope
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let scope: String = row.try_get("scope")?;
            let kind: String = row.try_get("source_kind")?;
            let source_kind = SourceKind::from_str(&kind).map_err(|e| StorageError::Corrupt {
                platform_id: scope.clone(),
                reason: e.to_string(),
            })?;
            out.push(Watermark {
                source_kind,
                posted_at: millis_to_datetime(row.try_get("posted_at_ms")?, &scope)?,
                updated_at: millis_to_datetime(row.try_get("updated_at_ms")?, &scope)?,
                scope,
            });
        }
        Ok(out)
    }

    async fn query(&self, query: &ItemQuery) -> Result<Vec<CollectedItem>, StorageError> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            r#"
            SELECT platform_id, source_kind, source_detail, parent_id, author_handle,
                   author_display_name, body_text, posted_at_ms, captured_at_ms, fetch_run_id
              FROM collected_items
             WHERE 1 = 1
            "#,
        );
        if let Some(start) = query.start {
            builder.push(" AND posted_at_ms >= ").push_bind(start.timestamp_millis());
        }
        if let Some(end) = query.end {
            builder.push(" AND posted_at_ms < ").push_bind(end.timestamp_millis());
        }
        if let Some(kind) = query.source_kind {
            builder.push(" AND source_kind = ").push_bind(kind.as_str());
        }
        builder.push(" ORDER BY posted_at_ms ASC, platform_id ASC");
        if let Some(limit) = query.limit {
            builder.push(" LIMIT ").push_bind(i64::from(limit));
        }

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_item).collect()
    }
}

fn row_to_item(row: &SqliteRow) -> Result<CollectedItem, StorageError> {
    let platform_id: String = row.try_get("platform_id")?;
    let corrupt = |reason: String| StorageError::Corrupt {
        platform_id: platform_id.clone(),
        reason,
    };

    let kind: String = row.try_get("source_kind")?;
    let source_kind = SourceKind::from_str(&kind).map_err(|e| corrupt(e.to_string()))?;
    let run_id: String = row.try_get("fetch_run_id")?;
    let fetch_run_id = Uuid::parse_str(&run_id).map_err(|e| corrupt(format!("fetch_run_id: {e}")))?;

    Ok(CollectedItem {
        source_kind,
        source_detail: row.try_get("source_detail")?,
        parent_id: row.try_get("parent_id")?,
        author_handle: row.try_get("author_handle")?,
        author_display_name: row.try_get("author_display_name")?,
        body_text: row.try_get("body_text")?,
        posted_at: millis_to_datetime(row.try_get("posted_at_ms")?, &platform_id)?,
        captured_at: millis_to_datetime(row.try_get("captured_at_ms")?, &platform_id)?,
        fetch_run_id,
        platform_id,
    })
}

fn millis_to_datetime(ms: i64, key: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::<Utc>::from_timestamp_millis(ms).ok_or_else(|| StorageError::Corrupt {
        platform_id: key.to_string(),
        reason: format!("timestamp out of range: {ms}"),
    })
}
