//! SQLite-backed index rows

use super::store::{IndexEntity, IndexStore};
use artcache_core::{CacheKey, Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

// `modified` holds Unix nanoseconds
const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS index_entities (
    key      TEXT PRIMARY KEY NOT NULL,
    modified INTEGER NOT NULL,
    size     INTEGER NOT NULL,
    version  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_index_entities_modified ON index_entities (modified, key);
";

type Row = (String, i64, i64, i64);

/// [`IndexStore`] persisted in a SQLite database
#[derive(Debug, Clone)]
pub struct SqliteIndexStore {
    pool: Pool<Sqlite>,
}

impl SqliteIndexStore {
    /// Open or create the database at `path`
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io(e, parent, "create index database directory"))?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))
            .map_err(|e| Error::backend("open index database", e))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));
        Self::connect(opts).await
    }

    /// Private in-memory database
    pub async fn in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| Error::backend("open index database", e))?;
        Self::connect(opts).await
    }

    async fn connect(opts: SqliteConnectOptions) -> Result<Self> {
        // One connection keeps writers serialized and an in-memory database alive
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .map_err(|e| Error::backend("connect index database", e))?;

        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&pool)
            .await
            .map_err(|e| Error::backend("migrate index database", e))?;
        debug!("Index database ready");
        Ok(Self { pool })
    }

    /// The underlying connection pool
    pub const fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

fn to_db(value: u64, field: &str) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| Error::backend_message("encode index row", format!("{field} out of range")))
}

fn from_db(value: i64, field: &str) -> Result<u64> {
    u64::try_from(value)
        .map_err(|_| Error::backend_message("decode index row", format!("negative {field}")))
}

fn encode_time(modified: DateTime<Utc>) -> Result<i64> {
    modified.timestamp_nanos_opt().ok_or_else(|| {
        Error::backend_message("encode index row", format!("timestamp {modified} out of range"))
    })
}

fn decode((key, modified, size, version): Row) -> Result<IndexEntity> {
    let key = key.parse::<CacheKey>()?;
    Ok(IndexEntity {
        key,
        modified: DateTime::from_timestamp_nanos(modified),
        size: from_db(size, "size")?,
        version: from_db(version, "version")?,
    })
}

#[async_trait]
impl IndexStore for SqliteIndexStore {
    async fn find(&self, key: &CacheKey) -> Result<Option<IndexEntity>> {
        let row: Option<Row> = sqlx::query_as(
            "SELECT key, modified, size, version FROM index_entities WHERE key = ?",
        )
        .bind(key.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::backend("find index row", e))?;
        row.map(decode).transpose()
    }

    async fn insert(&self, entity: &IndexEntity) -> Result<IndexEntity> {
        let result = sqlx::query(
            "INSERT INTO index_entities (key, modified, size, version) VALUES (?, ?, ?, 1) \
             ON CONFLICT(key) DO NOTHING",
        )
        .bind(entity.key.to_string())
        .bind(encode_time(entity.modified)?)
        .bind(to_db(entity.size, "size")?)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::backend("insert index row", e))?;

        if result.rows_affected() == 0 {
            return Err(Error::conflict(entity.key.to_string(), 1));
        }
        Ok(IndexEntity {
            version: 1,
            ..*entity
        })
    }

    async fn update(&self, entity: &IndexEntity) -> Result<IndexEntity> {
        let result = sqlx::query(
            "UPDATE index_entities SET modified = ?, size = ?, version = version + 1 \
             WHERE key = ? AND version = ?",
        )
        .bind(encode_time(entity.modified)?)
        .bind(to_db(entity.size, "size")?)
        .bind(entity.key.to_string())
        .bind(to_db(entity.version, "version")?)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::backend("update index row", e))?;

        if result.rows_affected() == 0 {
            return Err(Error::conflict(entity.key.to_string(), 1));
        }
        Ok(IndexEntity {
            version: entity.version + 1,
            ..*entity
        })
    }

    async fn delete(&self, key: &CacheKey, version: Option<u64>) -> Result<bool> {
        let result = match version {
            Some(version) => {
                sqlx::query("DELETE FROM index_entities WHERE key = ? AND version = ?")
                    .bind(key.to_string())
                    .bind(to_db(version, "version")?)
                    .execute(&self.pool)
                    .await
            }
            None => {
                sqlx::query("DELETE FROM index_entities WHERE key = ?")
                    .bind(key.to_string())
                    .execute(&self.pool)
                    .await
            }
        }
        .map_err(|e| Error::backend("delete index row", e))?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        // Distinguish a missing row from a version mismatch
        match (version, self.find(key).await?) {
            (Some(_), Some(_)) => Err(Error::conflict(key.to_string(), 1)),
            _ => Ok(false),
        }
    }

    async fn count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM index_entities")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::backend("count index rows", e))?;
        from_db(count, "count")
    }

    async fn total_size(&self) -> Result<u64> {
        let total: i64 = sqlx::query_scalar("SELECT COALESCE(SUM(size), 0) FROM index_entities")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::backend("sum index sizes", e))?;
        from_db(total, "total size")
    }

    async fn oldest(&self, limit: usize) -> Result<Vec<IndexEntity>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<Row> = sqlx::query_as(
            "SELECT key, modified, size, version FROM index_entities \
             ORDER BY modified ASC, key ASC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::backend("read oldest index rows", e))?;
        rows.into_iter().map(decode).collect()
    }

    async fn keys(&self) -> Result<Vec<CacheKey>> {
        let keys: Vec<String> = sqlx::query_scalar("SELECT key FROM index_entities")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::backend("list index keys", e))?;
        keys.iter().map(|key| key.parse::<CacheKey>()).collect()
    }
}
