//! libSQL-backed `ExtractionCache`.
//!
//! One row per `MessageKey` holding the `ExtractionResult` as JSON. Supports
//! local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::CacheError;
use crate::extract::ExtractionResult;
use crate::pipeline::types::MessageKey;
use crate::store::cache::{CacheEntry, ExtractionCache};
use crate::store::migrations;

/// libSQL extraction cache.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlCache {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlCache {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                CacheError::Connection(format!("Failed to create cache directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| CacheError::Connection(format!("Failed to open libSQL database: {e}")))?;

        let cache = Self::from_database(db).await?;
        info!(path = %path.display(), "Extraction cache opened");
        Ok(cache)
    }

    /// Create an in-memory cache (for tests and cache-less runs).
    pub async fn new_memory() -> Result<Self, CacheError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                CacheError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, CacheError> {
        let conn = db
            .connect()
            .map_err(|e| CacheError::Connection(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Full record for `key`, including strategy and timestamp.
    pub async fn get_entry(&self, key: &MessageKey) -> Result<Option<CacheEntry>, CacheError> {
        let mut rows = self
            .conn
            .query(
                "SELECT result, strategy, updated_at FROM extraction_cache WHERE message_key = ?1",
                params![key.as_str()],
            )
            .await
            .map_err(|e| CacheError::Query(format!("get_entry: {e}")))?;

        let Some(row) = rows
            .next()
            .await
            .map_err(|e| CacheError::Query(format!("get_entry: {e}")))?
        else {
            return Ok(None);
        };

        let result_json: String = row
            .get(0)
            .map_err(|e| CacheError::Query(format!("get_entry result: {e}")))?;
        let strategy: String = row
            .get(1)
            .map_err(|e| CacheError::Query(format!("get_entry strategy: {e}")))?;
        let updated_at: String = row
            .get(2)
            .map_err(|e| CacheError::Query(format!("get_entry updated_at: {e}")))?;

        Ok(Some(CacheEntry {
            key: key.clone(),
            result: serde_json::from_str(&result_json)?,
            strategy,
            updated_at: parse_datetime(&updated_at),
        }))
    }

    /// Number of cached records.
    pub async fn len(&self) -> Result<usize, CacheError> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM extraction_cache", ())
            .await
            .map_err(|e| CacheError::Query(format!("len: {e}")))?;
        let count: i64 = match rows
            .next()
            .await
            .map_err(|e| CacheError::Query(format!("len: {e}")))?
        {
            Some(row) => row.get(0).unwrap_or(0),
            None => 0,
        };
        Ok(usize::try_from(count).unwrap_or(0))
    }

    pub async fn is_empty(&self) -> Result<bool, CacheError> {
        Ok(self.len().await? == 0)
    }
}

#[async_trait]
impl ExtractionCache for LibSqlCache {
    async fn get(&self, key: &MessageKey) -> Result<Option<ExtractionResult>, CacheError> {
        Ok(self.get_entry(key).await?.map(|entry| entry.result))
    }

    async fn put(
        &self,
        key: &MessageKey,
        strategy: &str,
        result: &ExtractionResult,
    ) -> Result<(), CacheError> {
        let json = serde_json::to_string(result)?;
        let now = Utc::now().to_rfc3339();

        self.conn
            .execute(
                "INSERT INTO extraction_cache (message_key, result, strategy, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (message_key) DO UPDATE SET result = ?2, strategy = ?3, updated_at = ?4",
                params![key.as_str(), json, strategy, now],
            )
            .await
            .map_err(|e| CacheError::Query(format!("put: {e}")))?;

        debug!(key = %key, strategy, "Cached extraction result");
        Ok(())
    }
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}
