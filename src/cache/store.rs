//! SQLite claim cache
//!
//! One table, one row per token, keyed by the decimal token id. Every write
//! is a single `INSERT .. ON CONFLICT DO UPDATE`, so a row is either absent
//! or carries all of its fields from the same fetch.
//!
//! rusqlite is synchronous: the connection sits behind a mutex and each
//! operation runs on the blocking pool, which also serializes writers.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use eyre::{eyre, Result, WrapErr};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use super::models::{CacheStats, ClaimRecord, ScannedRecord};

// ============================================
// CONSTANTS
// ============================================

/// SQLite's default host-parameter ceiling
pub const MAX_LOOKUP_CHUNK: usize = 999;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS claim_data (
    token_id TEXT PRIMARY KEY,
    allocation_per_token TEXT,
    consumed TEXT,
    claimed TEXT,
    part_percentage TEXT,
    init_unlock TEXT,
    updated_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_claim_data_updated_at ON claim_data(updated_at);
";

const SELECT_COLUMNS: &str =
    "token_id, allocation_per_token, consumed, claimed, part_percentage, init_unlock, updated_at";

/// Rows written by other tooling may be partial; lookups only see whole records
const COMPLETE_ROW: &str = "allocation_per_token IS NOT NULL AND consumed IS NOT NULL
    AND claimed IS NOT NULL AND part_percentage IS NOT NULL
    AND init_unlock IS NOT NULL AND updated_at IS NOT NULL";

/// Keys made only of digits; `CAST` would read anything else as 0
const NUMERIC_KEY: &str = "token_id <> '' AND token_id NOT GLOB '*[^0-9]*'";

// ============================================
// CLAIM CACHE
// ============================================

/// Durable token-id → claim record store
#[derive(Clone)]
pub struct ClaimCache {
    conn: Arc<Mutex<Connection>>,
    chunk_size: usize,
}

impl ClaimCache {
    /// Open (or create) the cache file at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).wrap_err_with(|| {
                    format!("Failed to create cache directory {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .wrap_err_with(|| format!("Failed to open cache db {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .wrap_err("Failed to set sqlite busy_timeout")?;
        let journal_mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .wrap_err("Failed to set sqlite journal mode WAL")?;
        debug!("sqlite journal_mode = {}", journal_mode);
        conn.pragma_update(None, "synchronous", "NORMAL")
            .wrap_err("Failed to set sqlite synchronous NORMAL")?;

        info!("💾 Claim cache opened at {}", path.display());
        Self::with_connection(conn)
    }

    /// Non-durable cache, mainly for tests and dry runs
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().wrap_err("Failed to open in-memory cache")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .wrap_err("Failed to create claim_data table")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            chunk_size: MAX_LOOKUP_CHUNK,
        })
    }

    /// Override the batch-lookup chunk size (clamped to `1..=999`)
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.clamp(1, MAX_LOOKUP_CHUNK);
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Run raw SQL against the cache, for tests that need a damaged table
    #[cfg(test)]
    pub(crate) async fn execute_raw(&self, sql: &'static str) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute_batch(sql)?;
            Ok(())
        })
        .await
    }

    /// Run `op` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| eyre!("Claim cache connection mutex poisoned"))?;
            op(&mut *guard)
        })
        .await
        .wrap_err("Claim cache task panicked")?
    }

    /// Insert or fully overwrite the record for `token_id`
    pub async fn put(&self, token_id: u64, record: &ClaimRecord) -> Result<()> {
        let record = record.clone();
        let key = token_id.to_string();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO claim_data (
                    token_id, allocation_per_token, consumed, claimed,
                    part_percentage, init_unlock, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(token_id) DO UPDATE SET
                    allocation_per_token = excluded.allocation_per_token,
                    consumed = excluded.consumed,
                    claimed = excluded.claimed,
                    part_percentage = excluded.part_percentage,
                    init_unlock = excluded.init_unlock,
                    updated_at = excluded.updated_at",
                params![
                    key,
                    record.allocation_per_token,
                    record.consumed,
                    record.claimed,
                    record.part_percentage,
                    record.init_unlock,
                    record.updated_at,
                ],
            )
            .wrap_err_with(|| format!("Failed to upsert claim record {}", key))?;
            Ok(())
        })
        .await
    }

    /// Look up one record; a partially written row reads as absent
    pub async fn get(&self, token_id: u64) -> Result<Option<ClaimRecord>> {
        let key = token_id.to_string();

        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM claim_data WHERE token_id = ?1 AND {}",
                SELECT_COLUMNS, COMPLETE_ROW
            );
            let row = conn
                .query_row(&sql, params![key], scanned_from_row)
                .optional()
                .wrap_err_with(|| format!("Failed to read claim record {}", key))?;
            Ok(row.map(ScannedRecord::into_record))
        })
        .await
    }

    /// Look up many records at once.
    ///
    /// Only present, complete records are returned, in no particular order. Duplicate
    /// ids are collapsed before querying and the `IN (..)` list is split
    /// into chunks of at most `chunk_size` parameters.
    pub async fn get_batch(&self, token_ids: &[u64]) -> Result<Vec<ClaimRecord>> {
        let unique: Vec<String> = token_ids
            .iter()
            .copied()
            .collect::<BTreeSet<u64>>()
            .into_iter()
            .map(|id| id.to_string())
            .collect();

        if unique.is_empty() {
            return Ok(Vec::new());
        }

        let chunk_size = self.chunk_size;
        self.with_conn(move |conn| {
            let mut records = Vec::with_capacity(unique.len());
            for chunk in unique.chunks(chunk_size) {
                let placeholders = vec!["?"; chunk.len()].join(", ");
                let sql = format!(
                    "SELECT {} FROM claim_data WHERE token_id IN ({}) AND {}",
                    SELECT_COLUMNS, placeholders, COMPLETE_ROW
                );
                let mut stmt = conn
                    .prepare_cached(&sql)
                    .wrap_err("Failed to prepare batch lookup")?;
                let rows = stmt
                    .query_map(params_from_iter(chunk.iter()), scanned_from_row)
                    .wrap_err("Failed to run batch lookup")?;
                for row in rows {
                    records.push(row.wrap_err("Failed to read batch row")?.into_record());
                }
            }
            debug!("Batch lookup: {} unique ids, {} hits", unique.len(), records.len());
            Ok(records)
        })
        .await
    }

    /// Every row in the cache, columns read as nullable
    pub async fn scan_all(&self) -> Result<Vec<ScannedRecord>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM claim_data ORDER BY CAST(token_id AS INTEGER), token_id",
                SELECT_COLUMNS
            );
            let mut stmt = conn.prepare(&sql).wrap_err("Failed to prepare cache scan")?;
            let rows = stmt
                .query_map([], scanned_from_row)
                .wrap_err("Failed to scan claim_data")?;

            let mut out = Vec::new();
            for row in rows {
                out.push(row.wrap_err("Failed to read scanned row")?);
            }
            Ok(out)
        })
        .await
    }

    /// Count, numeric min/max token id and latest write time
    pub async fn stats(&self) -> Result<CacheStats> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT COUNT(*),
                        MIN(CASE WHEN {key} THEN CAST(token_id AS INTEGER) END),
                        MAX(CASE WHEN {key} THEN CAST(token_id AS INTEGER) END),
                        MAX(updated_at)
                 FROM claim_data",
                key = NUMERIC_KEY
            );
            let stats = conn
                .query_row(
                    &sql,
                    [],
                    |row| {
                        Ok(CacheStats {
                            total_count: row.get::<_, i64>(0)?.max(0) as u64,
                            min_token_id: row.get::<_, Option<i64>>(1)?.map(|v| v.max(0) as u64),
                            max_token_id: row.get::<_, Option<i64>>(2)?.map(|v| v.max(0) as u64),
                            last_updated: row.get(3)?,
                        })
                    },
                )
                .wrap_err("Failed to compute cache stats")?;
            Ok(stats)
        })
        .await
    }
}

fn scanned_from_row(row: &Row<'_>) -> rusqlite::Result<ScannedRecord> {
    Ok(ScannedRecord {
        token_id: row.get(0)?,
        allocation_per_token: row.get(1)?,
        consumed: row.get(2)?,
        claimed: row.get(3)?,
        part_percentage: row.get(4)?,
        init_unlock: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u64, allocation: &str, updated_at: i64) -> ClaimRecord {
        ClaimRecord {
            token_id: id.to_string(),
            allocation_per_token: allocation.to_string(),
            consumed: "0.00".to_string(),
            claimed: "0.00".to_string(),
            part_percentage: "0.3300".to_string(),
            init_unlock: "0.1000".to_string(),
            updated_at,
        }
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let cache = ClaimCache::open_in_memory().unwrap();
        assert!(cache.get(1).await.unwrap().is_none());

        cache.put(1, &record(1, "854.70", 10)).await.unwrap();

        let got = cache.get(1).await.unwrap().unwrap();
        assert_eq!(got, record(1, "854.70", 10));
    }

    #[tokio::test]
    async fn test_put_overwrites_whole_record() {
        let cache = ClaimCache::open_in_memory().unwrap();

        let first = ClaimRecord {
            consumed: "5.00".to_string(),
            claimed: "1.00".to_string(),
            ..record(9, "100.00", 1)
        };
        let second = ClaimRecord {
            part_percentage: "0.5000".to_string(),
            ..record(9, "200.00", 2)
        };

        cache.put(9, &first).await.unwrap();
        cache.put(9, &second).await.unwrap();

        let got = cache.get(9).await.unwrap().unwrap();
        assert_eq!(got, second);
        assert_eq!(cache.stats().await.unwrap().total_count, 1);
    }

    #[tokio::test]
    async fn test_get_batch_dedups_and_skips_absent() {
        for chunk in [1usize, 2, 3, 999] {
            let cache = ClaimCache::open_in_memory().unwrap().with_chunk_size(chunk);
            for id in [1u64, 2, 3, 5, 8] {
                cache.put(id, &record(id, "1.00", 0)).await.unwrap();
            }

            let ids = [1u64, 1, 2, 4, 5, 5, 5, 6, 8, 100, 2];
            let mut got: Vec<String> = cache
                .get_batch(&ids)
                .await
                .unwrap()
                .into_iter()
                .map(|r| r.token_id)
                .collect();
            got.sort_by_key(|id| id.parse::<u64>().unwrap());

            assert_eq!(got, vec!["1", "2", "5", "8"], "chunk size {}", chunk);
        }
    }

    #[tokio::test]
    async fn test_get_batch_above_chunk_limit() {
        let cache = ClaimCache::open_in_memory().unwrap();
        for id in (1..=2500u64).filter(|id| id % 2 == 0) {
            cache.put(id, &record(id, "1.00", 0)).await.unwrap();
        }

        let mut ids: Vec<u64> = (1..=2500).collect();
        ids.extend(1..=100);

        let got = cache.get_batch(&ids).await.unwrap();
        assert_eq!(got.len(), 1250);
    }

    #[test]
    fn test_chunk_size_is_clamped() {
        let cache = ClaimCache::open_in_memory().unwrap();
        assert_eq!(cache.chunk_size(), 999);
        assert_eq!(cache.clone().with_chunk_size(0).chunk_size(), 1);
        assert_eq!(cache.clone().with_chunk_size(5_000).chunk_size(), 999);
        assert_eq!(cache.with_chunk_size(250).chunk_size(), 250);
    }

    #[tokio::test]
    async fn test_get_batch_empty_input() {
        let cache = ClaimCache::open_in_memory().unwrap();
        assert!(cache.get_batch(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stats_numeric_ordering() {
        let cache = ClaimCache::open_in_memory().unwrap();
        assert_eq!(cache.stats().await.unwrap(), CacheStats::default());

        cache.put(9, &record(9, "1.00", 30)).await.unwrap();
        cache.put(10, &record(10, "1.00", 20)).await.unwrap();
        cache.put(100, &record(100, "1.00", 10)).await.unwrap();

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.total_count, 3);
        // "9" > "100" as text, but not as numbers
        assert_eq!(stats.min_token_id, Some(9));
        assert_eq!(stats.max_token_id, Some(100));
        assert_eq!(stats.last_updated, Some(30));
    }

    #[tokio::test]
    async fn test_scan_reads_nullable_columns() {
        let cache = ClaimCache::open_in_memory().unwrap();
        cache.put(1, &record(1, "1.00", 0)).await.unwrap();
        cache
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO claim_data (token_id, allocation_per_token) VALUES ('2', '3.00')",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let mut rows = cache.scan_all().await.unwrap();
        rows.sort_by(|a, b| a.token_id.cmp(&b.token_id));

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].consumed, None);
        assert_eq!(rows[1].allocation_per_token.as_deref(), Some("3.00"));
    }

    #[tokio::test]
    async fn test_partial_rows_read_as_absent() {
        let cache = ClaimCache::open_in_memory().unwrap();
        cache.put(1, &record(1, "1.00", 0)).await.unwrap();
        cache
            .execute_raw(
                "INSERT INTO claim_data (token_id) VALUES ('3');
                 INSERT INTO claim_data (token_id, allocation_per_token, consumed, claimed,
                     part_percentage, init_unlock)
                 VALUES ('4', '1.00', '0.00', '0.00', '0.3300', '0.1000');",
            )
            .await
            .unwrap();

        assert!(cache.get(3).await.unwrap().is_none());
        assert!(cache.get(4).await.unwrap().is_none());

        let got = cache.get_batch(&[1, 3, 4]).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].token_id, "1");

        // Still visible to the repair scan
        assert_eq!(cache.scan_all().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_stats_ignores_non_numeric_keys() {
        let cache = ClaimCache::open_in_memory().unwrap();
        cache.put(5, &record(5, "1.00", 1)).await.unwrap();
        cache.put(12, &record(12, "1.00", 2)).await.unwrap();
        cache
            .execute_raw(
                "INSERT INTO claim_data (token_id, updated_at) VALUES ('abc', 3);
                 INSERT INTO claim_data (token_id) VALUES ('7x');",
            )
            .await
            .unwrap();

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.total_count, 4);
        assert_eq!(stats.min_token_id, Some(5));
        assert_eq!(stats.max_token_id, Some(12));
        assert_eq!(stats.last_updated, Some(3));
    }

    #[tokio::test]
    async fn test_file_cache_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("claims.db");

        {
            let cache = ClaimCache::open(&path).unwrap();
            cache.put(42, &record(42, "854.70", 5)).await.unwrap();
        }

        let reopened = ClaimCache::open(&path).unwrap();
        let got = reopened.get(42).await.unwrap().unwrap();
        assert_eq!(got.allocation_per_token, "854.70");
    }
}
