use std::{collections::HashSet, path::Path};

use indexmap::IndexMap;
use normalized_cache_api::{
    cascade_keys, diagnostics::report_storage_error, CacheHeaders, CacheKey, NormalizedCache, Record, RecordDump,
    RecordMerger, RecordValue, StorageError,
};
use sqlx::{
    query, query::QueryAs, query_as,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};

use crate::SqliteError;

const IDENTITY: &str = "SqliteCache";

/// SQLite limits the number of bound parameters of a statement.
const MAX_PARAMETERS: usize = 999;

const CREATE_RECORDS: &str =
    "CREATE TABLE IF NOT EXISTS records (key TEXT PRIMARY KEY NOT NULL, record TEXT NOT NULL, dates TEXT)";
const CREATE_METADATA: &str = "CREATE TABLE IF NOT EXISTS metadata (name TEXT PRIMARY KEY NOT NULL, value TEXT NOT NULL)";
const TRACK_DATES: &str = "track_dates";

type Row = (String, String, Option<String>);

/// Records persisted in a SQLite database.
///
/// Failures to read or write the database are reported through
/// [`normalized_cache_api::diagnostics`] and otherwise behave like missing data, so a broken
/// database degrades to a cache that always misses.
pub struct SqliteCache {
    pool: SqlitePool,
    track_dates: bool,
}

impl SqliteCache {
    /// Opens the database at `path`, creating it if needed. Fails if an existing database was
    /// created with another date tracking setting.
    pub async fn open(path: impl AsRef<Path>, track_dates: bool) -> Result<Self, SqliteError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Self::with_pool(pool, track_dates).await
    }

    /// A private database living as long as the cache.
    pub async fn in_memory(track_dates: bool) -> Result<Self, SqliteError> {
        // Every connection to `:memory:` opens a distinct database, keep a single one alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::with_pool(pool, track_dates).await
    }

    async fn with_pool(pool: SqlitePool, track_dates: bool) -> Result<Self, SqliteError> {
        query(CREATE_RECORDS).execute(&pool).await?;
        query(CREATE_METADATA).execute(&pool).await?;

        let stored = query_as::<_, (String,)>("SELECT value FROM metadata WHERE name = ?")
            .bind(TRACK_DATES)
            .fetch_optional(&pool)
            .await?;

        match stored {
            Some((value,)) if (value == "true") != track_dates => {
                return Err(SqliteError::DateTrackingMismatch {
                    database: value == "true",
                    requested: track_dates,
                });
            }
            Some(_) => (),
            None => {
                query("INSERT INTO metadata (name, value) VALUES (?, ?)")
                    .bind(TRACK_DATES)
                    .bind(track_dates.to_string())
                    .execute(&pool)
                    .await?;
            }
        }

        tracing::debug!("opened the SQLite cache, date tracking: {track_dates}");
        Ok(SqliteCache { pool, track_dates })
    }

    fn decode(&self, (key, fields, dates): Row) -> Result<Record, StorageError> {
        let mut record = Record::new(key);
        record.fields = serde_json::from_str::<IndexMap<String, RecordValue>>(&fields)?;
        if let (true, Some(dates)) = (self.track_dates, dates) {
            record.dates = serde_json::from_str(&dates)?;
        }
        Ok(record)
    }

    /// Decodes a row read in bulk. A row that does not decode is reported and skipped, leaving
    /// the other rows of its batch readable.
    fn decode_reported(&self, row: Row) -> Option<Record> {
        let key = row.0.clone();
        match self.decode(row) {
            Ok(record) => Some(record),
            Err(error) => {
                tracing::warn!("skipping the undecodable record {key}");
                report_storage_error(&error);
                None
            }
        }
    }

    fn encode(&self, record: &Record) -> Result<(String, Option<String>), StorageError> {
        let fields = serde_json::to_string(&record.fields)?;
        let dates = if self.track_dates {
            Some(serde_json::to_string(&record.dates)?)
        } else {
            None
        };
        Ok((fields, dates))
    }

    async fn try_load_records(&self, keys: &[CacheKey]) -> Result<Vec<Record>, StorageError> {
        let mut records = Vec::with_capacity(keys.len());

        for chunk in keys.chunks(MAX_PARAMETERS) {
            let sql = format!(
                "SELECT key, record, dates FROM records WHERE key IN ({})",
                placeholders(chunk.len())
            );
            let template = query_as::<_, Row>(&sql);

            let rows = chunk
                .iter()
                .map(CacheKey::as_str)
                .fold(template, QueryAs::bind)
                .fetch_all(&self.pool)
                .await
                .map_err(backend)?;

            records.extend(rows.into_iter().filter_map(|row| self.decode_reported(row)));
        }

        Ok(records)
    }

    async fn try_merge(
        &self,
        records: Vec<Record>,
        headers: &CacheHeaders,
        merger: &dyn RecordMerger,
    ) -> Result<HashSet<String>, StorageError> {
        let mut changed = HashSet::new();
        let mut transaction = self.pool.begin().await.map_err(backend)?;

        for record in records {
            let row = query_as::<_, Row>("SELECT key, record, dates FROM records WHERE key = ?")
                .bind(record.key.as_str())
                .fetch_optional(&mut *transaction)
                .await
                .map_err(backend)?;

            let exists = row.is_some();
            let mut stored = match row {
                Some(row) => self.decode(row)?,
                None => Record::new(record.key.clone()),
            };

            let (delta, record_changed) = merger.merge(&stored, &record, headers.received_date());
            if exists && delta.is_empty() {
                continue;
            }
            stored.apply(delta);
            changed.extend(record_changed);

            let (fields, dates) = self.encode(&stored)?;
            query(
                "INSERT INTO records (key, record, dates) VALUES (?, ?, ?) \
                 ON CONFLICT(key) DO UPDATE SET record = excluded.record, dates = excluded.dates",
            )
            .bind(stored.key.as_str())
            .bind(fields)
            .bind(dates)
            .execute(&mut *transaction)
            .await
            .map_err(backend)?;
        }

        transaction.commit().await.map_err(backend)?;
        Ok(changed)
    }

    async fn try_delete(&self, keys: &[CacheKey]) -> Result<u64, StorageError> {
        let mut deleted = 0;
        for chunk in keys.chunks(MAX_PARAMETERS) {
            let sql = format!("DELETE FROM records WHERE key IN ({})", placeholders(chunk.len()));
            let result = chunk
                .iter()
                .fold(query(&sql), |statement, key| statement.bind(key.as_str()))
                .execute(&self.pool)
                .await
                .map_err(backend)?;
            deleted += result.rows_affected();
        }
        Ok(deleted)
    }

    async fn try_dump(&self) -> Result<RecordDump, StorageError> {
        let rows = query_as::<_, Row>("SELECT key, record, dates FROM records ORDER BY key")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;

        Ok(rows
            .into_iter()
            .filter_map(|row| self.decode_reported(row))
            .map(|record| (record.key.clone(), record))
            .collect())
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn backend(error: sqlx::Error) -> StorageError {
    StorageError::Backend(error.to_string())
}

/// `*` and `?` keep their meaning, `[` would open a character class in SQLite globs.
fn glob(pattern: &str) -> String {
    pattern.replace('[', "[[]")
}

fn reported<T>(result: Result<T, StorageError>, fallback: T) -> T {
    result.unwrap_or_else(|error| {
        report_storage_error(&error);
        fallback
    })
}

#[async_trait::async_trait]
impl NormalizedCache for SqliteCache {
    async fn load_record(&self, key: &CacheKey, headers: &CacheHeaders) -> Option<Record> {
        self.load_records(std::slice::from_ref(key), headers).await.pop()
    }

    async fn load_records(&self, keys: &[CacheKey], headers: &CacheHeaders) -> Vec<Record> {
        let records = reported(self.try_load_records(keys).await, Vec::new());

        if headers.evict_after_read() && !records.is_empty() {
            let loaded = records.iter().map(|record| record.key.clone()).collect::<Vec<_>>();
            reported(self.try_delete(&loaded).await, 0);
        }

        records
    }

    async fn merge(&self, record: Record, headers: &CacheHeaders, merger: &dyn RecordMerger) -> HashSet<String> {
        self.merge_records(vec![record], headers, merger).await
    }

    async fn merge_records(
        &self,
        records: Vec<Record>,
        headers: &CacheHeaders,
        merger: &dyn RecordMerger,
    ) -> HashSet<String> {
        if headers.do_not_store() {
            return HashSet::new();
        }
        reported(self.try_merge(records, headers, merger).await, HashSet::new())
    }

    async fn remove(&self, key: &CacheKey, cascade: bool) -> bool {
        let keys = if cascade {
            cascade_keys(self, key, &CacheHeaders::none()).await
        } else {
            vec![key.clone()]
        };
        reported(self.try_delete(&keys).await, 0) > 0
    }

    async fn remove_pattern(&self, pattern: &str) -> usize {
        let result = query("DELETE FROM records WHERE key GLOB ?")
            .bind(glob(pattern))
            .execute(&self.pool)
            .await
            .map(|result| usize::try_from(result.rows_affected()).unwrap_or(usize::MAX))
            .map_err(backend);
        reported(result, 0)
    }

    async fn clear_all(&self) {
        let result = query("DELETE FROM records").execute(&self.pool).await.map_err(backend);
        reported(result.map(drop), ());
    }

    async fn dump(&self) -> IndexMap<String, RecordDump> {
        let mut dump = IndexMap::new();
        dump.insert(IDENTITY.to_string(), reported(self.try_dump().await, RecordDump::new()));
        dump
    }
}
