use chrono::{DateTime, Duration, NaiveDateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::OptionalExtension;
use rusqlite::{params, Connection, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

use sparkinsight_core::error::SparkError;
use sparkinsight_core::text::preview;

pub const DB_PATH: &str = "./spark.db";
pub const TABLE_NAME: &str = "spark_memories";

/// A stored memory with its bookkeeping timestamps.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryRecord {
    pub key: String,
    pub value: Value,
    pub tags: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub key: String,
    pub value: Value,
    pub tags: Vec<String>,
}

/// Handle to a memory database file.
///
/// The handle only remembers where the file lives. Each operation opens its
/// own connection and drops it before returning, so several processes may
/// share one file and rely on SQLite's locking.
///
/// The plain methods (`remember`, `recall`, ...) never fail: errors are logged
/// and turned into `false`, `None`, `0` or an empty list. The `try_*` twins
/// return the underlying [`SparkError`] instead.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    db_path: PathBuf,
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Reads an `updated_at` column value. Rows written by older tools carry
/// naive local time with no offset; those are taken at face value so that
/// text ordering and the write floor agree.
fn parse_stored_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc().trunc_subsecs(6))
}

/// Timestamp for the next write: now, or one microsecond past the newest
/// `updated_at` in the table when the clock has not moved past it.
fn next_write_timestamp(conn: &Connection) -> Result<String, SparkError> {
    let now = Utc::now().trunc_subsecs(6);
    let latest: Option<String> =
        conn.query_row("SELECT MAX(updated_at) FROM spark_memories", [], |row| {
            row.get(0)
        })?;
    let latest = latest.as_deref().and_then(parse_stored_timestamp);
    let stamp = match latest {
        Some(prev) if now <= prev => prev + Duration::microseconds(1),
        _ => now,
    };
    Ok(format_timestamp(stamp))
}

type RawRecord = (String, String, Option<String>, Option<String>, Option<String>);

fn record_from_raw(raw: RawRecord) -> Result<MemoryRecord, SparkError> {
    let (key, value, tags, created_at, updated_at) = raw;
    Ok(MemoryRecord {
        key,
        value: serde_json::from_str(&value)?,
        tags: decode_tags(tags.as_deref())?,
        created_at: created_at.unwrap_or_default(),
        updated_at: updated_at.unwrap_or_default(),
    })
}

fn raw_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

fn decode_tags(raw: Option<&str>) -> Result<Vec<String>, SparkError> {
    match raw {
        Some(s) if !s.trim().is_empty() => Ok(serde_json::from_str(s)?),
        _ => Ok(Vec::new()),
    }
}

/// Text a search query is matched against for a value. Strings, including
/// ones nested in arrays and objects, appear unescaped; numbers, booleans and
/// null use their JSON spelling.
fn render_value(value: &Value) -> String {
    let mut out = String::new();
    render_value_into(value, &mut out);
    out
}

fn render_value_into(value: &Value, out: &mut String) {
    match value {
        Value::String(s) => out.push_str(s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                render_value_into(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            out.push('{');
            for (i, (k, v)) in map.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(k);
                out.push_str(": ");
                render_value_into(v, out);
            }
            out.push('}');
        }
        other => out.push_str(&other.to_string()),
    }
}

fn matches_query(value: &Value, tags: &[String], needle: &str) -> bool {
    render_value(value).to_lowercase().contains(needle)
        || tags.join(" ").to_lowercase().contains(needle)
}

fn degrade<T: Default>(op: &str, result: Result<T, SparkError>) -> T {
    match result {
        Ok(v) => v,
        Err(e) => {
            error!("SPARKInsight error in {op}: {e}");
            T::default()
        }
    }
}

impl MemoryStore {
    /// Open (or create) the database file and make sure the memory table exists.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, SparkError> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS spark_memories (
                key TEXT PRIMARY KEY,
                value TEXT,
                tags TEXT,
                created_at TEXT,
                updated_at TEXT
            );",
        )?;
        info!("Memory store ready at {}", db_path.display());
        Ok(Self { db_path })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn connect(&self) -> Result<Connection, SparkError> {
        Ok(Connection::open(&self.db_path)?)
    }

    // --- Fallible operations ---

    /// Insert or fully replace the memory stored under `key`.
    ///
    /// An empty key is rejected. An empty `tags` slice is stored the same
    /// way as no tags at all.
    /// `created_at` survives replacement; `updated_at` is always refreshed.
    pub fn try_remember<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        tags: &[&str],
    ) -> Result<(), SparkError> {
        if key.is_empty() {
            return Err(SparkError::InvalidInput("memory key is empty".into()));
        }
        let value_json = serde_json::to_string(value)?;
        let tags_json = if tags.is_empty() {
            None
        } else {
            Some(serde_json::to_string(tags)?)
        };

        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = next_write_timestamp(&tx)?;
        tx.execute(
            "INSERT INTO spark_memories (key, value, tags, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(key) DO UPDATE SET
                 value = excluded.value,
                 tags = excluded.tags,
                 updated_at = excluded.updated_at",
            params![key, value_json, tags_json, now],
        )?;
        tx.commit()?;
        debug!("remembered {} at {now}", preview(key, 64));
        Ok(())
    }

    pub fn try_recall(&self, key: &str) -> Result<Option<Value>, SparkError> {
        let conn = self.connect()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM spark_memories WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    pub fn try_get(&self, key: &str) -> Result<Option<MemoryRecord>, SparkError> {
        let conn = self.connect()?;
        let raw = conn
            .query_row(
                "SELECT key, value, tags, created_at, updated_at
                 FROM spark_memories
                 WHERE key = ?1",
                params![key],
                raw_record,
            )
            .optional()?;
        raw.map(record_from_raw).transpose()
    }

    /// Case-insensitive substring search over values and tags.
    ///
    /// Scans and decodes every row on each call; there is no index. Results
    /// come back in whatever order SQLite stores the rows.
    pub fn try_search(&self, query: &str) -> Result<Vec<SearchHit>, SparkError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT key, value, tags FROM spark_memories")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let needle = query.to_lowercase();
        let mut hits = Vec::new();
        for (key, value_json, tags_json) in rows {
            let value: Value = serde_json::from_str(&value_json)?;
            let tags = decode_tags(tags_json.as_deref())?;
            if matches_query(&value, &tags, &needle) {
                hits.push(SearchHit { key, value, tags });
            }
        }
        debug!("search {:?} matched {} memories", preview(query, 64), hits.len());
        Ok(hits)
    }

    /// Delete a memory by key. Returns true if a row was deleted.
    pub fn try_forget(&self, key: &str) -> Result<bool, SparkError> {
        let conn = self.connect()?;
        let rows = conn.execute("DELETE FROM spark_memories WHERE key = ?1", params![key])?;
        Ok(rows > 0)
    }

    /// All memories, most recently written first.
    pub fn try_list_all(&self) -> Result<Vec<MemoryRecord>, SparkError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT key, value, tags, created_at, updated_at
             FROM spark_memories
             ORDER BY updated_at DESC",
        )?;
        let rows = stmt
            .query_map([], raw_record)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(record_from_raw).collect()
    }

    pub fn try_count(&self) -> Result<usize, SparkError> {
        let conn = self.connect()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM spark_memories", [], |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }

    /// Delete every memory. Returns how many rows were removed.
    pub fn try_clear(&self) -> Result<usize, SparkError> {
        let conn = self.connect()?;
        let rows = conn.execute("DELETE FROM spark_memories", [])?;
        info!("Cleared {rows} memories");
        Ok(rows)
    }

    // --- Non-failing boundary ---

    pub fn remember<T: Serialize + ?Sized>(&self, key: &str, value: &T, tags: &[&str]) -> bool {
        degrade("remember", self.try_remember(key, value, tags).map(|()| true))
    }

    /// Value stored under `key`, or `None` when absent or unreadable.
    pub fn recall(&self, key: &str) -> Option<Value> {
        degrade("recall", self.try_recall(key))
    }

    /// Like [`MemoryStore::recall`], decoded into a concrete type.
    pub fn recall_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.recall(key)?;
        degrade(
            "recall_as",
            serde_json::from_value(value)
                .map(Some)
                .map_err(SparkError::from),
        )
    }

    pub fn get(&self, key: &str) -> Option<MemoryRecord> {
        degrade("get", self.try_get(key))
    }

    pub fn search(&self, query: &str) -> Vec<SearchHit> {
        degrade("search", self.try_search(query))
    }

    pub fn forget(&self, key: &str) -> bool {
        degrade("forget", self.try_forget(key))
    }

    pub fn list_all(&self) -> Vec<MemoryRecord> {
        degrade("list_all", self.try_list_all())
    }

    pub fn count(&self) -> usize {
        degrade("count", self.try_count())
    }

    pub fn clear(&self) -> bool {
        degrade("clear", self.try_clear().map(|_| true))
    }
}
