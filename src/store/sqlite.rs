use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use regex::Regex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;

use super::{
    AssetStore, InboxEntry, InboxState, InboxStore, NewInboxEntry, Row, StoreError, TableStore,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS acx_inbox (
    acx_inbox_id INTEGER PRIMARY KEY AUTOINCREMENT,
    acx_inbox_name VARCHAR(255) NOT NULL DEFAULT '',
    acx_inbox_description VARCHAR(1024) NOT NULL DEFAULT '',
    acx_inbox_creator VARCHAR(255) NOT NULL DEFAULT '',
    acx_inbox_vendor VARCHAR(255) NOT NULL DEFAULT '',
    acx_inbox_content_type VARCHAR(255) NOT NULL DEFAULT 'unknown',
    acx_inbox_content TEXT NOT NULL,
    processing_state VARCHAR(50) NOT NULL DEFAULT 'pending',
    processing_start TEXT,
    processing_end TEXT,
    processing_log TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_acx_inbox_state ON acx_inbox (processing_state);
CREATE TABLE IF NOT EXISTS acx_asset (
    acx_asset_id INTEGER PRIMARY KEY AUTOINCREMENT,
    client_id VARCHAR(255) NOT NULL UNIQUE,
    hostname VARCHAR(255) NOT NULL,
    ip_address VARCHAR(64) NOT NULL,
    last_seen TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
";

const ENTRY_COLUMNS: &str = "acx_inbox_id, acx_inbox_name, acx_inbox_description, \
    acx_inbox_creator, acx_inbox_vendor, acx_inbox_content_type, acx_inbox_content, \
    processing_state, created_at, processing_start, processing_end, processing_log";

/// SQLite-backed implementation of every store capability.
///
/// A single connection is shared behind a mutex; all calls are short and
/// synchronous, so async callers run them on the blocking pool.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    /// Open `path`, retrying with a fixed delay. Fails with the last error
    /// once `attempts` tries have been used up.
    pub async fn open_with_retry(
        path: &Path,
        attempts: u32,
        delay: Duration,
    ) -> Result<Self, StoreError> {
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            match Self::open(path) {
                Ok(store) => return Ok(store),
                Err(error) if attempt < attempts => {
                    tracing::warn!(
                        target = "fleet_control::store",
                        path = %path.display(),
                        attempt,
                        attempts,
                        error = %error,
                        "database unavailable, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Apply extra DDL, such as the target tables producers ingest into.
    pub fn apply_schema(&self, sql: &str) -> Result<(), StoreError> {
        self.conn.lock().execute_batch(sql)?;
        Ok(())
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn state_of(conn: &Connection, id: i64) -> Result<Option<String>, StoreError> {
        let state = conn
            .query_row(
                "SELECT processing_state FROM acx_inbox WHERE acx_inbox_id = ?1",
                params![id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(state)
    }
}

impl TableStore for SqliteStore {
    fn column_limits(&self, table: &str) -> Result<HashMap<String, usize>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
        let columns = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(1)?, row.get::<_, String>(2)?))
        })?;

        let mut limits = HashMap::new();
        for column in columns {
            let (name, declared) = column?;
            if let Some(limit) = declared_char_limit(&declared) {
                limits.insert(name, limit);
            }
        }
        Ok(limits)
    }

    fn insert_row(&self, table: &str, row: &Row) -> Result<(), StoreError> {
        if row.is_empty() {
            return Err(StoreError::EmptyRow {
                table: table.to_string(),
            });
        }

        let columns: Vec<String> = row.iter().map(|(name, _)| quote_ident(name)).collect();
        let placeholders: Vec<String> = (1..=row.len()).map(|n| format!("?{n}")).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(table),
            columns.join(", "),
            placeholders.join(", ")
        );
        let values: Vec<SqlValue> = row.iter().map(|(_, value)| to_sql_value(value)).collect();

        let conn = self.conn.lock();
        conn.execute(&sql, params_from_iter(values))?;
        Ok(())
    }

    fn list_tables(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let names = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut tables = Vec::new();
        for name in names {
            tables.push(name?);
        }
        Ok(tables)
    }
}

impl InboxStore for SqliteStore {
    fn create_entry(&self, entry: &NewInboxEntry) -> Result<i64, StoreError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO acx_inbox (acx_inbox_name, acx_inbox_description, acx_inbox_creator, \
             acx_inbox_vendor, acx_inbox_content_type, acx_inbox_content, processing_state, \
             created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?7)",
            params![
                entry.name,
                entry.description,
                entry.creator,
                entry.vendor,
                entry.content_type,
                entry.content,
                now
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn pending_entries(&self) -> Result<Vec<InboxEntry>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM acx_inbox \
             WHERE processing_state = 'pending' ORDER BY acx_inbox_id"
        ))?;
        let rows = stmt.query_map([], RawEntry::from_row)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?.into_entry()?);
        }
        Ok(entries)
    }

    fn mark_running(&self, id: i64, started_at: DateTime<Utc>) -> Result<bool, StoreError> {
        let started = started_at.to_rfc3339();
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE acx_inbox SET processing_state = 'running', processing_start = ?1, \
             updated_at = ?1 WHERE acx_inbox_id = ?2 AND processing_state = 'pending'",
            params![started, id],
        )?;
        Ok(changed > 0)
    }

    fn finish_entry(
        &self,
        id: i64,
        state: InboxState,
        log: &str,
        ended_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let current = Self::state_of(&conn, id)?.ok_or(StoreError::EntryNotFound(id))?;
        if current != InboxState::Running.as_str() || !state.is_terminal() {
            return Err(StoreError::InvalidTransition {
                id,
                from: current,
                to: state.as_str(),
            });
        }

        let ended = ended_at.to_rfc3339();
        conn.execute(
            "UPDATE acx_inbox SET processing_state = ?1, processing_end = ?2, \
             processing_log = ?3, updated_at = ?2 WHERE acx_inbox_id = ?4",
            params![state.as_str(), ended, log, id],
        )?;
        Ok(())
    }

    fn entry(&self, id: i64) -> Result<Option<InboxEntry>, StoreError> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM acx_inbox WHERE acx_inbox_id = ?1"),
                params![id],
                RawEntry::from_row,
            )
            .optional()?;
        raw.map(RawEntry::into_entry).transpose()
    }
}

impl AssetStore for SqliteStore {
    fn upsert_asset(
        &self,
        agent_id: &str,
        hostname: &str,
        address: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let seen = seen_at.to_rfc3339();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO acx_asset (client_id, hostname, ip_address, last_seen, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?4, ?4) \
             ON CONFLICT(client_id) DO UPDATE SET hostname = excluded.hostname, \
             ip_address = excluded.ip_address, last_seen = excluded.last_seen, \
             updated_at = excluded.updated_at",
            params![agent_id, hostname, address, seen],
        )?;
        Ok(())
    }

    fn remove_asset(&self, agent_id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM acx_asset WHERE client_id = ?1", params![agent_id])?;
        Ok(())
    }
}

struct RawEntry {
    id: i64,
    name: String,
    description: String,
    creator: String,
    vendor: String,
    content_type: String,
    content: String,
    state: String,
    created_at: String,
    started_at: Option<String>,
    ended_at: Option<String>,
    processing_log: Option<String>,
}

impl RawEntry {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            creator: row.get(3)?,
            vendor: row.get(4)?,
            content_type: row.get(5)?,
            content: row.get(6)?,
            state: row.get(7)?,
            created_at: row.get(8)?,
            started_at: row.get(9)?,
            ended_at: row.get(10)?,
            processing_log: row.get(11)?,
        })
    }

    fn into_entry(self) -> Result<InboxEntry, StoreError> {
        let state = InboxState::parse(&self.state).ok_or_else(|| StoreError::Corrupt {
            column: "processing_state".into(),
            detail: self.state.clone(),
        })?;
        Ok(InboxEntry {
            id: self.id,
            name: self.name,
            description: self.description,
            creator: self.creator,
            vendor: self.vendor,
            content_type: self.content_type,
            content: self.content,
            state,
            created_at: parse_timestamp("created_at", &self.created_at)?,
            started_at: self
                .started_at
                .as_deref()
                .map(|raw| parse_timestamp("processing_start", raw))
                .transpose()?,
            ended_at: self
                .ended_at
                .as_deref()
                .map(|raw| parse_timestamp("processing_end", raw))
                .transpose()?,
            processing_log: self.processing_log,
        })
    }
}

fn parse_timestamp(column: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|error| StoreError::Corrupt {
            column: column.to_string(),
            detail: error.to_string(),
        })
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Length limit of a `VARCHAR(n)`-style declared column type.
fn declared_char_limit(declared: &str) -> Option<usize> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r"(?i)^\s*n?(?:var)?char\s*\(\s*(\d+)\s*\)").ok())
        .as_ref()?;
    pattern
        .captures(declared)
        .and_then(|caps| caps.get(1))
        .and_then(|limit| limit.as_str().parse().ok())
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Number(number) => match number.as_i64() {
            Some(int) => SqlValue::Integer(int),
            None => number
                .as_f64()
                .map(SqlValue::Real)
                .unwrap_or_else(|| SqlValue::Text(number.to_string())),
        },
        Value::String(text) => SqlValue::Text(text.clone()),
        nested @ (Value::Array(_) | Value::Object(_)) => SqlValue::Text(nested.to_string()),
    }
}
