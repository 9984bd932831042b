//! Durable storage capabilities.
//!
//! The ingestion engine, the inbox pipeline and the session layer only see
//! these traits; [`SqliteStore`] is the implementation the server runs with.

mod sqlite;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("row for `{table}` has no columns")]
    EmptyRow { table: String },
    #[error("inbox entry {0} not found")]
    EntryNotFound(i64),
    #[error("inbox entry {id} cannot move from `{from}` to `{to}`")]
    InvalidTransition {
        id: i64,
        from: String,
        to: &'static str,
    },
    #[error("invalid stored value in `{column}`: {detail}")]
    Corrupt { column: String, detail: String },
}

/// One row to insert: ordered column/value pairs, unique by column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<(String, Value)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `column`, replacing an earlier value for the same column in place.
    pub fn set(&mut self, column: impl Into<String>, value: Value) {
        let column = column.into();
        match self.columns.iter_mut().find(|(name, _)| *name == column) {
            Some(slot) => slot.1 = value,
            None => self.columns.push((column, value)),
        }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    pub fn get_mut(&mut self, column: &str) -> Option<&mut Value> {
        self.columns
            .iter_mut()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Tables whose shape is only known at run time.
pub trait TableStore: Send + Sync {
    /// Maximum character length per string-typed column of `table`.
    /// Columns without a declared length are absent.
    fn column_limits(&self, table: &str) -> Result<HashMap<String, usize>, StoreError>;

    fn insert_row(&self, table: &str, row: &Row) -> Result<(), StoreError>;

    fn list_tables(&self) -> Result<Vec<String>, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboxState {
    Pending,
    Running,
    Success,
    Error,
}

impl InboxState {
    pub fn as_str(self) -> &'static str {
        match self {
            InboxState::Pending => "pending",
            InboxState::Running => "running",
            InboxState::Success => "success",
            InboxState::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(InboxState::Pending),
            "running" => Some(InboxState::Running),
            "success" => Some(InboxState::Success),
            "error" => Some(InboxState::Error),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, InboxState::Success | InboxState::Error)
    }
}

/// Immutable submission fields, captured when a producer posts to the inbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewInboxEntry {
    pub name: String,
    pub description: String,
    pub creator: String,
    pub vendor: String,
    pub content_type: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InboxEntry {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub creator: String,
    pub vendor: String,
    pub content_type: String,
    #[serde(skip)]
    pub content: String,
    pub state: InboxState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub processing_log: Option<String>,
}

pub trait InboxStore: Send + Sync {
    fn create_entry(&self, entry: &NewInboxEntry) -> Result<i64, StoreError>;

    fn pending_entries(&self) -> Result<Vec<InboxEntry>, StoreError>;

    /// Move a pending entry to `running`. Returns `false` if the entry was
    /// not pending any more.
    fn mark_running(&self, id: i64, started_at: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Move a running entry to a terminal state.
    fn finish_entry(
        &self,
        id: i64,
        state: InboxState,
        log: &str,
        ended_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    fn entry(&self, id: i64) -> Result<Option<InboxEntry>, StoreError>;
}

/// Durable record of agents seen by the control plane.
pub trait AssetStore: Send + Sync {
    fn upsert_asset(
        &self,
        agent_id: &str,
        hostname: &str,
        address: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Remove the asset record. Removing an unknown agent is not an error.
    fn remove_asset(&self, agent_id: &str) -> Result<(), StoreError>;
}
