use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;

use super::mapping::{compile_all, FieldMapping, MappingError};
use crate::store::{Row, StoreError, TableStore};

/// Every variant's text is what ends up in the entry's processing log.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("content is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("`Content` section is missing or not an object")]
    MissingContent,
    #[error("`TableName` is missing or empty")]
    MissingTable,
    #[error("`FieldMappings` is missing or empty")]
    MissingMappings,
    #[error("`Data` is missing or empty")]
    MissingData,
    #[error("`Consts` must be an object")]
    InvalidConsts,
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error("record {index} is not an object")]
    InvalidRecord { index: usize },
    #[error("failed to read columns of `{table}`: {source}")]
    Schema { table: String, source: StoreError },
    #[error("insert into `{table}` failed at record {index}: {source}")]
    Insert {
        table: String,
        index: usize,
        source: StoreError,
    },
}

/// A validated submission: everything is checked before the first insert.
#[derive(Debug, Clone)]
pub struct Submission {
    pub table: String,
    pub consts: Map<String, Value>,
    pub mappings: Vec<FieldMapping>,
    pub records: Vec<Value>,
}

impl Submission {
    pub fn parse(content: &str) -> Result<Self, IngestError> {
        let doc: Value = serde_json::from_str(content)
            .map_err(|error| IngestError::InvalidJson(error.to_string()))?;
        Self::from_value(doc)
    }

    pub fn from_value(mut doc: Value) -> Result<Self, IngestError> {
        let content = doc
            .get_mut("Content")
            .and_then(Value::as_object_mut)
            .ok_or(IngestError::MissingContent)?;

        let table = content
            .get("TableName")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|table| !table.is_empty())
            .ok_or(IngestError::MissingTable)?
            .to_string();

        let raw_mappings = match content.get("FieldMappings") {
            Some(Value::Array(mappings)) if !mappings.is_empty() => mappings.clone(),
            _ => return Err(IngestError::MissingMappings),
        };

        let records = match content.remove("Data") {
            Some(Value::Array(records)) if !records.is_empty() => records,
            _ => return Err(IngestError::MissingData),
        };

        let consts = match content.remove("Consts") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(consts)) => consts,
            Some(_) => return Err(IngestError::InvalidConsts),
        };

        let mappings = compile_all(&raw_mappings)?;
        Ok(Self {
            table,
            consts,
            mappings,
            records,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub table: String,
    pub rows: usize,
    pub truncated: usize,
}

impl IngestReport {
    pub fn summary(&self) -> String {
        let mut text = format!("inserted {} rows into `{}`", self.rows, self.table);
        if self.truncated > 0 {
            text.push_str(&format!(", truncated {} values", self.truncated));
        }
        text
    }
}

pub struct IngestionEngine {
    store: Arc<dyn TableStore>,
}

impl IngestionEngine {
    pub fn new(store: Arc<dyn TableStore>) -> Self {
        Self { store }
    }

    /// Ingest one raw inbox body.
    pub fn ingest(&self, content: &str) -> Result<IngestReport, IngestError> {
        self.apply(&Submission::parse(content)?)
    }

    /// Write one row per record. Rows already inserted stay in place when a
    /// later record fails.
    pub fn apply(&self, submission: &Submission) -> Result<IngestReport, IngestError> {
        let table = submission.table.as_str();
        let limits: HashMap<String, usize> = self
            .store
            .column_limits(table)
            .map_err(|source| IngestError::Schema {
                table: table.to_string(),
                source,
            })?
            .into_iter()
            .map(|(column, limit)| (column.to_lowercase(), limit))
            .collect();

        let mut report = IngestReport {
            table: table.to_string(),
            ..IngestReport::default()
        };

        for (index, record) in submission.records.iter().enumerate() {
            let record = record
                .as_object()
                .ok_or(IngestError::InvalidRecord { index })?;

            let mut row = Row::new();
            for mapping in &submission.mappings {
                let value = mapping.expression.evaluate(record, &submission.consts);
                row.set(mapping.target.as_str(), value);
            }
            report.truncated += truncate_row(table, &mut row, &limits);

            self.store
                .insert_row(table, &row)
                .map_err(|source| IngestError::Insert {
                    table: table.to_string(),
                    index,
                    source,
                })?;
            report.rows += 1;
        }
        Ok(report)
    }
}

fn truncate_row(table: &str, row: &mut Row, limits: &HashMap<String, usize>) -> usize {
    let columns: Vec<String> = row.iter().map(|(column, _)| column.to_string()).collect();
    let mut truncated = 0;
    for column in columns {
        let Some(&limit) = limits.get(&column.to_lowercase()) else {
            continue;
        };
        let Some(Value::String(text)) = row.get_mut(&column) else {
            continue;
        };
        if let Some(cut) = truncate_chars(text, limit) {
            tracing::warn!(
                target = "fleet_control::ingest",
                table = %table,
                column = %column,
                from = text.chars().count(),
                to = limit,
                "value truncated to column length"
            );
            *text = cut;
            truncated += 1;
        }
    }
    truncated
}

/// First `max` characters of `text`, or `None` if it already fits.
fn truncate_chars(text: &str, max: usize) -> Option<String> {
    text.char_indices()
        .nth(max)
        .map(|(offset, _)| text[..offset].to_string())
}
