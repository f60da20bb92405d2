//! Request-scoped data model shared by the pipeline stages.

use crate::error::{Result, SqllyError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// One sample row: column name to scalar value.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Column name to declared type.
pub type SchemaDescriptor = BTreeMap<String, ColumnType>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Text,
    Integer,
    Numeric,
    Boolean,
    Timestamp,
}

impl ColumnType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "text" => Some(ColumnType::Text),
            "integer" => Some(ColumnType::Integer),
            "numeric" => Some(ColumnType::Numeric),
            "boolean" => Some(ColumnType::Boolean),
            "timestamp" => Some(ColumnType::Timestamp),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::Integer => "integer",
            ColumnType::Numeric => "numeric",
            ColumnType::Boolean => "boolean",
            ColumnType::Timestamp => "timestamp",
        }
    }

    /// Postgres cast applied to `row_data->>'col'` before comparing. `None` for text.
    pub fn comparison_cast(&self) -> Option<&'static str> {
        match self {
            ColumnType::Text => None,
            ColumnType::Integer | ColumnType::Numeric => Some("numeric"),
            ColumnType::Boolean => Some("boolean"),
            ColumnType::Timestamp => Some("timestamp"),
        }
    }

    /// Infer a column type from one sample value.
    pub fn infer(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => ColumnType::Integer,
            serde_json::Value::Number(_) => ColumnType::Numeric,
            serde_json::Value::Bool(_) => ColumnType::Boolean,
            serde_json::Value::String(s) if looks_like_timestamp(s) => ColumnType::Timestamp,
            _ => ColumnType::Text,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn looks_like_timestamp(value: &str) -> bool {
    lazy_static::lazy_static! {
        static ref DATE_PREFIX: regex::Regex =
            regex::Regex::new(r"^\d{4}-\d{2}-\d{2}(T\d{2}:\d{2}:\d{2})?").unwrap();
    }
    DATE_PREFIX.is_match(value)
}

/// Validated inbound conversion request.
#[derive(Debug, Clone)]
pub struct ConversionRequest {
    pub prompt_text: String,
    pub schema: SchemaDescriptor,
    pub sample_rows: Vec<Row>,
    pub target_dataset_id: String,
}

impl ConversionRequest {
    /// Checks the cross-field invariants: non-empty prompt, schema covers every
    /// sample-row column, dataset id present.
    pub fn validate(&self) -> Result<()> {
        if self.prompt_text.trim().is_empty() {
            return Err(SqllyError::InvalidRequest("Prompt is required".to_string()));
        }
        if self.target_dataset_id.trim().is_empty() {
            return Err(SqllyError::InvalidRequest("fileId is required".to_string()));
        }
        for (index, row) in self.sample_rows.iter().enumerate() {
            if let Some(column) = row.keys().find(|c| !self.schema.contains_key(c.as_str())) {
                return Err(SqllyError::InvalidRequest(format!(
                    "Sample row {} has column '{}' missing from schema",
                    index, column
                )));
            }
        }
        Ok(())
    }
}

/// Raw agent output, produced once per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentReply {
    pub raw_text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentedReply {
    pub restatement: String,
    pub query_text: String,
    pub description: String,
    pub is_analytical: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedQuery {
    pub text: String,
}
