//! Query-execution endpoint
//!
//! The database is reached through a remote procedure that runs one read-only
//! statement and returns its rows as JSON.

use crate::config::StoreConfig;
use crate::error::{EndpointError, Result, SqllyError};
use crate::model::Row;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

pub const EXECUTE_PROCEDURE: &str = "execute_dynamic_select";

/// Runs one statement. Failures come back as structured [`EndpointError`]s so the
/// repair loop can classify them.
#[async_trait]
pub trait QueryEndpoint: Send + Sync {
    async fn execute(&self, sql: &str) -> std::result::Result<Vec<Row>, EndpointError>;
}

/// PostgREST RPC call: `POST {url}/rest/v1/rpc/execute_dynamic_select`.
pub struct SupabaseRpcEndpoint {
    client: Client,
    rpc_url: String,
    service_key: String,
}

#[derive(Debug, Default, Deserialize)]
struct RpcErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    details: Option<String>,
    #[serde(default)]
    hint: Option<String>,
}

impl SupabaseRpcEndpoint {
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SqllyError::ConfigurationInvalid(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            rpc_url: format!(
                "{}/rest/v1/rpc/{}",
                config.url.trim_end_matches('/'),
                EXECUTE_PROCEDURE
            ),
            service_key: config.service_key.clone(),
        })
    }
}

#[async_trait]
impl QueryEndpoint for SupabaseRpcEndpoint {
    async fn execute(&self, sql: &str) -> std::result::Result<Vec<Row>, EndpointError> {
        let response = self
            .client
            .post(&self.rpc_url)
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
            .header("Content-Type", "application/json")
            .json(&serde_json::json!({ "query": sql }))
            .send()
            .await
            .map_err(|e| EndpointError::new(format!("Query endpoint unreachable: {}", e.without_url())))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| EndpointError::new(format!("Failed to read query endpoint response: {}", e)))?;

        if !status.is_success() {
            return Err(parse_error_body(status.as_u16(), &text));
        }

        let body: Value = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text)
                .map_err(|e| EndpointError::new(format!("Invalid query endpoint response: {}", e)))?
        };
        Ok(rows_from_value(body))
    }
}

/// Structured error from a PostgREST failure body, or the raw text when it is not JSON.
pub fn parse_error_body(status: u16, text: &str) -> EndpointError {
    match serde_json::from_str::<RpcErrorBody>(text) {
        Ok(body) if body.message.is_some() || body.code.is_some() => EndpointError {
            message: body
                .message
                .unwrap_or_else(|| format!("Query endpoint error ({})", status)),
            code: body.code,
            details: body.details,
            hint: body.hint,
        },
        _ => EndpointError::new(format!("Query endpoint error ({}): {}", status, text.trim())),
    }
}

/// Rows from the procedure's result. Objects are rows as-is; any other value becomes
/// a one-column row under `value`.
pub fn rows_from_value(value: Value) -> Vec<Row> {
    let items = match value {
        Value::Null => return Vec::new(),
        Value::Array(items) => items,
        other => vec![other],
    };
    items
        .into_iter()
        .map(|item| match item {
            Value::Object(row) => row,
            other => {
                let mut row = Row::new();
                row.insert("value".to_string(), other);
                row
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_postgrest_error_body_is_structured() {
        let err = parse_error_body(
            400,
            r#"{"code":"42804","details":"Returned type jsonb does not match expected type json in column 1.","hint":null,"message":"structure of query does not match function result type"}"#,
        );
        assert_eq!(err.code.as_deref(), Some("42804"));
        assert_eq!(err.message, "structure of query does not match function result type");
        assert!(err.details.unwrap().contains("jsonb does not match expected type json"));
        assert!(err.hint.is_none());
    }

    #[test]
    fn test_non_json_error_body_kept_verbatim() {
        let err = parse_error_body(502, "Bad Gateway\n");
        assert_eq!(err.message, "Query endpoint error (502): Bad Gateway");
        assert!(err.code.is_none());
    }

    #[test]
    fn test_rows_from_value() {
        let rows = rows_from_value(json!([{"Name": "Ana", "Age": 34}, 7]));
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["Name"], "Ana");
        assert_eq!(rows[1]["value"], 7);
        assert!(rows_from_value(Value::Null).is_empty());
    }
}
