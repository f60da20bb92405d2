use serde::Serialize;
use thiserror::Error;

/// Structured failure reported by the query-execution endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EndpointError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl EndpointError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }
}

impl std::fmt::Display for EndpointError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(ref details) = self.details {
            write!(f, ". Details: {}", details)?;
        }
        if let Some(ref code) = self.code {
            write!(f, ". Code: {}", code)?;
        }
        if let Some(ref hint) = self.hint {
            write!(f, ". Hint: {}", hint)?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum SqllyError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("Missing configuration: {}", .0.join(", "))]
    ConfigurationMissing(Vec<String>),

    #[error("Invalid configuration: {0}")]
    ConfigurationInvalid(String),

    #[error("Agent unavailable after {attempts} attempt(s): {last_error}")]
    AgentUnavailable { attempts: u32, last_error: String },

    /// Single-attempt agent failure; wrapped into `AgentUnavailable` once retries run out.
    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Only SELECT statements are allowed: {0}")]
    DisallowedStatement(String),

    #[error("Statement is not scoped to dataset '{dataset_id}': {statement}")]
    UnscopedStatement { statement: String, dataset_id: String },

    #[error("SQL execution error: {0}")]
    ExecutionFailed(EndpointError),

    #[error("Request cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl SqllyError {
    /// HTTP status used when the error reaches the conversion endpoint.
    pub fn status_code(&self) -> u16 {
        match self {
            SqllyError::InvalidRequest(_)
            | SqllyError::DisallowedStatement(_)
            | SqllyError::UnscopedStatement { .. }
            | SqllyError::Json(_)
            | SqllyError::Csv(_) => 400,
            SqllyError::Cancelled => 499,
            SqllyError::ConfigurationMissing(_)
            | SqllyError::ConfigurationInvalid(_)
            | SqllyError::AgentUnavailable { .. }
            | SqllyError::Agent(_)
            | SqllyError::ExecutionFailed(_)
            | SqllyError::Io(_) => 500,
        }
    }

    /// JSON body returned to callers. Always carries a human-readable `error`.
    pub fn to_json(&self) -> serde_json::Value {
        let mut body = serde_json::json!({ "error": self.to_string() });
        if let SqllyError::ExecutionFailed(ref detail) = self {
            body["message"] = serde_json::json!(detail.message);
            if let Some(ref code) = detail.code {
                body["code"] = serde_json::json!(code);
            }
            if let Some(ref details) = detail.details {
                body["details"] = serde_json::json!(details);
            }
            if let Some(ref hint) = detail.hint {
                body["hint"] = serde_json::json!(hint);
            }
        }
        body
    }
}

pub type Result<T> = std::result::Result<T, SqllyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_request_is_client_error() {
        let err = SqllyError::InvalidRequest("Prompt is required".to_string());
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.to_json(), serde_json::json!({ "error": "Prompt is required" }));
    }

    #[test]
    fn test_execution_failure_body_keeps_endpoint_detail() {
        let err = SqllyError::ExecutionFailed(EndpointError {
            message: "column \"age\" does not exist".to_string(),
            code: Some("42703".to_string()),
            details: None,
            hint: Some("Perhaps you meant row_data->>'Age'".to_string()),
        });
        let body = err.to_json();
        assert_eq!(err.status_code(), 500);
        assert_eq!(body["code"], "42703");
        assert_eq!(body["hint"], "Perhaps you meant row_data->>'Age'");
        assert!(body.get("details").is_none());
        assert!(body["error"].as_str().unwrap().contains("does not exist"));
    }

    #[test]
    fn test_configuration_missing_lists_every_variable() {
        let err = SqllyError::ConfigurationMissing(vec![
            "AGENT_BASE_URL".to_string(),
            "SUPABASE_URL".to_string(),
        ]);
        assert_eq!(err.to_string(), "Missing configuration: AGENT_BASE_URL, SUPABASE_URL");
    }

    #[test]
    fn test_invalid_configuration_is_server_error() {
        let err = SqllyError::ConfigurationInvalid("AGENT_BACKOFF_MS must be a non-negative integer, got 'soon'".to_string());
        assert_eq!(err.status_code(), 500);
        assert!(err.to_string().starts_with("Invalid configuration: AGENT_BACKOFF_MS"));
    }
}
