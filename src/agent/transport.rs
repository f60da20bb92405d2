use crate::config::AgentConfig;
use crate::error::{Result, SqllyError};
use crate::model::{Row, SchemaDescriptor};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

/// Instructions sent with every conversion request.
pub const AGENT_INSTRUCTIONS: &str = r#"You are an SQL assistant that converts natural language questions about an uploaded CSV file into PostgreSQL.
Rows live in table csv_data(file_id uuid, row_index int, row_data jsonb). Read fields with row_data->>'Column'.
Every query must filter on file_id = '<fileId from context>'. Only write SELECT statements.
Answer in three parts:
1. A one-sentence restatement of what the user wants.
2. The SQL inside a ```sql code block. Separate multiple statements with ';'.
3. A short description of the expected results.
Do not execute queries yourself."#;

/// Body of `POST {base_url}/api/chat`.
#[derive(Debug, Clone, Serialize)]
pub struct AgentChatRequest {
    pub agent: String,
    pub instructions: String,
    pub input: String,
    pub context: AgentContext,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentContext {
    pub schema: SchemaDescriptor,
    pub sample_rows: Vec<Row>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
}

/// One attempt against the agent service. Retrying is the caller's job.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn post_chat(&self, request: &AgentChatRequest) -> Result<String>;
}

/// reqwest-backed transport.
pub struct HttpAgentTransport {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpAgentTransport {
    pub fn new(config: &AgentConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| SqllyError::ConfigurationInvalid(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl AgentTransport for HttpAgentTransport {
    async fn post_chat(&self, request: &AgentChatRequest) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| SqllyError::Agent(format!("Agent API call failed: {}", e.without_url())))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(SqllyError::Agent(format!(
                "Agent API error ({}): {}",
                status, error_text
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| SqllyError::Agent(format!("Failed to parse agent response: {}", e)))?;

        reply_text_from_body(&body)
    }
}

/// Pull the reply text out of an agent response body.
///
/// A structured `sql` field is folded back into the text as a fenced block when the
/// reply itself has none, so the segmenter sees a single protocol.
pub fn reply_text_from_body(body: &serde_json::Value) -> Result<String> {
    if let Some(error) = body.get("error") {
        return Err(SqllyError::Agent(format!("Agent API error: {}", error)));
    }

    let reply = body
        .get("reply")
        .or_else(|| body.get("text"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim();
    let sql = body.get("sql").and_then(|v| v.as_str()).unwrap_or("").trim();

    if reply.is_empty() && sql.is_empty() {
        return Err(SqllyError::Agent("Empty reply from agent".to_string()));
    }

    if sql.is_empty() || reply.to_ascii_lowercase().contains("```sql") {
        return Ok(reply.to_string());
    }

    if reply.is_empty() {
        Ok(format!("```sql\n{}\n```", sql))
    } else {
        Ok(format!("{}\n\n```sql\n{}\n```", reply, sql))
    }
}
