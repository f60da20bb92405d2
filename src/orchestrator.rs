//! Conversion Orchestrator
//!
//! Entry point of the pipeline: validate the inbound request, call the agent, segment
//! the reply, normalize the query and, for analytical requests, run every statement
//! through the repair loop.

use crate::agent::{AgentClient, HttpAgentTransport};
use crate::config::Config;
use crate::error::{Result, SqllyError};
use crate::execution::{QueryEndpoint, RepairLoop, StatementRun, SupabaseRpcEndpoint};
use crate::model::{ColumnType, ConversionRequest, Row, SchemaDescriptor};
use crate::normalizer::{
    extract_dataset_id, is_read_only, is_scoped_to, join_statements, split_statements, Normalizer,
};
use crate::observability::{ConversionLog, ConversionStatus};
use crate::segmenter::{ReplyParser, StructuredFirstParser};
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatementStatus {
    Succeeded,
    Failed,
    Rejected,
}

/// Per-statement result returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatementResult {
    pub statement: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    pub status: StatementStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<Row>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    pub repaired: bool,
}

impl From<StatementRun> for StatementResult {
    fn from(run: StatementRun) -> Self {
        match run.result {
            Ok(report) => StatementResult {
                statement: run.statement,
                sql: Some(report.sql),
                status: StatementStatus::Succeeded,
                rows: Some(report.rows),
                error: None,
                repaired: report.repaired,
            },
            Err(e) => {
                let status = match e {
                    SqllyError::DisallowedStatement(_) | SqllyError::UnscopedStatement { .. } => {
                        StatementStatus::Rejected
                    }
                    _ => StatementStatus::Failed,
                };
                StatementResult {
                    statement: run.statement,
                    sql: None,
                    status,
                    rows: None,
                    error: Some(e.to_json()),
                    repaired: false,
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionResponse {
    pub reply: String,
    pub restatement: String,
    /// Normalized query text; statements joined with `;`.
    pub sql: String,
    pub result_description: String,
    pub is_general_question: bool,
    pub statements: Vec<StatementResult>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResponse {
    pub statements: Vec<StatementResult>,
}

/// Caller-supplied SQL for direct execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteRequest {
    pub sql: String,
    pub target_dataset_id: String,
}

/// Build a [`ConversionRequest`] from an inbound JSON body.
pub fn parse_request(body: &Value) -> Result<ConversionRequest> {
    let prompt_text = body
        .get("prompt")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| SqllyError::InvalidRequest("Prompt is required".to_string()))?
        .to_string();

    let schema = parse_schema(body.get("schema"))?;

    let sample_rows = body
        .get("sampleRows")
        .and_then(Value::as_array)
        .ok_or_else(|| SqllyError::InvalidRequest("sampleRows must be an array".to_string()))?
        .iter()
        .enumerate()
        .map(|(i, row)| {
            row.as_object()
                .cloned()
                .ok_or_else(|| SqllyError::InvalidRequest(format!("Sample row {} must be an object", i)))
        })
        .collect::<Result<Vec<Row>>>()?;

    let target_dataset_id = parse_file_id(body)?;

    let request = ConversionRequest {
        prompt_text,
        schema,
        sample_rows,
        target_dataset_id,
    };
    request.validate()?;
    Ok(request)
}

pub fn parse_execute_request(body: &Value) -> Result<ExecuteRequest> {
    let sql = body
        .get("sql")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| SqllyError::InvalidRequest("sql is required".to_string()))?
        .to_string();
    Ok(ExecuteRequest {
        sql,
        target_dataset_id: parse_file_id(body)?,
    })
}

fn parse_schema(value: Option<&Value>) -> Result<SchemaDescriptor> {
    let object = value
        .and_then(Value::as_object)
        .ok_or_else(|| SqllyError::InvalidRequest("Schema must be an object".to_string()))?;

    object
        .iter()
        .map(|(column, ty)| {
            let parsed = ty.as_str().and_then(ColumnType::parse).ok_or_else(|| {
                SqllyError::InvalidRequest(format!("Unknown type {} for column '{}'", ty, column))
            })?;
            Ok((column.clone(), parsed))
        })
        .collect()
}

fn parse_file_id(body: &Value) -> Result<String> {
    body.get("fileId")
        .and_then(Value::as_str)
        .and_then(extract_dataset_id)
        .ok_or_else(|| SqllyError::InvalidRequest("fileId is required".to_string()))
}

/// Pipeline entry point. Dependencies are built once at startup and shared.
#[derive(Clone)]
pub struct Orchestrator {
    agent: AgentClient,
    endpoint: Arc<dyn QueryEndpoint>,
    parser: Arc<dyn ReplyParser>,
}

impl Orchestrator {
    pub fn new(agent: AgentClient, endpoint: Arc<dyn QueryEndpoint>) -> Self {
        Self {
            agent,
            endpoint,
            parser: Arc::new(StructuredFirstParser),
        }
    }

    /// HTTP agent transport and the Supabase RPC endpoint from validated configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let transport = HttpAgentTransport::new(&config.agent)?;
        let agent = AgentClient::from_config(&config.agent, Arc::new(transport));
        let endpoint = SupabaseRpcEndpoint::new(&config.store)?;
        Ok(Self::new(agent, Arc::new(endpoint)))
    }

    pub fn with_parser(mut self, parser: Arc<dyn ReplyParser>) -> Self {
        self.parser = parser;
        self
    }

    /// Parse an inbound JSON body and convert it. Invalid bodies never reach the agent.
    pub async fn handle_until<F>(&self, body: &Value, cancel: F) -> Result<ConversionResponse>
    where
        F: Future<Output = ()>,
    {
        let request = match parse_request(body) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Rejected conversion request");
                return Err(e);
            }
        };
        self.convert_until(&request, cancel).await
    }

    pub async fn convert(&self, request: &ConversionRequest) -> Result<ConversionResponse> {
        self.convert_until(request, std::future::pending()).await
    }

    /// Convert, abandoning in-flight network calls as soon as `cancel` resolves.
    pub async fn convert_until<F>(&self, request: &ConversionRequest, cancel: F) -> Result<ConversionResponse>
    where
        F: Future<Output = ()>,
    {
        let log = ConversionLog::start(Some(&request.target_dataset_id));

        let outcome = tokio::select! {
            result = self.pipeline(request) => result,
            _ = cancel => Err(SqllyError::Cancelled),
        };

        record(log, &outcome);
        outcome
    }

    async fn pipeline(&self, request: &ConversionRequest) -> Result<ConversionResponse> {
        request.validate()?;
        let dataset_id = request.target_dataset_id.as_str();

        let reply = self
            .agent
            .send(
                &request.prompt_text,
                Some(&request.schema),
                Some(&request.sample_rows),
                Some(dataset_id),
            )
            .await?;

        let segmented = self.parser.parse(&reply, &request.prompt_text);
        info!(
            analytical = segmented.is_analytical,
            has_query = !segmented.query_text.is_empty(),
            "Agent reply segmented"
        );

        let normalizer = Normalizer::with_schema(request.schema.clone());
        let normalized: Vec<String> = split_statements(&segmented.query_text)
            .iter()
            .map(|statement| normalizer.normalize(statement, dataset_id).text)
            .collect();
        let warnings = statement_warnings(&normalized, dataset_id);
        let sql = join_statements(&normalized);

        let statements = if segmented.is_analytical && !normalized.is_empty() {
            RepairLoop::new(self.endpoint.clone())
                .with_normalizer(normalizer)
                .run_statements(&normalized, dataset_id)
                .await
                .into_iter()
                .map(StatementResult::from)
                .collect()
        } else {
            Vec::new()
        };

        Ok(ConversionResponse {
            reply: reply.raw_text,
            restatement: segmented.restatement,
            sql,
            result_description: segmented.description,
            is_general_question: segmented.is_analytical,
            statements,
            warnings,
        })
    }

    /// Run caller-supplied SQL through the repair loop. A non-SELECT statement anywhere
    /// in the text rejects the whole request before anything is executed.
    pub async fn execute(&self, request: &ExecuteRequest) -> Result<ExecutionResponse> {
        let statements = split_statements(&request.sql);
        if statements.is_empty() {
            return Err(SqllyError::InvalidRequest("sql is required".to_string()));
        }
        if let Some(statement) = statements.iter().find(|s| !is_read_only(s)) {
            warn!("Rejected execute request containing a non-SELECT statement");
            return Err(SqllyError::DisallowedStatement(statement.clone()));
        }

        let runs = RepairLoop::new(self.endpoint.clone())
            .run_statements(&statements, &request.target_dataset_id)
            .await;
        Ok(ExecutionResponse {
            statements: runs.into_iter().map(StatementResult::from).collect(),
        })
    }
}

fn statement_warnings(statements: &[String], dataset_id: &str) -> Vec<String> {
    let mut warnings = Vec::new();
    for (i, statement) in statements.iter().enumerate() {
        if !is_read_only(statement) {
            warnings.push(format!("Statement {} is not a SELECT and will not be executed", i + 1));
        } else if !is_scoped_to(statement, dataset_id) {
            warnings.push(format!(
                "Statement {} does not filter on file_id = '{}' and will not be executed",
                i + 1,
                dataset_id
            ));
        }
    }
    warnings
}

fn record(log: ConversionLog, outcome: &Result<ConversionResponse>) {
    match outcome {
        Ok(response) => {
            let mut log = log;
            log.is_analytical = response.is_general_question;
            log.statement_count = split_statements(&response.sql).len();
            log.repaired_count = response.statements.iter().filter(|s| s.repaired).count();
            let status = if response.statements.is_empty() {
                ConversionStatus::Converted
            } else {
                ConversionStatus::Executed
            };
            log.finish(status, None);
        }
        Err(SqllyError::Cancelled) => {
            log.finish(ConversionStatus::Cancelled, None);
        }
        Err(e @ SqllyError::InvalidRequest(_)) => {
            log.finish(ConversionStatus::Rejected, Some(e.to_string()));
        }
        Err(e) => {
            log.finish(ConversionStatus::Failed, Some(e.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentChatRequest, AgentTransport};
    use crate::error::EndpointError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    const FILE: &str = "59037db4-f134-41d6-9cea-931d56278a38";

    struct SlowTransport;

    #[async_trait]
    impl AgentTransport for SlowTransport {
        async fn post_chat(&self, _request: &AgentChatRequest) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok("too late".to_string())
        }
    }

    struct NoRows;

    #[async_trait]
    impl QueryEndpoint for NoRows {
        async fn execute(&self, _sql: &str) -> std::result::Result<Vec<Row>, EndpointError> {
            Ok(Vec::new())
        }
    }

    fn body() -> Value {
        json!({
            "prompt": "rows where Age > 30",
            "schema": {"Name": "text", "Age": "numeric"},
            "sampleRows": [{"Name": "Ana", "Age": 34}],
            "fileId": FILE,
        })
    }

    fn invalid_message(body: &Value) -> String {
        match parse_request(body) {
            Err(SqllyError::InvalidRequest(message)) => message,
            other => panic!("expected InvalidRequest, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_valid_request() {
        let request = parse_request(&body()).unwrap();
        assert_eq!(request.prompt_text, "rows where Age > 30");
        assert_eq!(request.schema["Age"], ColumnType::Numeric);
        assert_eq!(request.sample_rows.len(), 1);
        assert_eq!(request.target_dataset_id, FILE);
    }

    #[test]
    fn test_validation_messages() {
        let mut b = body();
        b["prompt"] = json!("   ");
        assert_eq!(invalid_message(&b), "Prompt is required");

        let mut b = body();
        b["schema"] = json!(["Age"]);
        assert_eq!(invalid_message(&b), "Schema must be an object");

        let mut b = body();
        b.as_object_mut().unwrap().remove("sampleRows");
        assert_eq!(invalid_message(&b), "sampleRows must be an array");

        let mut b = body();
        b["fileId"] = json!("");
        assert_eq!(invalid_message(&b), "fileId is required");

        let mut b = body();
        b["schema"]["Age"] = json!("float8");
        assert!(invalid_message(&b).contains("Unknown type"));
    }

    #[test]
    fn test_file_id_embedded_uuid_is_extracted() {
        let mut b = body();
        b["fileId"] = json!(format!("uploads/{}-people.csv", FILE));
        assert_eq!(parse_request(&b).unwrap().target_dataset_id, FILE);
    }

    #[test]
    fn test_parse_execute_request() {
        let request = parse_execute_request(&json!({"sql": " SELECT 1 ", "fileId": FILE})).unwrap();
        assert_eq!(request.sql, "SELECT 1");
        assert!(parse_execute_request(&json!({"fileId": FILE})).is_err());
    }

    #[test]
    fn test_statement_warnings() {
        let statements = vec![
            format!("SELECT 1 FROM csv_data WHERE file_id = '{}'", FILE),
            "SELECT 1 FROM csv_data".to_string(),
            "DROP TABLE csv_data".to_string(),
        ];
        let warnings = statement_warnings(&statements, FILE);
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].starts_with("Statement 2 does not filter on file_id"));
        assert!(warnings[1].starts_with("Statement 3 is not a SELECT"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_abandons_agent_call() {
        let orchestrator = Orchestrator::new(
            AgentClient::with_transport(Arc::new(SlowTransport)),
            Arc::new(NoRows),
        );
        let request = parse_request(&body()).unwrap();

        let err = orchestrator
            .convert_until(&request, tokio::time::sleep(Duration::from_millis(50)))
            .await
            .unwrap_err();

        assert!(matches!(err, SqllyError::Cancelled));
    }
}
