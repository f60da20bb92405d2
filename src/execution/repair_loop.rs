//! Execution Repair Loop
//!
//! Normalize, execute, and on a wire-type mismatch rewrite the document cast and
//! resubmit exactly once. Every other failure is terminal.

use crate::error::{EndpointError, Result, SqllyError};
use crate::execution::endpoint::QueryEndpoint;
use crate::execution::error_classifier::{ErrorClassifier, WireErrorClass};
use crate::model::Row;
use crate::normalizer::{force_document_cast, is_read_only, is_scoped_to, split_statements, Normalizer};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairState {
    Normalized,
    Executing,
    Retrying,
    Succeeded,
    Failed,
}

impl fmt::Display for RepairState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RepairState::Normalized => "Normalized",
            RepairState::Executing => "Executing",
            RepairState::Retrying => "Retrying",
            RepairState::Succeeded => "Succeeded",
            RepairState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Result of a single submission.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Success(Vec<Row>),
    /// Consumed by the loop, never surfaced.
    RecoverableTypeError(EndpointError),
    FatalError(EndpointError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    pub statement: String,
    /// Text actually sent on the final attempt.
    pub sql: String,
    pub rows: Vec<Row>,
    pub attempts: u8,
    pub repaired: bool,
}

/// One statement of a statement set with its terminal result.
#[derive(Debug)]
pub struct StatementRun {
    pub statement: String,
    pub result: Result<ExecutionReport>,
}

pub struct RepairLoop {
    endpoint: Arc<dyn QueryEndpoint>,
    normalizer: Normalizer,
    classifier: ErrorClassifier,
}

impl RepairLoop {
    pub fn new(endpoint: Arc<dyn QueryEndpoint>) -> Self {
        Self {
            endpoint,
            normalizer: Normalizer::new(),
            classifier: ErrorClassifier::new(),
        }
    }

    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    /// Submit once and classify the result.
    pub async fn execute_once(&self, sql: &str) -> ExecutionOutcome {
        match self.endpoint.execute(sql).await {
            Ok(rows) => ExecutionOutcome::Success(rows),
            Err(error) => match self.classifier.classify(&error) {
                WireErrorClass::TypeMismatch => ExecutionOutcome::RecoverableTypeError(error),
                WireErrorClass::Other => ExecutionOutcome::FatalError(error),
            },
        }
    }

    /// Run one statement to a terminal state.
    ///
    /// Non-SELECT statements fail with `DisallowedStatement` and statements that do not
    /// filter on `dataset_id` fail with `UnscopedStatement`; neither reaches the endpoint.
    pub async fn run(&self, statement: &str, dataset_id: &str) -> Result<ExecutionReport> {
        let statement = statement.trim();
        if !is_read_only(statement) {
            warn!("Rejected non-SELECT statement");
            return Err(SqllyError::DisallowedStatement(statement.to_string()));
        }

        let mut sql = self.normalizer.normalize(statement, dataset_id).text;
        if !dataset_id.trim().is_empty() && !is_scoped_to(&sql, dataset_id) {
            warn!(dataset_id, "Statement lacks a dataset filter; not executed");
            return Err(SqllyError::UnscopedStatement {
                statement: statement.to_string(),
                dataset_id: dataset_id.to_string(),
            });
        }

        let mut state = RepairState::Normalized;
        transition(&mut state, RepairState::Executing);
        let mut attempts: u8 = 0;

        loop {
            attempts += 1;
            match self.execute_once(&sql).await {
                ExecutionOutcome::Success(rows) => {
                    let repaired = state == RepairState::Retrying;
                    transition(&mut state, RepairState::Succeeded);
                    info!(attempts, rows = rows.len(), repaired, "Statement succeeded");
                    return Ok(ExecutionReport {
                        statement: statement.to_string(),
                        sql,
                        rows,
                        attempts,
                        repaired,
                    });
                }
                ExecutionOutcome::RecoverableTypeError(error) if state == RepairState::Executing => {
                    warn!(error = %error, "Wire-type mismatch; repairing document cast");
                    sql = force_document_cast(&sql);
                    transition(&mut state, RepairState::Retrying);
                }
                ExecutionOutcome::RecoverableTypeError(error) | ExecutionOutcome::FatalError(error) => {
                    transition(&mut state, RepairState::Failed);
                    warn!(attempts, error = %error, "Statement failed");
                    return Err(SqllyError::ExecutionFailed(error));
                }
            }
        }
    }

    /// Split `query_text` on top-level `;` and run each statement in order.
    pub async fn run_statement_set(&self, query_text: &str, dataset_id: &str) -> Vec<StatementRun> {
        self.run_statements(&split_statements(query_text), dataset_id).await
    }

    /// Run already-split statements in order.
    pub async fn run_statements(&self, statements: &[String], dataset_id: &str) -> Vec<StatementRun> {
        info!(count = statements.len(), "Running statement set");

        let mut runs = Vec::with_capacity(statements.len());
        for statement in statements {
            let result = self.run(statement, dataset_id).await;
            runs.push(StatementRun {
                statement: statement.clone(),
                result,
            });
        }
        runs
    }
}

fn transition(state: &mut RepairState, next: RepairState) {
    debug!("Repair loop {} -> {}", state, next);
    *state = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const FILE: &str = "59037db4-f134-41d6-9cea-931d56278a38";

    /// Replays scripted results and records every statement it receives.
    struct ScriptedEndpoint {
        script: Mutex<VecDeque<std::result::Result<Vec<Row>, EndpointError>>>,
        received: Mutex<Vec<String>>,
    }

    impl ScriptedEndpoint {
        fn new(script: Vec<std::result::Result<Vec<Row>, EndpointError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                received: Mutex::new(Vec::new()),
            })
        }

        fn received(&self) -> Vec<String> {
            self.received.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl QueryEndpoint for ScriptedEndpoint {
        async fn execute(&self, sql: &str) -> std::result::Result<Vec<Row>, EndpointError> {
            self.received.lock().unwrap().push(sql.to_string());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn mismatch() -> EndpointError {
        EndpointError {
            message: "structure of query does not match function result type".to_string(),
            code: Some("42804".to_string()),
            details: Some("Returned type jsonb does not match expected type json in column 1.".to_string()),
            hint: None,
        }
    }

    fn row(value: serde_json::Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn scoped(sql: &str) -> String {
        format!("{} WHERE file_id = '{}'", sql, FILE)
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let endpoint = ScriptedEndpoint::new(vec![Ok(vec![row(json!({"Name": "Ana"}))])]);
        let repair = RepairLoop::new(endpoint.clone());

        let report = repair.run(&scoped("SELECT * FROM csv_data"), FILE).await.unwrap();

        assert_eq!(report.attempts, 1);
        assert!(!report.repaired);
        assert_eq!(report.rows.len(), 1);
        assert_eq!(endpoint.received(), vec![scoped("SELECT row_data::json FROM csv_data")]);
    }

    #[tokio::test]
    async fn test_type_mismatch_repaired_exactly_once() {
        let endpoint = ScriptedEndpoint::new(vec![Err(mismatch()), Ok(vec![row(json!({"Age": 34}))])]);
        let repair = RepairLoop::new(endpoint.clone());

        let report = repair
            .run(&scoped("SELECT row_data::jsonb FROM csv_data"), FILE)
            .await
            .unwrap();

        assert_eq!(report.attempts, 2);
        assert!(report.repaired);
        let received = endpoint.received();
        assert_eq!(received.len(), 2);
        assert_eq!(received[1], scoped("SELECT row_data::json FROM csv_data"));
        assert_eq!(report.sql, received[1]);
    }

    #[tokio::test]
    async fn test_second_mismatch_is_terminal() {
        let endpoint = ScriptedEndpoint::new(vec![Err(mismatch()), Err(mismatch()), Ok(Vec::new())]);
        let repair = RepairLoop::new(endpoint.clone());

        let err = repair.run(&scoped("SELECT row_data FROM csv_data"), FILE).await.unwrap_err();

        assert!(matches!(err, SqllyError::ExecutionFailed(ref e) if e.code.as_deref() == Some("42804")));
        assert_eq!(endpoint.received().len(), 2);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let endpoint = ScriptedEndpoint::new(vec![Err(EndpointError {
            message: "column \"age\" does not exist".to_string(),
            code: Some("42703".to_string()),
            details: None,
            hint: Some("Perhaps you meant row_data->>'Age'".to_string()),
        })]);
        let repair = RepairLoop::new(endpoint.clone());

        let err = repair.run(&scoped("SELECT age FROM csv_data"), FILE).await.unwrap_err();

        match err {
            SqllyError::ExecutionFailed(e) => assert_eq!(e.hint.as_deref(), Some("Perhaps you meant row_data->>'Age'")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(endpoint.received().len(), 1);
    }

    #[tokio::test]
    async fn test_disallowed_and_unscoped_never_reach_endpoint() {
        let endpoint = ScriptedEndpoint::new(vec![]);
        let repair = RepairLoop::new(endpoint.clone());

        let err = repair.run("  DELETE FROM csv_data", FILE).await.unwrap_err();
        assert!(matches!(err, SqllyError::DisallowedStatement(_)));

        let err = repair.run("SELECT row_data FROM csv_data", FILE).await.unwrap_err();
        assert!(matches!(err, SqllyError::UnscopedStatement { .. }));

        assert!(endpoint.received().is_empty());
    }

    #[tokio::test]
    async fn test_statement_set_runs_in_order() {
        let endpoint = ScriptedEndpoint::new(vec![
            Ok(vec![row(json!({"count": 12}))]),
            Ok(vec![row(json!({"avg": 41.5}))]),
        ]);
        let repair = RepairLoop::new(endpoint.clone());
        let text = format!(
            "SELECT count(*) FROM csv_data WHERE file_id = '{0}';\nUPDATE csv_data SET row_index = 0;\nSELECT avg((row_data->>'Age')::numeric) FROM csv_data WHERE file_id = '{0}';",
            FILE
        );

        let runs = repair.run_statement_set(&text, FILE).await;

        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0].result.as_ref().unwrap().rows[0]["count"], 12);
        assert!(matches!(runs[1].result, Err(SqllyError::DisallowedStatement(_))));
        assert_eq!(runs[2].result.as_ref().unwrap().rows[0]["avg"], 41.5);
        assert_eq!(endpoint.received().len(), 2);
    }
}
