use crate::agent::transport::{AgentChatRequest, AgentContext, AgentTransport, AGENT_INSTRUCTIONS};
use crate::config::{AgentConfig, RetryPolicy, DEFAULT_AGENT_NAME};
use crate::error::{Result, SqllyError};
use crate::model::{AgentReply, Row, SchemaDescriptor};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Agent client with bounded, sequential retries.
#[derive(Clone)]
pub struct AgentClient {
    transport: Arc<dyn AgentTransport>,
    agent_name: String,
    retry: RetryPolicy,
}

impl AgentClient {
    pub fn new(transport: Arc<dyn AgentTransport>, agent_name: String, retry: RetryPolicy) -> Self {
        Self {
            transport,
            agent_name,
            retry,
        }
    }

    pub fn from_config(config: &AgentConfig, transport: Arc<dyn AgentTransport>) -> Self {
        Self::new(transport, config.agent_name.clone(), config.retry)
    }

    /// Default agent name and retry policy.
    pub fn with_transport(transport: Arc<dyn AgentTransport>) -> Self {
        Self::new(transport, DEFAULT_AGENT_NAME.to_string(), RetryPolicy::default())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Send one conversion request.
    ///
    /// A blank prompt or absent schema/sample rows is a precondition failure and is
    /// never retried. Transport errors and non-2xx replies are retried until
    /// `max_attempts`; the last error is then returned as `AgentUnavailable`.
    pub async fn send(
        &self,
        prompt: &str,
        schema: Option<&SchemaDescriptor>,
        sample_rows: Option<&[Row]>,
        dataset_id: Option<&str>,
    ) -> Result<AgentReply> {
        let mut missing = Vec::new();
        if prompt.trim().is_empty() {
            missing.push("prompt".to_string());
        }
        if schema.is_none() {
            missing.push("schema".to_string());
        }
        if sample_rows.is_none() {
            missing.push("sampleRows".to_string());
        }
        let (Some(schema), Some(sample_rows)) = (schema, sample_rows) else {
            return Err(SqllyError::ConfigurationMissing(missing));
        };
        if !missing.is_empty() {
            return Err(SqllyError::ConfigurationMissing(missing));
        }

        let request = AgentChatRequest {
            agent: self.agent_name.clone(),
            instructions: AGENT_INSTRUCTIONS.to_string(),
            input: prompt.to_string(),
            context: AgentContext {
                schema: schema.clone(),
                sample_rows: sample_rows.to_vec(),
                file_id: dataset_id.map(str::to_string),
            },
        };

        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=max_attempts {
            debug!("Agent attempt {} of {}", attempt, max_attempts);
            match self.transport.post_chat(&request).await {
                Ok(raw_text) => {
                    info!(attempt, reply_len = raw_text.len(), "Agent replied");
                    return Ok(AgentReply { raw_text });
                }
                Err(e) => {
                    warn!(attempt, max_attempts, error = %e, "Agent call failed");
                    last_error = e.to_string();
                    if attempt < max_attempts {
                        let delay = self.retry.delay_for(attempt);
                        debug!("Retrying agent call in {:?}", delay);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(SqllyError::AgentUnavailable {
            attempts: max_attempts,
            last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::Instant;

    /// Fails the first `failures` calls, then answers.
    struct FlakyTransport {
        failures: u32,
        calls: Mutex<Vec<Instant>>,
    }

    impl FlakyTransport {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn call_times(&self) -> Vec<Instant> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AgentTransport for FlakyTransport {
        async fn post_chat(&self, request: &AgentChatRequest) -> Result<String> {
            let attempt = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(Instant::now());
                calls.len() as u32
            };
            if attempt <= self.failures {
                Err(SqllyError::Agent(format!("Agent API error (503): attempt {}", attempt)))
            } else {
                Ok(format!("reply to {}", request.input))
            }
        }
    }

    fn schema() -> SchemaDescriptor {
        SchemaDescriptor::new()
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_third_attempt() {
        let transport = Arc::new(FlakyTransport::new(2));
        let client = AgentClient::with_transport(transport.clone());

        let reply = client
            .send("how many rows", Some(&schema()), Some(&[]), None)
            .await
            .unwrap();

        assert_eq!(reply.raw_text, "reply to how many rows");
        assert_eq!(transport.call_times().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_report_agent_unavailable() {
        let transport = Arc::new(FlakyTransport::new(u32::MAX));
        let client = AgentClient::with_transport(transport.clone());

        let err = client
            .send("how many rows", Some(&schema()), Some(&[]), None)
            .await
            .unwrap_err();

        match err {
            SqllyError::AgentUnavailable { attempts, last_error } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("attempt 3"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let times = transport.call_times();
        assert_eq!(times.len(), 3);
        let first_gap = times[1] - times[0];
        let second_gap = times[2] - times[1];
        assert!(first_gap >= Duration::from_millis(300) && first_gap < Duration::from_millis(350));
        assert!(second_gap >= Duration::from_millis(600) && second_gap < Duration::from_millis(650));
    }

    #[tokio::test]
    async fn test_missing_context_is_not_retried() {
        let transport = Arc::new(FlakyTransport::new(0));
        let client = AgentClient::with_transport(transport.clone());

        let err = client.send("  ", None, Some(&[]), None).await.unwrap_err();

        assert!(matches!(err, SqllyError::ConfigurationMissing(ref v) if v == &["prompt", "schema"]));
        assert!(transport.call_times().is_empty());
    }
}
