//! Conversion Logger
//!
//! Subscriber setup and the per-request conversion record.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Install the global `tracing` subscriber. `RUST_LOG` overrides the `info` default.
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionStatus {
    Converted,
    Executed,
    Rejected,
    Failed,
    Cancelled,
}

/// One structured record per conversion request.
#[derive(Debug, Clone, Serialize)]
pub struct ConversionLog {
    pub request_id: String,
    pub dataset_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub is_analytical: bool,
    pub statement_count: usize,
    pub repaired_count: usize,
    pub status: ConversionStatus,
    pub error_message: Option<String>,
}

impl ConversionLog {
    pub fn start(dataset_id: Option<&str>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            dataset_id: dataset_id.map(str::to_string),
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: 0,
            is_analytical: false,
            statement_count: 0,
            repaired_count: 0,
            status: ConversionStatus::Converted,
            error_message: None,
        }
    }

    /// Close the record and emit it as a `conversion` event.
    pub fn finish(mut self, status: ConversionStatus, error: Option<String>) -> Self {
        let now = Utc::now();
        self.duration_ms = (now - self.started_at).num_milliseconds().max(0) as u64;
        self.finished_at = Some(now);
        self.status = status;
        self.error_message = error;

        let record = serde_json::to_string(&self).unwrap_or_default();
        match self.status {
            ConversionStatus::Failed | ConversionStatus::Rejected => warn!(
                target: "conversion",
                request_id = %self.request_id,
                status = ?self.status,
                duration_ms = self.duration_ms,
                "{}",
                record
            ),
            _ => info!(
                target: "conversion",
                request_id = %self.request_id,
                status = ?self.status,
                duration_ms = self.duration_ms,
                "{}",
                record
            ),
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversion_log_lifecycle() {
        let log = ConversionLog::start(Some("abc"));
        assert!(Uuid::parse_str(&log.request_id).is_ok());
        assert!(log.finished_at.is_none());

        let done = log.finish(ConversionStatus::Failed, Some("Agent unavailable".to_string()));
        assert_eq!(done.status, ConversionStatus::Failed);
        assert!(done.finished_at.unwrap() >= done.started_at);

        let value = serde_json::to_value(&done).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["dataset_id"], "abc");
    }

    #[test]
    fn test_request_ids_are_unique() {
        assert_ne!(ConversionLog::start(None).request_id, ConversionLog::start(None).request_id);
    }
}
