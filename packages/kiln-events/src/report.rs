//! Wire records published on a run's response queue
//!
//! Every report carries the producing worker, the run and experiment it
//! belongs to, and a payload union. Serialization is the canonical JSON
//! form consumed by the response-queue listeners.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Log severity carried by `logging` payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Error,
}

/// Payload union of a report
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportPayload {
    /// A single line of experiment or worker output
    Logging {
        severity: Severity,
        message: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        fields: HashMap<String, String>,
    },
    /// Lifecycle progress of the run that owns the response queue
    Progress {
        state: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
}

/// A single response-queue record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub time: DateTime<Utc>,
    pub executor_id: String,
    pub unique_id: String,
    pub experiment_id: String,
    pub payload: ReportPayload,
}

impl Report {
    /// Build a logging report for one output line
    pub fn logging(
        executor_id: &str,
        unique_id: &str,
        experiment_id: &str,
        severity: Severity,
        message: &str,
    ) -> Self {
        Report {
            time: Utc::now(),
            executor_id: executor_id.to_string(),
            unique_id: unique_id.to_string(),
            experiment_id: experiment_id.to_string(),
            payload: ReportPayload::Logging {
                severity,
                message: message.to_string(),
                fields: HashMap::new(),
            },
        }
    }

    /// Build a progress report for a run state transition
    pub fn progress(
        executor_id: &str,
        unique_id: &str,
        experiment_id: &str,
        state: &str,
        exit_code: Option<i32>,
    ) -> Self {
        Report {
            time: Utc::now(),
            executor_id: executor_id.to_string(),
            unique_id: unique_id.to_string(),
            experiment_id: experiment_id.to_string(),
            payload: ReportPayload::Progress {
                state: state.to_string(),
                exit_code,
            },
        }
    }

    /// Attach a structured field to a logging payload, no-op otherwise
    pub fn with_field(mut self, key: &str, value: &str) -> Self {
        if let ReportPayload::Logging { ref mut fields, .. } = self.payload {
            fields.insert(key.to_string(), value.to_string());
        }
        self
    }

    /// Canonical JSON form placed on the wire
    pub fn to_wire(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
