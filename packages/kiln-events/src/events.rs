use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Core worker event types - structured, queryable alternatives to logs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum WorkerEvent {
    // Run Lifecycle
    RunStarted {
        experiment_id: String,
        run_id: String,
        subscription: String,
        timestamp: DateTime<Utc>,
    },

    RunFinished {
        experiment_id: String,
        run_id: String,
        exit_code: i32,
        duration_secs: u64,
        timestamp: DateTime<Utc>,
    },

    RunFailed {
        experiment_id: String,
        run_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },

    // Python Environment Lifecycle
    VenvBuilt {
        venv_id: String,
        python_ver: String,
        build_secs: u64,
        timestamp: DateTime<Utc>,
    },

    VenvBuildFailed {
        venv_id: String,
        python_ver: String,
        error: String,
        timestamp: DateTime<Utc>,
    },

    // Host Resources
    ResourcesExhausted {
        experiment_id: String,
        subscription: String,
        detail: String,
        timestamp: DateTime<Utc>,
    },

    GpuEccFailure {
        device_uuid: String,
        detail: String,
        timestamp: DateTime<Utc>,
    },

    // Queue Health
    QueueError {
        subscription: String,
        error: String,
        timestamp: DateTime<Utc>,
    },

    SubscriptionBackoff {
        subscription: String,
        backoff_secs: u64,
        consecutive_failures: u32,
        timestamp: DateTime<Utc>,
    },

    // Artifact Movement
    ArtifactUploaded {
        experiment_id: String,
        group: String,
        bytes: u64,
        timestamp: DateTime<Utc>,
    },
}

impl WorkerEvent {
    /// Stable snake_case name of the event variant
    pub fn event_type(&self) -> &'static str {
        match self {
            WorkerEvent::RunStarted { .. } => "run_started",
            WorkerEvent::RunFinished { .. } => "run_finished",
            WorkerEvent::RunFailed { .. } => "run_failed",
            WorkerEvent::VenvBuilt { .. } => "venv_built",
            WorkerEvent::VenvBuildFailed { .. } => "venv_build_failed",
            WorkerEvent::ResourcesExhausted { .. } => "resources_exhausted",
            WorkerEvent::GpuEccFailure { .. } => "gpu_ecc_failure",
            WorkerEvent::QueueError { .. } => "queue_error",
            WorkerEvent::SubscriptionBackoff { .. } => "subscription_backoff",
            WorkerEvent::ArtifactUploaded { .. } => "artifact_uploaded",
        }
    }

    /// Identifier of the entity this event is primarily about
    pub fn primary_id(&self) -> String {
        match self {
            WorkerEvent::RunStarted { run_id, .. }
            | WorkerEvent::RunFinished { run_id, .. }
            | WorkerEvent::RunFailed { run_id, .. } => run_id.clone(),
            WorkerEvent::VenvBuilt { venv_id, .. }
            | WorkerEvent::VenvBuildFailed { venv_id, .. } => venv_id.clone(),
            WorkerEvent::ResourcesExhausted { experiment_id, .. }
            | WorkerEvent::ArtifactUploaded { experiment_id, .. } => experiment_id.clone(),
            WorkerEvent::GpuEccFailure { device_uuid, .. } => device_uuid.clone(),
            WorkerEvent::QueueError { subscription, .. }
            | WorkerEvent::SubscriptionBackoff { subscription, .. } => subscription.clone(),
        }
    }

    /// When the event happened
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            WorkerEvent::RunStarted { timestamp, .. }
            | WorkerEvent::RunFinished { timestamp, .. }
            | WorkerEvent::RunFailed { timestamp, .. }
            | WorkerEvent::VenvBuilt { timestamp, .. }
            | WorkerEvent::VenvBuildFailed { timestamp, .. }
            | WorkerEvent::ResourcesExhausted { timestamp, .. }
            | WorkerEvent::GpuEccFailure { timestamp, .. }
            | WorkerEvent::QueueError { timestamp, .. }
            | WorkerEvent::SubscriptionBackoff { timestamp, .. }
            | WorkerEvent::ArtifactUploaded { timestamp, .. } => *timestamp,
        }
    }

    /// Whether the event describes a failure
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            WorkerEvent::RunFailed { .. }
                | WorkerEvent::VenvBuildFailed { .. }
                | WorkerEvent::GpuEccFailure { .. }
                | WorkerEvent::QueueError { .. }
        )
    }
}
