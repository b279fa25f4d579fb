use crate::events::WorkerEvent;
use crate::report::{Report, ReportPayload, Severity};
use tokio::sync::mpsc;

/// Event emitter that forwards worker events onto a report channel
///
/// `emit` never blocks and never fails the caller: a full or closed sink is
/// logged and dropped so event emission can sit on critical worker paths.
#[derive(Clone)]
pub struct EventEmitter {
    tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl EventEmitter {
    /// Create a new emitter forwarding into `sink`
    pub fn new(sink: mpsc::Sender<Report>, executor_id: String) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        // Spawn background worker to process events
        tokio::spawn(async move {
            event_worker(sink, rx, executor_id).await;
        });

        EventEmitter { tx }
    }

    /// Emit an event (non-blocking)
    pub fn emit(&self, event: WorkerEvent) {
        if let Err(e) = self.tx.send(event) {
            log::error!("Failed to emit event: {}", e);
        }
    }

    /// Emit multiple events
    pub fn emit_batch(&self, events: Vec<WorkerEvent>) {
        for event in events {
            self.emit(event);
        }
    }
}

/// Background worker that converts events into reports
async fn event_worker(
    sink: mpsc::Sender<Report>,
    mut rx: mpsc::UnboundedReceiver<WorkerEvent>,
    executor_id: String,
) {
    log::debug!("Event worker started for {}", executor_id);

    while let Some(event) = rx.recv().await {
        let report = report_for(&executor_id, &event);
        if sink.send(report).await.is_err() {
            log::warn!("Report sink closed, stopping event worker");
            break;
        }
    }

    log::debug!("Event worker stopped for {}", executor_id);
}

/// Render an event as a report record
fn report_for(executor_id: &str, event: &WorkerEvent) -> Report {
    let severity = if event.is_failure() {
        Severity::Error
    } else {
        Severity::Info
    };

    let message = match serde_json::to_string(event) {
        Ok(json) => json,
        Err(e) => format!("unserializable event {}: {}", event.event_type(), e),
    };

    Report {
        time: event.timestamp(),
        executor_id: executor_id.to_string(),
        unique_id: event.primary_id(),
        experiment_id: experiment_of(event),
        payload: ReportPayload::Logging {
            severity,
            message,
            fields: [("event_type".to_string(), event.event_type().to_string())]
                .into_iter()
                .collect(),
        },
    }
}

fn experiment_of(event: &WorkerEvent) -> String {
    match event {
        WorkerEvent::RunStarted { experiment_id, .. }
        | WorkerEvent::RunFinished { experiment_id, .. }
        | WorkerEvent::RunFailed { experiment_id, .. }
        | WorkerEvent::ResourcesExhausted { experiment_id, .. }
        | WorkerEvent::ArtifactUploaded { experiment_id, .. } => experiment_id.clone(),
        _ => String::new(),
    }
}
