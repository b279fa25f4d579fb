/*!
# Kiln Events

Structured observability for the kiln worker. Instead of scraping free-form
logs, worker components emit typed events that are forwarded to the response
queue of the run that produced them, where schedulers and dashboards can
query them.

## Architecture

```text
Worker Components → EventEmitter → Report channel → Queue responder
```

## Usage

```rust,no_run
use kiln_events::{EventEmitter, WorkerEvent, Report};
use chrono::Utc;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() {
    let (tx, _rx) = mpsc::channel::<Report>(64);
    let emitter = EventEmitter::new(tx, "worker-001".to_string());

    emitter.emit(WorkerEvent::RunStarted {
        experiment_id: "expt-42".to_string(),
        run_id: "run-7f3a".to_string(),
        subscription: "local_test".to_string(),
        timestamp: Utc::now(),
    });
}
```

## Event Types

- **Run Lifecycle**: RunStarted, RunFinished, RunFailed
- **Environment**: VenvBuilt, VenvBuildFailed
- **Resources**: ResourcesExhausted, GpuEccFailure
- **Queues**: QueueError, SubscriptionBackoff
*/

pub mod emitter;
pub mod events;
pub mod report;

pub use emitter::EventEmitter;
pub use events::WorkerEvent;
pub use report::{Report, ReportPayload, Severity};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_exports() {
        // Ensure all public types are accessible
        let _event: Option<WorkerEvent> = None;
        let _severity = Severity::Info;
    }
}
