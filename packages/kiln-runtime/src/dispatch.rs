//! Experiment dispatch pipeline
//!
//! Turns one queue message into one supervised run: decode and verify the
//! envelope, admit against the resource trackers (dry-run first, then a
//! live reservation), stage artifacts, prepare the virtual environment,
//! render the runner script, supervise the process, upload changed mutable
//! artifacts, and hand every reservation back. A handler error propagates
//! to the queue backing, which nacks or lets visibility lapse so the
//! message redelivers.

use crate::cache::ArtifactCache;
use crate::envelope::{self, Envelope};
use crate::error::{Result, WorkerError};
use crate::executor::Executor;
use crate::keys::SigningKeys;
use crate::queue::QueueTask;
use crate::request::{Request, Resource};
use crate::resources::{AllocRequest, Allocation, Resources};
use crate::storage::ObjectStore;
use crate::units;
use crate::venv::{VenvCache, VenvSpec};
use chrono::Utc;
use kiln_events::{EventEmitter, Report, WorkerEvent};
use rsa::RsaPrivateKey;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Seam between the polling scheduler and the run pipeline
#[async_trait::async_trait]
pub trait Dispatch: Send + Sync {
    async fn handle(
        &self,
        task: QueueTask,
        responder: Option<mpsc::Sender<Report>>,
    ) -> Result<Option<Resource>>;
}

#[async_trait::async_trait]
impl Dispatch for Dispatcher {
    async fn handle(
        &self,
        task: QueueTask,
        responder: Option<mpsc::Sender<Report>>,
    ) -> Result<Option<Resource>> {
        Dispatcher::handle(self, task, responder).await
    }
}

pub struct Dispatcher {
    pub executor_id: String,
    pub resources: Arc<Resources>,
    pub store: Arc<dyn ObjectStore>,
    pub cache: Arc<ArtifactCache>,
    pub venvs: Arc<VenvCache>,
    pub executor: Arc<Executor>,
    /// When present, envelopes must carry a verifiable signature
    pub signing: Option<SigningKeys>,
    /// Private half for sealed payloads
    pub decrypt_key: Option<RsaPrivateKey>,
    pub work_root: PathBuf,
    pub emitter: Option<EventEmitter>,
}

impl Dispatcher {
    /// Handle one pulled message end to end
    pub async fn handle(
        &self,
        task: QueueTask,
        responder: Option<mpsc::Sender<Report>>,
    ) -> Result<Option<Resource>> {
        let request = self.decode(&task)?;
        let resource = request.experiment.resource.clone();
        let group = request.experiment.key.clone();

        // Admission: a dry-run fit first, so hopeless requests bounce
        // before anything is reserved
        let alloc_req = AllocRequest::from_resource(&resource)?;
        if let Err(e) = self.resources.alloc(&alloc_req, &group, false) {
            self.emit(WorkerEvent::ResourcesExhausted {
                experiment_id: group.clone(),
                subscription: task.subscription.clone(),
                detail: e.to_string(),
                timestamp: Utc::now(),
            });
            return Err(e.with("phase", "admission"));
        }
        let allocation = self.resources.alloc(&alloc_req, &group, true)?;

        let outcome = self
            .execute(&task, &request, &allocation, responder)
            .await;

        if let Err(release_err) = self.resources.release(&allocation) {
            log::error!("release after run failed: {}", release_err);
        }

        match outcome {
            Ok(()) => Ok(Some(resource)),
            Err(e) => Err(e),
        }
    }

    /// Decode the raw message into a request, enforcing signatures
    fn decode(&self, task: &QueueTask) -> Result<Request> {
        if !envelope::is_envelope(&task.msg) {
            return Request::from_json(&task.msg);
        }

        let env = Envelope::parse(&task.msg)?;
        if let Some(ref signing) = self.signing {
            let key = signing.select(&task.short_queue_name).map_err(|e| {
                WorkerError::access_denied("no signing key covers queue")
                    .with("queue", &task.short_queue_name)
                    .with_source(e)
            })?;
            if env.message.signature.is_none() {
                return Err(WorkerError::access_denied("unsigned envelope rejected")
                    .with("queue", &task.short_queue_name));
            }
            env.verify(&key)?;
        }
        env.request(self.decrypt_key.as_ref())
    }

    async fn execute(
        &self,
        task: &QueueTask,
        request: &Request,
        allocation: &Allocation,
        responder: Option<mpsc::Sender<Report>>,
    ) -> Result<()> {
        let experiment = &request.experiment;
        let run_key = format!("run-{}", uuid::Uuid::new_v4().simple());
        let run_root = self.work_root.join(&run_key);
        let started = std::time::Instant::now();

        self.emit(WorkerEvent::RunStarted {
            experiment_id: experiment.key.clone(),
            run_id: run_key.clone(),
            subscription: task.subscription.clone(),
            timestamp: Utc::now(),
        });

        for dir in ["_runner", "output", "workspace", "blob-cache", "queue"] {
            std::fs::create_dir_all(run_root.join(dir))?;
        }
        std::fs::create_dir_all(
            run_root.join("artifact-mappings").join(&experiment.key),
        )?;

        for (group, art) in &experiment.artifacts {
            self.cache
                .fetch(self.store.as_ref(), art, group, &run_root)
                .await
                .map_err(|e| e.with("experiment", &experiment.key))?;
        }

        let spec = VenvSpec {
            python_ver: if experiment.python_ver.is_empty() {
                "3".to_string()
            } else {
                experiment.python_ver.clone()
            },
            general: experiment.python_env.clone(),
            configured: request.config.pip.clone(),
        };
        let venv = self.venvs.get_entry(&spec, &run_key).await?;

        let script_path = run_root.join("_runner").join("runner.sh");
        let script = render_runner_script(&venv.root, &run_root, request, allocation);
        std::fs::write(&script_path, script)?;

        let output_path = run_root.join("output").join("output");
        let max_duration = (!experiment.max_duration.is_empty())
            .then(|| units::parse_duration(&experiment.max_duration))
            .transpose()?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let run = self.executor.run_script(
            cancel_rx,
            &script_path,
            &output_path,
            responder,
            &experiment.key,
            &run_key,
        );
        tokio::pin!(run);

        let run_result = match max_duration {
            Some(max) => {
                tokio::select! {
                    result = &mut run => result,
                    _ = tokio::time::sleep(max) => {
                        log::warn!("run {} hit its {}s ceiling", run_key, max.as_secs());
                        let _ = cancel_tx.send(true);
                        run.await
                    }
                }
            }
            None => run.await,
        };
        drop(cancel_tx);

        // Mutable results go back even when the run failed; the output
        // artifact is usually the only way to debug the failure
        let mut restore_result: Result<()> = Ok(());
        for (group, art) in request.mutable_artifacts() {
            match self
                .cache
                .restore(self.store.as_ref(), art, group, &run_root)
                .await
            {
                Ok(true) => self.emit(WorkerEvent::ArtifactUploaded {
                    experiment_id: experiment.key.clone(),
                    group: group.clone(),
                    bytes: 0,
                    timestamp: Utc::now(),
                }),
                Ok(false) => {}
                Err(e) => {
                    if restore_result.is_ok() {
                        restore_result = Err(e.with("group", group));
                    }
                }
            }
        }

        self.venvs.remove_client(&venv, &run_key);

        match &run_result {
            Ok(()) => self.emit(WorkerEvent::RunFinished {
                experiment_id: experiment.key.clone(),
                run_id: run_key.clone(),
                exit_code: 0,
                duration_secs: started.elapsed().as_secs(),
                timestamp: Utc::now(),
            }),
            Err(e) => self.emit(WorkerEvent::RunFailed {
                experiment_id: experiment.key.clone(),
                run_id: run_key.clone(),
                error: e.to_string(),
                timestamp: Utc::now(),
            }),
        }

        run_result.and(restore_result)
    }

    fn emit(&self, event: WorkerEvent) {
        if let Some(ref emitter) = self.emitter {
            emitter.emit(event);
        }
    }
}

/// Render the per-run bash entry point
///
/// The script activates the cached venv, exports the submission and
/// allocation environment, and `exec`s the experiment so its exit code and
/// signals are the run's own.
fn render_runner_script(
    venv_root: &Path,
    run_root: &Path,
    request: &Request,
    allocation: &Allocation,
) -> String {
    let mut env: HashMap<String, String> = request.config.env.clone();
    env.extend(allocation.env());

    let mut lines = vec![
        "#!/bin/bash".to_string(),
        "set -e".to_string(),
        String::new(),
    ];

    let mut keys: Vec<_> = env.keys().collect();
    keys.sort();
    for key in keys {
        lines.push(format!("export {}={}", key, shell_quote(&env[key])));
    }

    lines.push(format!("source {}/bin/activate", shell_quote_path(venv_root)));
    lines.push(format!(
        "cd {}",
        shell_quote_path(&run_root.join("workspace"))
    ));

    let mut command = vec![
        "exec".to_string(),
        "python".to_string(),
        shell_quote(&request.experiment.filename),
    ];
    command.extend(request.experiment.args.iter().map(|a| shell_quote(a)));
    lines.push(command.join(" "));
    lines.push(String::new());
    lines.join("\n")
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

fn shell_quote_path(path: &Path) -> String {
    shell_quote(&path.to_string_lossy())
}
