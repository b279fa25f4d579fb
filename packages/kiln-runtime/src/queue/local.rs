//! Local-directory queue backing
//!
//! The root directory holds one sub-directory per queue; every message is a
//! file consumed oldest-modification-time first. A `lock.lock` sentinel file
//! serializes pulls across worker processes sharing the directory, with a
//! ten-second acquisition timeout. Responses land in a sibling
//! `<queue>_responses` directory, one file per report.

use super::{subscription_matches, QueueTask, TaskHandler, TaskQueue};
use crate::envelope;
use crate::error::{Result, WorkerError};
use crate::request::Resource;
use async_trait::async_trait;
use kiln_events::Report;
use regex::Regex;
use rsa::RsaPublicKey;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::time::Instant;

const LOCK_NAME: &str = "lock.lock";
const LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const LOCK_RETRY: Duration = Duration::from_millis(50);
const RESPONSE_SUFFIX: &str = "_responses";

pub struct LocalQueue {
    root: PathBuf,
    project: String,
    publish_seq: AtomicU64,
}

impl LocalQueue {
    pub fn new(root: impl Into<PathBuf>, project: impl Into<String>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(LocalQueue {
            root,
            project: project.into(),
            publish_seq: AtomicU64::new(0),
        })
    }

    fn queue_dir(&self, subscription: &str) -> PathBuf {
        self.root.join(subscription)
    }

    /// Drop a message file into a queue, creating the queue on first use
    pub fn publish(&self, queue: &str, body: &[u8]) -> Result<()> {
        let dir = self.queue_dir(queue);
        std::fs::create_dir_all(&dir)?;
        let seq = self.publish_seq.fetch_add(1, Ordering::SeqCst);
        let stamp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default();
        let name = format!("msg-{:017}-{:06}", stamp.as_nanos() / 1_000, seq);
        std::fs::write(dir.join(name), body)?;
        Ok(())
    }

    /// Message files oldest first, `(mtime, name)` ordered
    fn pending(dir: &Path) -> Result<Vec<(SystemTime, PathBuf)>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if name.to_string_lossy() == LOCK_NAME {
                continue;
            }
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            files.push((meta.modified()?, entry.path()));
        }
        files.sort();
        Ok(files)
    }

    async fn acquire_lock(dir: &Path) -> Result<LockGuard> {
        let lock = dir.join(LOCK_NAME);
        let deadline = Instant::now() + LOCK_TIMEOUT;
        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock)
            {
                Ok(_) => return Ok(LockGuard { path: lock }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        return Err(WorkerError::io("queue lock acquisition timed out")
                            .with("lock", lock.display()));
                    }
                    tokio::time::sleep(LOCK_RETRY).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            log::warn!("queue lock release failed for {}: {}", self.path.display(), e);
        }
    }
}

#[async_trait]
impl TaskQueue for LocalQueue {
    async fn refresh(
        &self,
        matcher: Option<&Regex>,
        mismatcher: Option<&Regex>,
    ) -> Result<HashMap<String, String>> {
        let mut found = HashMap::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.metadata()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(RESPONSE_SUFFIX) {
                continue;
            }
            if subscription_matches(&name, matcher, mismatcher) {
                found.insert(name, entry.path().display().to_string());
            }
        }
        Ok(found)
    }

    async fn exists(&self, subscription: &str) -> Result<bool> {
        Ok(self.queue_dir(subscription).is_dir())
    }

    async fn has_work(&self, subscription: &str) -> Result<bool> {
        let dir = self.queue_dir(subscription);
        if !dir.is_dir() {
            return Ok(false);
        }
        Ok(!Self::pending(&dir)?.is_empty())
    }

    async fn work(
        &self,
        subscription: &str,
        handler: &TaskHandler,
    ) -> Result<(bool, Option<Resource>)> {
        let dir = self.queue_dir(subscription);
        if !dir.is_dir() {
            return Err(
                WorkerError::not_found("queue directory missing").with("queue", subscription)
            );
        }

        // Pull exactly one file under the sentinel lock
        let (body, consumed_path) = {
            let _lock = Self::acquire_lock(&dir).await?;
            let Some((_, path)) = Self::pending(&dir)?.into_iter().next() else {
                return Ok((false, None));
            };
            let body = std::fs::read(&path)?;
            std::fs::remove_file(&path)?;
            (body, path)
        };

        let task = QueueTask {
            project: self.project.clone(),
            queue_type: "local",
            subscription: subscription.to_string(),
            short_queue_name: subscription.to_string(),
            credentials: dir.display().to_string(),
            msg: body.clone(),
            response_queue: Some(format!("{}{}", subscription, RESPONSE_SUFFIX)),
        };

        match handler(task).await {
            Ok(resource) => Ok((true, resource)),
            Err(e) => {
                // Requeue so the message is not lost; it re-enters at the back
                if let Err(requeue_err) = std::fs::write(&consumed_path, &body) {
                    log::error!(
                        "requeue of {} failed, message dropped: {}",
                        consumed_path.display(),
                        requeue_err
                    );
                }
                Err(e)
            }
        }
    }

    fn responder(
        &self,
        subscription: &str,
        seal_key: Option<RsaPublicKey>,
    ) -> Result<mpsc::Sender<Report>> {
        let dir = self.root.join(format!("{}{}", subscription, RESPONSE_SUFFIX));
        std::fs::create_dir_all(&dir)?;

        let (tx, mut rx) = mpsc::channel::<Report>(64);
        tokio::spawn(async move {
            let mut seq = 0u64;
            while let Some(report) = rx.recv().await {
                let wire = match render_report(&report, seal_key.as_ref()) {
                    Ok(wire) => wire,
                    Err(e) => {
                        log::error!("response render failed: {}", e);
                        continue;
                    }
                };
                seq += 1;
                let name = format!("report-{:016}-{:06}", report.time.timestamp_micros(), seq);
                if let Err(e) = std::fs::write(dir.join(name), wire) {
                    log::error!("response write failed: {}", e);
                }
            }
        });
        Ok(tx)
    }
}

/// Canonical JSON, hybrid-sealed when a key is present
fn render_report(report: &Report, seal_key: Option<&RsaPublicKey>) -> Result<String> {
    let wire = report
        .to_wire()
        .map_err(|e| WorkerError::malformed("report encode failed").with_source(e))?;
    match seal_key {
        Some(key) => envelope::hybrid_seal(wire.as_bytes(), key),
        None => Ok(wire),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::Arc;

    fn collect_handler() -> (TaskHandler, Arc<parking_lot::Mutex<Vec<Vec<u8>>>>) {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: TaskHandler = Arc::new(move |task: QueueTask| {
            let sink = sink.clone();
            async move {
                sink.lock().push(task.msg);
                Ok(None)
            }
            .boxed()
        });
        (handler, seen)
    }

    #[tokio::test]
    async fn test_fifo_consumption_and_idle() {
        let root = tempfile::tempdir().unwrap();
        let queue = LocalQueue::new(root.path(), "proj").unwrap();

        for (i, body) in [b"m1", b"m2", b"m3"].iter().enumerate() {
            queue.publish("local_jobs", *body).unwrap();
            // Distinct mtimes keep the ordering honest even on coarse clocks
            std::thread::sleep(Duration::from_millis(30 + i as u64));
        }

        let (handler, seen) = collect_handler();
        for _ in 0..3 {
            let (processed, _) = queue.work("local_jobs", &handler).await.unwrap();
            assert!(processed);
        }
        assert_eq!(*seen.lock(), vec![b"m1".to_vec(), b"m2".to_vec(), b"m3".to_vec()]);

        assert!(!queue.has_work("local_jobs").await.unwrap());
        let (processed, _) = queue.work("local_jobs", &handler).await.unwrap();
        assert!(!processed);
    }

    #[tokio::test]
    async fn test_refresh_lists_queue_dirs_only() {
        let root = tempfile::tempdir().unwrap();
        let queue = LocalQueue::new(root.path(), "proj").unwrap();
        queue.publish("local_alpha", b"x").unwrap();
        queue.publish("local_beta", b"x").unwrap();
        std::fs::create_dir(root.path().join("local_alpha_responses")).unwrap();
        std::fs::write(root.path().join("stray-file"), b"x").unwrap();

        let matcher = Regex::new(r"^local_.*$").unwrap();
        let found = queue.refresh(Some(&matcher), None).await.unwrap();
        let mut names: Vec<_> = found.keys().cloned().collect();
        names.sort();
        assert_eq!(names, vec!["local_alpha", "local_beta"]);

        assert!(queue.exists("local_alpha").await.unwrap());
        assert!(!queue.exists("local_gamma").await.unwrap());
    }

    #[tokio::test]
    async fn test_handler_failure_requeues() {
        let root = tempfile::tempdir().unwrap();
        let queue = LocalQueue::new(root.path(), "proj").unwrap();
        queue.publish("local_jobs", b"fragile").unwrap();

        let failing: TaskHandler = Arc::new(|_task| {
            async { Err(WorkerError::io("handler blew up")) }.boxed()
        });
        let err = queue.work("local_jobs", &failing).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Io);

        // Message is back and consumable
        assert!(queue.has_work("local_jobs").await.unwrap());
        let (handler, seen) = collect_handler();
        let (processed, _) = queue.work("local_jobs", &handler).await.unwrap();
        assert!(processed);
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_lock_times_out() {
        let root = tempfile::tempdir().unwrap();
        let queue = LocalQueue::new(root.path(), "proj").unwrap();
        queue.publish("local_jobs", b"m").unwrap();

        // Simulate another worker dying while holding the sentinel
        std::fs::write(root.path().join("local_jobs").join(LOCK_NAME), b"").unwrap();

        tokio::time::pause();
        let (handler, _) = collect_handler();
        let pull = queue.work("local_jobs", &handler);
        let err = pull.await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Io);
    }

    #[tokio::test]
    async fn test_responder_writes_report_files() {
        let root = tempfile::tempdir().unwrap();
        let queue = LocalQueue::new(root.path(), "proj").unwrap();

        let tx = queue.responder("local_jobs", None).unwrap();
        tx.send(Report::logging(
            "worker-1",
            "run-1",
            "expt-1",
            kiln_events::Severity::Info,
            "epoch 1/3",
        ))
        .await
        .unwrap();

        // Give the forwarder a moment to land the file
        tokio::time::sleep(Duration::from_millis(100)).await;
        let dir = root.path().join("local_jobs_responses");
        let files: Vec<_> = std::fs::read_dir(&dir).unwrap().collect();
        assert_eq!(files.len(), 1);
        let content =
            std::fs::read_to_string(files[0].as_ref().unwrap().path()).unwrap();
        assert!(content.contains("epoch 1/3"));
    }
}
