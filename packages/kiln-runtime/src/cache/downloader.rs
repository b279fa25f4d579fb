//! Single-flight object downloader
//!
//! At most one download runs per cache key. The first caller becomes the
//! leader and drives the transfer into `<root>/.partial/<key>`; on success
//! the partial file is renamed atomically to `<root>/<key>`, on failure it
//! is removed. Every concurrent caller waits on the same completion marker
//! and observes the same outcome.

use crate::error::{Result, WorkerError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

struct Entry {
    final_path: PathBuf,
    partial_path: PathBuf,
    done_rx: watch::Receiver<bool>,
    done_tx: Mutex<Option<watch::Sender<bool>>>,
    outcome: Mutex<Option<std::result::Result<(), String>>>,
    warnings: Mutex<Vec<String>>,
}

pub struct Downloader {
    root: PathBuf,
    entries: Mutex<HashMap<String, Arc<Entry>>>,
}

impl Downloader {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join(".partial"))?;
        Ok(Downloader {
            root,
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Path the finished object for `key` lives at
    pub fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Fetch `key`, downloading at most once across concurrent callers
    ///
    /// `download` receives the partial path and must leave the complete
    /// object there; only the leading caller's closure runs.
    pub async fn fetch<F, Fut>(&self, key: &str, download: F) -> Result<PathBuf>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let final_path = self.object_path(key);
        if final_path.exists() {
            return Ok(final_path);
        }

        let (entry, leader) = {
            let mut entries = self.entries.lock();
            match entries.get(key) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let (done_tx, done_rx) = watch::channel(false);
                    let entry = Arc::new(Entry {
                        final_path: final_path.clone(),
                        partial_path: self.root.join(".partial").join(key),
                        done_rx,
                        done_tx: Mutex::new(Some(done_tx)),
                        outcome: Mutex::new(None),
                        warnings: Mutex::new(Vec::new()),
                    });
                    entries.insert(key.to_string(), entry.clone());
                    (entry, true)
                }
            }
        };

        if leader {
            self.lead(key, &entry, download).await;
        } else {
            let mut done = entry.done_rx.clone();
            while !*done.borrow() {
                if done.changed().await.is_err() {
                    break;
                }
            }
        }

        let outcome = entry.outcome.lock().clone();
        match outcome {
            Some(Ok(())) => Ok(entry.final_path.clone()),
            Some(Err(cause)) => Err(WorkerError::io("download failed")
                .with("key", key)
                .with("cause", cause)),
            None => Err(WorkerError::fatal("download finished without outcome").with("key", key)),
        }
    }

    async fn lead<F, Fut>(&self, key: &str, entry: &Arc<Entry>, download: F)
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let result = download(entry.partial_path.clone()).await;

        let outcome = match result {
            Ok(()) => std::fs::rename(&entry.partial_path, &entry.final_path)
                .map_err(|e| format!("publish rename failed: {}", e)),
            Err(e) => Err(e.to_string()),
        };

        if outcome.is_err() {
            if entry.partial_path.exists() {
                if let Err(e) = std::fs::remove_file(&entry.partial_path) {
                    log::warn!("partial cleanup for {} failed: {}", key, e);
                }
            }
            // Failed keys leave the table so a later caller can retry
            self.entries.lock().remove(key);
        }

        *entry.outcome.lock() = Some(outcome);
        if let Some(done_tx) = entry.done_tx.lock().take() {
            let _ = done_tx.send(true);
        }
    }

    /// Attach a non-fatal warning to an in-flight or finished key
    pub fn warn(&self, key: &str, message: impl Into<String>) {
        if let Some(entry) = self.entries.lock().get(key) {
            entry.warnings.lock().push(message.into());
        }
    }

    pub fn warnings(&self, key: &str) -> Vec<String> {
        self.entries
            .lock()
            .get(key)
            .map(|e| e.warnings.lock().clone())
            .unwrap_or_default()
    }
}
