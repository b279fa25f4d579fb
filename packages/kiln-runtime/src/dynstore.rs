//! Filesystem-watched key/value collections
//!
//! A `DynStore` polls one directory and maintains a name-to-value map from
//! its files: every regular file (or symlink to one) whose name does not
//! start with `.` and is not `info` is fed through an extractor whenever its
//! modification time changes at one-second granularity. Files that vanish
//! are dropped from the collection. Observers can await the completion of
//! the next full pass.
//!
//! Signing-key and response-key stores compose this with their extractors
//! (see `keys`).

use crate::error::{ErrorSink, Result, WorkerError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, UNIX_EPOCH};
use tokio::sync::watch;

/// How often an unreadable directory is surfaced on the error channel
const UNREADABLE_THROTTLE: Duration = Duration::from_secs(15 * 60);

type Extractor<V> = dyn Fn(&[u8]) -> Result<V> + Send + Sync;

struct Tracked<V> {
    value: V,
    mtime_secs: u64,
}

struct Inner<V> {
    dir: PathBuf,
    entries: Mutex<HashMap<String, Tracked<V>>>,
    refresh_tx: watch::Sender<u64>,
}

/// Handle to a watched collection; cheap to clone
pub struct DynStore<V: Clone + Send + 'static> {
    inner: Arc<Inner<V>>,
}

impl<V: Clone + Send + 'static> Clone for DynStore<V> {
    fn clone(&self) -> Self {
        DynStore {
            inner: self.inner.clone(),
        }
    }
}

impl<V: Clone + Send + 'static> DynStore<V> {
    /// Start watching `dir`, refreshing every `period`
    pub fn start(
        dir: impl Into<PathBuf>,
        extractor: Arc<Extractor<V>>,
        period: Duration,
        errors: ErrorSink,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (refresh_tx, _) = watch::channel(0u64);
        let inner = Arc::new(Inner {
            dir: dir.into(),
            entries: Mutex::new(HashMap::new()),
            refresh_tx,
        });

        let watcher = inner.clone();
        tokio::spawn(async move {
            watch_loop(watcher, extractor, period, errors, shutdown).await;
        });

        DynStore { inner }
    }

    /// Exact-name lookup
    pub fn get(&self, name: &str) -> Option<V> {
        self.inner
            .entries
            .lock()
            .get(name)
            .map(|t| t.value.clone())
    }

    /// Longest stored name that is a byte-prefix of `name`
    pub fn selection(&self, name: &str) -> Option<(String, V)> {
        let entries = self.inner.entries.lock();
        entries
            .iter()
            .filter(|(stored, _)| name.as_bytes().starts_with(stored.as_bytes()))
            .max_by_key(|(stored, _)| stored.len())
            .map(|(stored, t)| (stored.clone(), t.value.clone()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.entries.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.lock().is_empty()
    }

    /// Await completion of the next full directory pass
    pub async fn wait_for_refresh(&self) {
        let mut rx = self.inner.refresh_tx.subscribe();
        let _ = rx.changed().await;
    }
}

async fn watch_loop<V: Clone + Send + 'static>(
    inner: Arc<Inner<V>>,
    extractor: Arc<Extractor<V>>,
    period: Duration,
    errors: ErrorSink,
    mut shutdown: watch::Receiver<bool>,
) {
    // Hold off until the directory is readable
    let mut last_surfaced: Option<Instant> = None;
    loop {
        match std::fs::read_dir(&inner.dir) {
            Ok(_) => break,
            Err(e) => {
                let due = last_surfaced
                    .map(|at| at.elapsed() >= UNREADABLE_THROTTLE)
                    .unwrap_or(true);
                if due {
                    last_surfaced = Some(Instant::now());
                    errors
                        .report(
                            WorkerError::from(e).with("dir", inner.dir.display()),
                        )
                        .await;
                }
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            _ = shutdown.changed() => return,
        }
    }

    loop {
        if let Err(e) = refresh_pass(&inner, extractor.as_ref()) {
            errors
                .report(e.with("dir", inner.dir.display()))
                .await;
        }
        inner.refresh_tx.send_modify(|generation| *generation += 1);

        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            _ = shutdown.changed() => {
                log::debug!("store watcher for {} stopping", inner.dir.display());
                return;
            }
        }
    }
}

/// One full pass: ingest changed files, drop vanished names
fn refresh_pass<V: Clone + Send + 'static>(
    inner: &Inner<V>,
    extractor: &Extractor<V>,
) -> Result<()> {
    let mut seen: Vec<String> = Vec::new();

    for entry in std::fs::read_dir(&inner.dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || name == "info" {
            continue;
        }

        // metadata() follows symlinks, so links to regular files count
        let meta = match std::fs::metadata(entry.path()) {
            Ok(meta) if meta.is_file() => meta,
            _ => continue,
        };
        let mtime_secs = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);

        seen.push(name.clone());

        let unchanged = inner
            .entries
            .lock()
            .get(&name)
            .map(|t| t.mtime_secs == mtime_secs)
            .unwrap_or(false);
        if unchanged {
            continue;
        }

        let content = std::fs::read(entry.path())?;
        match extractor(&content) {
            Ok(value) => {
                inner
                    .entries
                    .lock()
                    .insert(name, Tracked { value, mtime_secs });
            }
            Err(e) => {
                // Keep any previous value; a half-written file will be
                // picked up again once its mtime moves
                log::warn!(
                    "extractor rejected {}/{}: {}",
                    inner.dir.display(),
                    name,
                    e
                );
            }
        }
    }

    inner
        .entries
        .lock()
        .retain(|name, _| seen.iter().any(|s| s == name));
    Ok(())
}

/// Convenience for stores whose values are the raw file bytes
pub fn bytes_extractor() -> Arc<Extractor<Vec<u8>>> {
    Arc::new(|content: &[u8]| Ok(content.to_vec()))
}

/// Extractor for single-line text files (trailing whitespace trimmed)
pub fn text_extractor() -> Arc<Extractor<String>> {
    Arc::new(|content: &[u8]| {
        std::str::from_utf8(content)
            .map(|s| s.trim_end().to_string())
            .map_err(|e| WorkerError::malformed("file is not utf-8").with_source(e))
    })
}
