//! Python virtual-environment cache
//!
//! Environments are expensive to build and cheap to share, so they are
//! keyed by a 64-bit hash over the python version and the full pip list and
//! reference-counted across runs. First creation is single-flight: one
//! caller renders and runs the bootstrap script, everyone else waits on the
//! same entry. An entry whose build exits non-zero is marked invalid and
//! dropped; an entry whose client set empties becomes an eviction candidate
//! on a plain LRU.

use crate::error::{Result, WorkerError};
use crate::fingerprint;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

/// Pip install retry budget inside the bootstrap script
const PIP_ATTEMPTS: u32 = 3;
const PIP_BACKOFF_SECS: u32 = 10;

/// Everything that shapes an environment's identity
#[derive(Debug, Clone)]
pub struct VenvSpec {
    pub python_ver: String,
    /// Pips requested by the experiment itself
    pub general: Vec<String>,
    /// Pips added by the submitting configuration
    pub configured: Vec<String>,
}

impl VenvSpec {
    pub fn key(&self) -> u64 {
        let mut parts: Vec<&str> = vec![&self.python_ver];
        parts.extend(self.general.iter().map(String::as_str));
        parts.extend(self.configured.iter().map(String::as_str));
        fingerprint::hash_parts(&parts)
    }
}

#[derive(Debug)]
struct EntryState {
    clients: HashSet<String>,
    valid: bool,
    built: bool,
}

#[derive(Debug)]
pub struct VenvEntry {
    pub unique_id: String,
    pub key: u64,
    pub root: PathBuf,
    state: Mutex<EntryState>,
    done_rx: watch::Receiver<bool>,
    done_tx: Mutex<Option<watch::Sender<bool>>>,
}

impl VenvEntry {
    fn new(key: u64, venv_root: &PathBuf) -> Self {
        let unique_id = format!("venv-{:016x}", key);
        let (done_tx, done_rx) = watch::channel(false);
        VenvEntry {
            root: venv_root.join(&unique_id),
            unique_id,
            key,
            state: Mutex::new(EntryState {
                clients: HashSet::new(),
                valid: false,
                built: false,
            }),
            done_rx,
            done_tx: Mutex::new(Some(done_tx)),
        }
    }

    fn finish_build(&self, valid: bool) {
        {
            let mut state = self.state.lock();
            state.built = true;
            state.valid = valid;
        }
        if let Some(tx) = self.done_tx.lock().take() {
            let _ = tx.send(true);
        }
    }

    async fn wait_built(&self) {
        let mut done = self.done_rx.clone();
        while !*done.borrow() {
            if done.changed().await.is_err() {
                break;
            }
        }
    }

    pub fn is_valid(&self) -> bool {
        self.state.lock().valid
    }

    pub fn client_count(&self) -> usize {
        self.state.lock().clients.len()
    }
}

/// Runs a rendered bootstrap script, returning its exit code
pub type ScriptRunner =
    Arc<dyn Fn(PathBuf) -> BoxFuture<'static, Result<i32>> + Send + Sync>;

/// Default runner: hand the script to bash and wait
fn bash_runner() -> ScriptRunner {
    Arc::new(|script: PathBuf| {
        Box::pin(async move {
            let status = tokio::process::Command::new("/bin/bash")
                .arg(&script)
                .status()
                .await
                .map_err(|e| {
                    WorkerError::io("venv bootstrap spawn failed").with_source(e)
                })?;
            Ok(status.code().unwrap_or(-1))
        })
    })
}

pub struct VenvCache {
    venv_root: PathBuf,
    entries: Mutex<HashMap<u64, Arc<VenvEntry>>>,
    /// Emptied entries, least recently emptied first
    idle: Mutex<Vec<u64>>,
    capacity: usize,
    runner: ScriptRunner,
}

impl VenvCache {
    pub fn new(venv_root: impl Into<PathBuf>, capacity: usize) -> Result<Self> {
        let venv_root = venv_root.into();
        std::fs::create_dir_all(&venv_root)?;
        Ok(VenvCache {
            venv_root,
            entries: Mutex::new(HashMap::new()),
            idle: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
            runner: bash_runner(),
        })
    }

    /// Swap the script runner, for tests and exotic hosts
    pub fn with_runner(mut self, runner: ScriptRunner) -> Self {
        self.runner = runner;
        self
    }

    /// Fetch or build the environment for `spec`, registering `client`
    ///
    /// Callers must pair this with `remove_client` once the run finishes.
    pub async fn get_entry(&self, spec: &VenvSpec, client: &str) -> Result<Arc<VenvEntry>> {
        let key = spec.key();

        let (entry, creator) = {
            let mut entries = self.entries.lock();
            match entries.get(&key) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let entry = Arc::new(VenvEntry::new(key, &self.venv_root));
                    entries.insert(key, entry.clone());
                    (entry, true)
                }
            }
        };

        if creator {
            let script = self.write_script(spec, &entry)?;
            log::debug!("building {} from {}", entry.unique_id, script.display());
            let code = (self.runner)(script).await.unwrap_or(-1);
            let valid = code == 0;
            entry.finish_build(valid);
            if !valid {
                self.entries.lock().remove(&key);
                return Err(WorkerError::io("venv bootstrap exited non-zero")
                    .with("venv", &entry.unique_id)
                    .with("exit_code", code));
            }
        } else {
            entry.wait_built().await;
            if !entry.is_valid() {
                return Err(WorkerError::io("venv bootstrap failed in another run")
                    .with("venv", &entry.unique_id));
            }
        }

        entry.state.lock().clients.insert(client.to_string());
        self.idle.lock().retain(|k| *k != key);
        Ok(entry)
    }

    /// Drop one client; an emptied entry becomes evictable
    pub fn remove_client(&self, entry: &Arc<VenvEntry>, client: &str) {
        let emptied = {
            let mut state = entry.state.lock();
            state.clients.remove(client);
            state.clients.is_empty()
        };
        if emptied {
            let mut idle = self.idle.lock();
            idle.retain(|k| *k != entry.key);
            idle.push(entry.key);
        }
        self.evict_over_capacity();
    }

    fn evict_over_capacity(&self) {
        loop {
            let victim = {
                let entries = self.entries.lock();
                if entries.len() <= self.capacity {
                    return;
                }
                let mut idle = self.idle.lock();
                if idle.is_empty() {
                    return;
                }
                idle.remove(0)
            };

            let removed = self.entries.lock().remove(&victim);
            if let Some(entry) = removed {
                log::debug!("evicting {}", entry.unique_id);
                if entry.root.exists() {
                    if let Err(e) = std::fs::remove_dir_all(&entry.root) {
                        log::warn!("venv cleanup for {} failed: {}", entry.unique_id, e);
                    }
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Render the bootstrap script next to the venv and return its path
    fn write_script(&self, spec: &VenvSpec, entry: &VenvEntry) -> Result<PathBuf> {
        let script_path = self.venv_root.join(format!("{}.sh", entry.unique_id));
        let script = render_script(spec, &entry.root);
        std::fs::write(&script_path, script)?;
        Ok(script_path)
    }
}

/// The bash bootstrap: version manager, venv, floor installs, pip lists
fn render_script(spec: &VenvSpec, venv_dir: &PathBuf) -> String {
    let mut lines = vec![
        "#!/bin/bash".to_string(),
        "set -e".to_string(),
        String::new(),
        "retry_pip() {".to_string(),
        format!("    for attempt in $(seq 1 {}); do", PIP_ATTEMPTS),
        "        if python -m pip install \"$@\"; then".to_string(),
        "            return 0".to_string(),
        "        fi".to_string(),
        format!("        sleep {}", PIP_BACKOFF_SECS),
        "    done".to_string(),
        "    return 1".to_string(),
        "}".to_string(),
        String::new(),
        format!("export PYENV_VERSION=\"{}\"", spec.python_ver),
        "pyenv install --skip-existing \"$PYENV_VERSION\"".to_string(),
        format!("pyenv exec python -m venv \"{}\"", venv_dir.display()),
        format!("source \"{}/bin/activate\"", venv_dir.display()),
        String::new(),
        "retry_pip --upgrade pip setuptools wheel".to_string(),
    ];

    for pip in spec.general.iter().chain(spec.configured.iter()) {
        lines.push(format!("retry_pip \"{}\"", pip));
    }
    lines.push(String::new());
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting_runner(builds: Arc<AtomicUsize>, exit_code: i32) -> ScriptRunner {
        Arc::new(move |_script: PathBuf| {
            let builds = builds.clone();
            Box::pin(async move {
                builds.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(exit_code)
            })
        })
    }

    fn spec(python: &str, pips: &[&str]) -> VenvSpec {
        VenvSpec {
            python_ver: python.to_string(),
            general: pips.iter().map(|s| s.to_string()).collect(),
            configured: vec![],
        }
    }

    #[test]
    fn test_key_covers_version_and_pips() {
        let base = spec("3.10", &["numpy", "torch"]);
        assert_eq!(base.key(), spec("3.10", &["numpy", "torch"]).key());
        assert_ne!(base.key(), spec("3.11", &["numpy", "torch"]).key());
        assert_ne!(base.key(), spec("3.10", &["numpy"]).key());

        let mut configured = spec("3.10", &["numpy"]);
        configured.configured.push("torch".to_string());
        assert_ne!(base.key(), configured.key());
    }

    #[tokio::test]
    async fn test_entries_are_shared_and_refcounted() {
        let root = tempfile::tempdir().unwrap();
        let builds = Arc::new(AtomicUsize::new(0));
        let cache = VenvCache::new(root.path(), 4)
            .unwrap()
            .with_runner(counting_runner(builds.clone(), 0));

        let entry_a = cache.get_entry(&spec("3.10", &["numpy"]), "run-a").await.unwrap();
        let entry_b = cache.get_entry(&spec("3.10", &["numpy"]), "run-b").await.unwrap();

        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(entry_a.unique_id, entry_b.unique_id);
        assert_eq!(entry_a.client_count(), 2);

        cache.remove_client(&entry_a, "run-a");
        assert_eq!(entry_b.client_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_first_creation_builds_once() {
        let root = tempfile::tempdir().unwrap();
        let builds = Arc::new(AtomicUsize::new(0));
        let cache = Arc::new(
            VenvCache::new(root.path(), 4)
                .unwrap()
                .with_runner(counting_runner(builds.clone(), 0)),
        );

        let mut handles = Vec::new();
        for i in 0..6 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_entry(&spec("3.10", &["torch"]), &format!("run-{}", i))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_build_invalidates_entry() {
        let root = tempfile::tempdir().unwrap();
        let builds = Arc::new(AtomicUsize::new(0));
        let cache = VenvCache::new(root.path(), 4)
            .unwrap()
            .with_runner(counting_runner(builds.clone(), 1));

        let err = cache
            .get_entry(&spec("3.10", &["brokenpkg"]), "run-a")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Io);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_eviction_waits_for_emptied_entries() {
        let root = tempfile::tempdir().unwrap();
        let builds = Arc::new(AtomicUsize::new(0));
        let cache = VenvCache::new(root.path(), 1)
            .unwrap()
            .with_runner(counting_runner(builds.clone(), 0));

        let held = cache.get_entry(&spec("3.10", &["numpy"]), "run-a").await.unwrap();
        let second = cache.get_entry(&spec("3.11", &["numpy"]), "run-b").await.unwrap();

        // Over capacity, but both entries still have clients
        assert_eq!(cache.len(), 2);

        cache.remove_client(&held, "run-a");
        assert_eq!(cache.len(), 1);

        cache.remove_client(&second, "run-b");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_rendered_script_shape() {
        let spec = spec("3.10.14", &["numpy==1.26.0"]);
        let dir = PathBuf::from("/var/kiln/venvs/venv-00ff");
        let script = render_script(&spec, &dir);

        assert!(script.starts_with("#!/bin/bash"));
        assert!(script.contains("pyenv install --skip-existing"));
        assert!(script.contains("python -m venv \"/var/kiln/venvs/venv-00ff\""));
        assert!(script.contains("source \"/var/kiln/venvs/venv-00ff/bin/activate\""));
        assert!(script.contains("retry_pip --upgrade pip setuptools wheel"));
        assert!(script.contains("retry_pip \"numpy==1.26.0\""));
        assert!(script.contains("seq 1 3"));
        assert!(script.contains("sleep 10"));
    }
}
