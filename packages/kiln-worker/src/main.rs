use anyhow::Context;
use kiln_events::{EventEmitter, Report};
use kiln_runtime::backoff::Backoff;
use kiln_runtime::cache::{ArtifactCache, Downloader};
use kiln_runtime::config::RuntimeConfig;
use kiln_runtime::dispatch::Dispatcher;
use kiln_runtime::error::ErrorSink;
use kiln_runtime::executor::Executor;
use kiln_runtime::keys::{ResponseKeys, SigningKeys};
use kiln_runtime::queue::{LocalQueue, TaskQueue};
use kiln_runtime::resources::{
    CpuTracker, DiskTracker, GpuInventory, GpuProbe, Resources, StaticProbe,
};
use kiln_runtime::scheduler::Scheduler;
use kiln_runtime::storage::LocalStore;
use kiln_runtime::units;
use kiln_runtime::venv::VenvCache;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::RsaPrivateKey;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

// ===== Configuration =====

#[derive(Debug, Clone, Deserialize, Default)]
struct Config {
    #[serde(default)]
    worker: WorkerConfig,
    #[serde(default)]
    queues: QueueConfig,
    #[serde(default)]
    cache: CacheConfig,
    #[serde(default)]
    keys: KeyConfig,
    #[serde(default)]
    limits: LimitConfig,
    #[serde(default)]
    runtime: RuntimeSection,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct WorkerConfig {
    /// Defaults to the hostname
    #[serde(default)]
    executor_id: String,
    #[serde(default = "default_project")]
    project: String,
}

fn default_project() -> String {
    "kiln".to_string()
}

#[derive(Debug, Clone, Deserialize)]
struct QueueConfig {
    #[serde(default = "default_queue_root")]
    local_root: PathBuf,
}

fn default_queue_root() -> PathBuf {
    PathBuf::from("/var/kiln/queues")
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            local_root: default_queue_root(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct CacheConfig {
    #[serde(default = "default_cache_root")]
    root: PathBuf,
    #[serde(default = "default_venv_capacity")]
    venv_capacity: usize,
}

fn default_cache_root() -> PathBuf {
    PathBuf::from("/var/kiln/cache")
}

fn default_venv_capacity() -> usize {
    8
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            root: default_cache_root(),
            venv_capacity: default_venv_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
struct KeyConfig {
    #[serde(default)]
    signing_dir: Option<PathBuf>,
    #[serde(default)]
    response_dir: Option<PathBuf>,
    #[serde(default)]
    private_key_file: Option<PathBuf>,
    #[serde(default = "default_key_refresh_secs")]
    refresh_secs: u64,
}

fn default_key_refresh_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize, Default)]
struct LimitConfig {
    /// 0 means hardware-detected
    #[serde(default)]
    cpu_cores: u32,
    /// Empty means hardware-detected
    #[serde(default)]
    ram: String,
    /// Minimum free disk watermark, e.g. "20gb"
    #[serde(default)]
    min_free_disk: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct RuntimeSection {
    /// ConfigMap-style directory with QUEUE_MATCH / QUEUE_MISMATCH / STATE
    #[serde(default)]
    config_dir: Option<PathBuf>,
    #[serde(default = "default_refresh_secs")]
    refresh_secs: u64,
}

fn default_refresh_secs() -> u64 {
    15
}

impl Config {
    fn load(path: &str) -> anyhow::Result<Self> {
        if !std::path::Path::new(path).exists() {
            log::warn!("⚠️  Config {} not found, using defaults", path);
            return Ok(Config::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("parsing config {}", path))?;
        Ok(config)
    }
}

// ===== Wiring helpers =====

#[cfg(feature = "nvml-probe")]
fn gpu_probe() -> Arc<dyn GpuProbe> {
    match kiln_runtime::resources::nvml::NvmlProbe::new() {
        Ok(probe) => {
            log::info!("🎛️  NVML probe active");
            return Arc::new(probe);
        }
        Err(e) => log::warn!("⚠️  NVML unavailable, running without GPUs: {}", e),
    }
    Arc::new(StaticProbe::new(vec![]))
}

#[cfg(not(feature = "nvml-probe"))]
fn gpu_probe() -> Arc<dyn GpuProbe> {
    Arc::new(StaticProbe::new(vec![]))
}

fn load_private_key(path: &PathBuf) -> anyhow::Result<RsaPrivateKey> {
    let pem = std::fs::read_to_string(path)
        .with_context(|| format!("reading private key {}", path.display()))?;
    let key = if pem.contains("BEGIN RSA PRIVATE KEY") {
        RsaPrivateKey::from_pkcs1_pem(&pem)?
    } else {
        RsaPrivateKey::from_pkcs8_pem(&pem)?
    };
    Ok(key)
}

/// Fan SIGINT/SIGTERM into the root shutdown signal
async fn signal_task(shutdown_tx: watch::Sender<bool>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                log::error!("SIGTERM handler failed: {}", e);
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => log::info!("🛑 SIGINT received"),
            _ = term.recv() => log::info!("🛑 SIGTERM received"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        log::info!("🛑 interrupt received");
    }
    let _ = shutdown_tx.send(true);
}

// ===== Main =====

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("🚀 Kiln Worker v{} starting...", env!("CARGO_PKG_VERSION"));

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "worker-config.toml".to_string());
    log::info!("📄 Loading config from {}", config_path);
    let config = Config::load(&config_path)?;

    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "kiln-worker".to_string());
    let executor_id = if config.worker.executor_id.is_empty() {
        hostname.clone()
    } else {
        config.worker.executor_id.clone()
    };
    log::info!("⚙️  Executor: {} (host {})", executor_id, hostname);

    // Root shutdown signal, fanned out to every background loop
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(signal_task(shutdown_tx));

    // Well-known error channel; the daemon drains it into the log
    let (error_sink, mut error_rx) = ErrorSink::channel(64);
    tokio::spawn(async move {
        while let Some(err) = error_rx.recv().await {
            log::error!("⛔ {}", err);
        }
    });

    // Filesystem layout
    let cache_root = &config.cache.root;
    let object_root = cache_root.join("objects");
    let blob_root = cache_root.join("blob-cache");
    let work_root = cache_root.join("work");
    let venv_root = cache_root.join("venvs");
    for dir in [cache_root.clone(), object_root.clone(), work_root.clone()] {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating {}", dir.display()))?;
    }

    // Resource trackers
    let probe = gpu_probe();
    let visible = std::env::var("CUDA_VISIBLE_DEVICES").ok();
    let gpus = Arc::new(
        GpuInventory::init(probe.as_ref(), visible.as_deref())
            .map_err(|e| anyhow::anyhow!("gpu inventory init failed: {}", e))?,
    );
    log::info!("🎛️  GPU inventory: {} device(s)", gpus.device_count());
    tokio::spawn(gpus.clone().monitor(probe, shutdown_rx.clone()));

    let cpu = if config.limits.cpu_cores > 0 && !config.limits.ram.is_empty() {
        let ram = units::parse_size(&config.limits.ram)
            .map_err(|e| anyhow::anyhow!("limits.ram: {}", e))?;
        Arc::new(CpuTracker::new(config.limits.cpu_cores, ram))
    } else {
        Arc::new(CpuTracker::detect())
    };

    let disk = Arc::new(
        DiskTracker::new(cache_root)
            .map_err(|e| anyhow::anyhow!("disk tracker init failed: {}", e))?,
    );
    if !config.limits.min_free_disk.is_empty() {
        let min_free = units::parse_size(&config.limits.min_free_disk)
            .map_err(|e| anyhow::anyhow!("limits.min_free_disk: {}", e))?;
        disk.set_limits(min_free)
            .map_err(|e| anyhow::anyhow!("disk limits: {}", e))?;
    }
    let resources = Arc::new(Resources::new(gpus, cpu, disk));

    // Key stores
    let key_refresh = Duration::from_secs(config.keys.refresh_secs.max(1));
    let signing = config.keys.signing_dir.as_ref().map(|dir| {
        log::info!("🔑 Watching signing keys in {}", dir.display());
        SigningKeys::start(dir, key_refresh, error_sink.clone(), shutdown_rx.clone())
    });
    let response_keys = config.keys.response_dir.as_ref().map(|dir| {
        log::info!("🔑 Watching response keys in {}", dir.display());
        ResponseKeys::start(dir, key_refresh, error_sink.clone(), shutdown_rx.clone())
    });
    let decrypt_key = match config.keys.private_key_file.as_ref() {
        Some(path) => Some(load_private_key(path)?),
        None => None,
    };

    // Runtime-mutable configuration (ConfigMap-volume style)
    let runtime_dir = config
        .runtime
        .config_dir
        .clone()
        .unwrap_or_else(|| cache_root.join("runtime"));
    std::fs::create_dir_all(&runtime_dir)?;
    let runtime_config = RuntimeConfig::start(
        &runtime_dir,
        Duration::from_secs(10),
        error_sink.clone(),
        shutdown_rx.clone(),
    );

    // Caches and the run pipeline
    let downloader = Arc::new(
        Downloader::new(&blob_root)
            .map_err(|e| anyhow::anyhow!("blob cache init failed: {}", e))?,
    );
    let cache = Arc::new(ArtifactCache::new(error_sink.clone()).with_downloader(downloader));
    let venvs = Arc::new(
        VenvCache::new(&venv_root, config.cache.venv_capacity)
            .map_err(|e| anyhow::anyhow!("venv cache init failed: {}", e))?,
    );
    let store = Arc::new(LocalStore::new(&object_root));

    // Daemon-side event drain: worker events become log lines here and
    // reports on each run's response queue via the scheduler's responders
    let (event_tx, mut event_rx) = mpsc::channel::<Report>(256);
    tokio::spawn(async move {
        while let Some(report) = event_rx.recv().await {
            match report.to_wire() {
                Ok(wire) => log::debug!("📊 {}", wire),
                Err(e) => log::warn!("report encode failed: {}", e),
            }
        }
    });
    let emitter = EventEmitter::new(event_tx, executor_id.clone());

    let dispatcher = Arc::new(Dispatcher {
        executor_id: executor_id.clone(),
        resources: resources.clone(),
        store,
        cache,
        venvs,
        executor: Arc::new(Executor::new(executor_id.clone())),
        signing,
        decrypt_key,
        work_root,
        emitter: Some(emitter.clone()),
    });

    // Broker clients; the local directory backing is always on
    let local_queue: Arc<dyn TaskQueue> = Arc::new(
        LocalQueue::new(&config.queues.local_root, config.worker.project.as_str())
            .map_err(|e| anyhow::anyhow!("local queue init failed: {}", e))?,
    );
    log::info!(
        "📦 Local queue root {}",
        config.queues.local_root.display()
    );
    let clients = vec![local_queue];

    let mut scheduler = Scheduler::new(
        clients,
        dispatcher,
        runtime_config,
        Arc::new(Backoff::new()),
    )
    .with_periods(
        Duration::from_secs(config.runtime.refresh_secs.max(1)),
        Duration::from_secs(5),
    )
    .with_emitter(emitter);
    if let Some(keys) = response_keys {
        scheduler = scheduler.with_response_keys(keys);
    }

    log::info!("✅ Worker ready, polling for experiments");
    Arc::new(scheduler).run(shutdown_rx).await;

    log::info!("👋 Worker stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_parses_partial_toml() {
        let toml = r#"
            [worker]
            executor_id = "worker-7"

            [cache]
            root = "/tmp/kiln-cache"

            [limits]
            cpu_cores = 4
            ram = "8gb"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.worker.executor_id, "worker-7");
        assert_eq!(config.worker.project, "kiln");
        assert_eq!(config.cache.root, PathBuf::from("/tmp/kiln-cache"));
        assert_eq!(config.cache.venv_capacity, 8);
        assert_eq!(config.limits.cpu_cores, 4);
        assert_eq!(config.runtime.refresh_secs, 15);
    }

    #[test]
    fn test_empty_config_is_all_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.queues.local_root, PathBuf::from("/var/kiln/queues"));
        assert_eq!(config.keys.refresh_secs, 10);
        assert!(config.keys.signing_dir.is_none());
    }
}
