//! Runtime-mutable worker configuration
//!
//! A watched directory (one file per key, ConfigMap-volume style) feeds the
//! settings the scheduler re-reads every cycle: the subscription include
//! and exclude filters and the host lifecycle state. Changes land within
//! one refresh period, no restart.

use crate::dynstore::{text_extractor, DynStore};
use crate::error::ErrorSink;
use regex::Regex;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;

pub const KEY_QUEUE_MATCH: &str = "QUEUE_MATCH";
pub const KEY_QUEUE_MISMATCH: &str = "QUEUE_MISMATCH";
pub const KEY_STATE: &str = "STATE";

pub const DEFAULT_QUEUE_MATCH: &str = "^(rmq|sqs|local)_.*$";

/// Host lifecycle as observed from the deployment environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    DrainAndSuspend,
    Unknown,
}

impl WorkerState {
    fn parse(text: &str) -> Self {
        match text.trim() {
            "Running" => WorkerState::Running,
            "DrainAndSuspend" => WorkerState::DrainAndSuspend,
            _ => WorkerState::Unknown,
        }
    }
}

#[derive(Clone)]
pub struct RuntimeConfig {
    store: DynStore<String>,
}

impl RuntimeConfig {
    pub fn start(
        dir: impl Into<PathBuf>,
        period: Duration,
        errors: ErrorSink,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        RuntimeConfig {
            store: DynStore::start(dir, text_extractor(), period, errors, shutdown),
        }
    }

    /// Include filter; the compiled default when unset or invalid
    pub fn matcher(&self) -> Option<Regex> {
        let pattern = self
            .store
            .get(KEY_QUEUE_MATCH)
            .unwrap_or_else(|| DEFAULT_QUEUE_MATCH.to_string());
        if pattern.is_empty() {
            return None;
        }
        match Regex::new(&pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                log::warn!("bad {} pattern {:?}: {}", KEY_QUEUE_MATCH, pattern, e);
                Regex::new(DEFAULT_QUEUE_MATCH).ok()
            }
        }
    }

    /// Exclude filter; absent by default
    pub fn mismatcher(&self) -> Option<Regex> {
        let pattern = self.store.get(KEY_QUEUE_MISMATCH)?;
        if pattern.is_empty() {
            return None;
        }
        match Regex::new(&pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                log::warn!("bad {} pattern {:?}: {}", KEY_QUEUE_MISMATCH, pattern, e);
                None
            }
        }
    }

    /// Host state; an absent key means the worker keeps running
    pub fn state(&self) -> WorkerState {
        self.store
            .get(KEY_STATE)
            .map(|text| WorkerState::parse(&text))
            .unwrap_or(WorkerState::Running)
    }

    pub async fn wait_for_refresh(&self) {
        self.store.wait_for_refresh().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    async fn started(dir: &std::path::Path) -> RuntimeConfig {
        let (sink, _errs) = ErrorSink::channel(4);
        let (_tx, shutdown) = watch::channel(false);
        let config = RuntimeConfig::start(dir, Duration::from_millis(50), sink, shutdown);
        config.wait_for_refresh().await;
        config
    }

    #[tokio::test]
    async fn test_defaults_with_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = started(dir.path()).await;

        let matcher = config.matcher().unwrap();
        assert!(matcher.is_match("rmq_main"));
        assert!(matcher.is_match("local_test"));
        assert!(!matcher.is_match("other_main"));
        assert!(config.mismatcher().is_none());
        assert_eq!(config.state(), WorkerState::Running);
    }

    #[tokio::test]
    async fn test_files_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(KEY_QUEUE_MATCH), "^local_.*$").unwrap();
        fs::write(dir.path().join(KEY_QUEUE_MISMATCH), "_scratch$").unwrap();
        fs::write(dir.path().join(KEY_STATE), "DrainAndSuspend\n").unwrap();

        let config = started(dir.path()).await;
        assert!(config.matcher().unwrap().is_match("local_jobs"));
        assert!(!config.matcher().unwrap().is_match("rmq_jobs"));
        assert!(config.mismatcher().unwrap().is_match("local_scratch"));
        assert_eq!(config.state(), WorkerState::DrainAndSuspend);
    }

    #[tokio::test]
    async fn test_unknown_state_string() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(KEY_STATE), "Sideways").unwrap();
        let config = started(dir.path()).await;
        assert_eq!(config.state(), WorkerState::Unknown);
    }

    #[tokio::test]
    async fn test_invalid_regex_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(KEY_QUEUE_MATCH), "([unclosed").unwrap();
        let config = started(dir.path()).await;
        assert!(config.matcher().unwrap().is_match("sqs_west:jobs"));
    }
}
