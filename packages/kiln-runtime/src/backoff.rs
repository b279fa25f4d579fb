//! TTL-keyed backoff registry
//!
//! The scheduler parks failing or idle subscriptions here so polling loops
//! skip them until their expiry passes. Setting a backoff never shortens an
//! existing unexpired one.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub struct Backoff {
    entries: Mutex<HashMap<String, Instant>>,
}

impl Backoff {
    pub fn new() -> Self {
        Backoff {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Install an expiry of `now + ttl` unless a later unexpired one exists
    pub fn set(&self, key: &str, ttl: Duration) {
        let now = Instant::now();
        let candidate = now + ttl;
        let mut entries = self.entries.lock();

        match entries.get(key) {
            Some(existing) if *existing > now && *existing >= candidate => {}
            _ => {
                entries.insert(key.to_string(), candidate);
            }
        }
    }

    /// Expiry for `key`, with presence; expired entries are evicted here
    pub fn get(&self, key: &str) -> (Option<Instant>, bool) {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(expiry) if *expiry > Instant::now() => (Some(*expiry), true),
            Some(_) => {
                entries.remove(key);
                (None, false)
            }
            None => (None, false),
        }
    }

    /// Whether `key` is currently backed off
    pub fn blocked(&self, key: &str) -> bool {
        self.get(key).1
    }

    /// Drop every expired entry
    pub fn sweep(&self) {
        let now = Instant::now();
        self.entries.lock().retain(|_, expiry| *expiry > now);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
