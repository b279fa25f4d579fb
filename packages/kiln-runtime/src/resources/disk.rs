//! Local disk space accounting
//!
//! Bound to a single device path (the worker's cache/work volume). The
//! tracker keeps a minimum-free watermark so experiments can never run the
//! host out of disk: allocations succeed only while the filesystem retains
//! `requested + min_free` available bytes beyond what is already promised.

use crate::error::{Result, WorkerError};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone)]
pub struct DiskAllocation {
    pub id: u64,
    pub device: PathBuf,
    pub bytes: u64,
}

struct State {
    device: PathBuf,
    min_free: u64,
    promised: u64,
    tracking: HashSet<u64>,
}

pub struct DiskTracker {
    state: Mutex<State>,
    next_alloc: AtomicU64,
}

/// `(available, capacity)` of the filesystem holding `path`
///
/// Matches the mounted disk with the longest mount-point prefix of `path`.
fn fs_space(path: &Path) -> Result<(u64, u64)> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let path = path
        .canonicalize()
        .unwrap_or_else(|_| path.to_path_buf());

    disks
        .list()
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| (d.available_space(), d.total_space()))
        .ok_or_else(|| {
            WorkerError::not_found("no filesystem found for device path")
                .with("path", path.display())
        })
}

impl DiskTracker {
    pub fn new(device: impl Into<PathBuf>) -> Result<Self> {
        let device = device.into();
        let (_, capacity) = fs_space(&device)?;
        Ok(DiskTracker {
            state: Mutex::new(State {
                device,
                min_free: capacity / 10,
                promised: 0,
                tracking: HashSet::new(),
            }),
            next_alloc: AtomicU64::new(1),
        })
    }

    /// Rebind to a different device path; all accounting is zeroed
    pub fn set_device(&self, device: impl Into<PathBuf>) -> Result<()> {
        let device = device.into();
        let (_, capacity) = fs_space(&device)?;
        let mut state = self.state.lock();
        log::debug!(
            "disk tracker rebinding {} -> {}",
            state.device.display(),
            device.display()
        );
        state.device = device;
        state.min_free = capacity / 10;
        state.promised = 0;
        state.tracking.clear();
        Ok(())
    }

    /// Install the minimum-free watermark: max(user value, 10% of capacity)
    pub fn set_limits(&self, user_min_free: u64) -> Result<()> {
        let mut state = self.state.lock();
        let (_, capacity) = fs_space(&state.device)?;
        state.min_free = user_min_free.max(capacity / 10);
        Ok(())
    }

    /// Promise `bytes` on the device; `live = false` checks without promising
    pub fn alloc(&self, bytes: u64, live: bool) -> Result<Option<DiskAllocation>> {
        if bytes == 0 {
            return Ok(None);
        }

        let mut state = self.state.lock();
        let (available, _) = fs_space(&state.device)?;
        let unpromised = available.saturating_sub(state.promised);
        if unpromised < bytes + state.min_free {
            return Err(WorkerError::exhausted("insufficient disk space")
                .with("device", state.device.display())
                .with("want", bytes)
                .with("unpromised", unpromised)
                .with("min_free", state.min_free));
        }

        if !live {
            return Ok(Some(DiskAllocation {
                id: 0,
                device: state.device.clone(),
                bytes,
            }));
        }

        let id = self.next_alloc.fetch_add(1, Ordering::SeqCst);
        state.promised += bytes;
        state.tracking.insert(id);
        Ok(Some(DiskAllocation {
            id,
            device: state.device.clone(),
            bytes,
        }))
    }

    pub fn release(&self, alloc: &DiskAllocation) -> Result<()> {
        let mut state = self.state.lock();
        if !state.tracking.remove(&alloc.id) {
            return Err(WorkerError::double_release("disk allocation unknown")
                .with("alloc", alloc.id));
        }
        state.promised -= alloc.bytes;
        Ok(())
    }

    pub fn promised(&self) -> u64 {
        self.state.lock().promised
    }

    pub fn device(&self) -> PathBuf {
        self.state.lock().device.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_alloc_release_accounting() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = DiskTracker::new(dir.path()).unwrap();

        let alloc = tracker.alloc(1024, true).unwrap().unwrap();
        assert_eq!(tracker.promised(), 1024);

        tracker.release(&alloc).unwrap();
        assert_eq!(tracker.promised(), 0);

        assert_eq!(
            tracker.release(&alloc).unwrap_err().kind(),
            ErrorKind::DoubleRelease
        );
    }

    #[test]
    fn test_watermark_blocks_oversized_requests() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = DiskTracker::new(dir.path()).unwrap();

        // More than any filesystem can offer once the watermark is held back
        let err = tracker.alloc(u64::MAX / 2, true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Exhausted);
    }

    #[test]
    fn test_user_watermark_is_floor_not_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = DiskTracker::new(dir.path()).unwrap();

        // A tiny user watermark still leaves the 10% capacity floor in place
        tracker.set_limits(1).unwrap();
        let err = tracker.alloc(u64::MAX / 2, true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Exhausted);
    }

    #[test]
    fn test_rebind_zeroes_accounting() {
        let dir = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let tracker = DiskTracker::new(dir.path()).unwrap();

        let _alloc = tracker.alloc(2048, true).unwrap().unwrap();
        assert_eq!(tracker.promised(), 2048);

        tracker.set_device(other.path()).unwrap();
        assert_eq!(tracker.promised(), 0);
    }

    #[test]
    fn test_zero_request_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = DiskTracker::new(dir.path()).unwrap();
        assert!(tracker.alloc(0, true).unwrap().is_none());
    }

    #[test]
    fn test_dry_run_promises_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = DiskTracker::new(dir.path()).unwrap();
        let alloc = tracker.alloc(512, false).unwrap().unwrap();
        assert_eq!(alloc.id, 0);
        assert_eq!(tracker.promised(), 0);
    }
}
