//! Host resource accounting
//!
//! Three registries (GPU, CPU/RAM, disk) with exact allocate/release
//! contracts, composed so a request either reserves everything it needs or
//! leaves the host untouched.

pub mod cpu;
pub mod disk;
pub mod gpu;
#[cfg(feature = "nvml-probe")]
pub mod nvml;

pub use cpu::{CpuAllocation, CpuTracker};
pub use disk::{DiskAllocation, DiskTracker};
pub use gpu::{GpuAllocation, GpuDevice, GpuInventory, GpuProbe, StaticProbe};

use crate::error::{Result, WorkerError};
use crate::request::Resource;
use crate::units;
use std::sync::Arc;

/// Byte-denominated resource request, parsed out of an experiment's
/// human-readable `Resource` block
#[derive(Debug, Clone, Default)]
pub struct AllocRequest {
    pub max_cpu_cores: u32,
    pub max_ram_bytes: u64,
    pub max_gpu_slots: u32,
    pub gpu_divisibles: Vec<u32>,
    pub max_gpu_mem_bytes: u64,
    pub max_disk_bytes: u64,
}

impl AllocRequest {
    /// Parse the human-readable sizes of a request's resource block
    pub fn from_resource(resource: &Resource) -> Result<Self> {
        let parse = |field: &str, value: &str| -> Result<u64> {
            if value.trim().is_empty() {
                return Ok(0);
            }
            units::parse_size(value).map_err(|e| e.with("field", field))
        };

        let gpus = resource.gpus;
        Ok(AllocRequest {
            max_cpu_cores: resource.cpus,
            max_ram_bytes: parse("ram", &resource.ram)?,
            max_gpu_slots: gpus,
            gpu_divisibles: default_divisibles(gpus),
            max_gpu_mem_bytes: parse("gpuMem", &resource.gpu_mem)?,
            max_disk_bytes: parse("hdd", &resource.hdd)?,
        })
    }
}

/// Slot granularities permitted for a request of `max_slots`: the standard
/// ladder filtered to what the request can actually use, largest first
pub fn default_divisibles(max_slots: u32) -> Vec<u32> {
    [8u32, 4, 2, 1]
        .into_iter()
        .filter(|d| *d <= max_slots.max(1))
        .collect()
}

/// Everything one admitted experiment holds
#[derive(Debug, Clone, Default)]
pub struct Allocation {
    pub cpu: Option<CpuAllocation>,
    pub disk: Option<DiskAllocation>,
    pub gpus: Vec<GpuAllocation>,
}

impl Allocation {
    /// Environment variables the experiment process must see
    pub fn env(&self) -> std::collections::HashMap<String, String> {
        self.gpus
            .first()
            .map(|g| g.env.clone())
            .unwrap_or_default()
    }
}

/// The composed per-host allocator
pub struct Resources {
    pub gpus: Arc<GpuInventory>,
    pub cpu: Arc<CpuTracker>,
    pub disk: Arc<DiskTracker>,
}

impl Resources {
    pub fn new(gpus: Arc<GpuInventory>, cpu: Arc<CpuTracker>, disk: Arc<DiskTracker>) -> Self {
        Resources { gpus, cpu, disk }
    }

    /// Reserve GPU, then CPU/RAM, then disk; on a later failure every
    /// earlier success is rolled back before the error is returned.
    pub fn alloc(&self, request: &AllocRequest, group: &str, live: bool) -> Result<Allocation> {
        let gpus = self.gpus.alloc_gpus(
            request.max_gpu_slots,
            request.max_gpu_mem_bytes,
            &request.gpu_divisibles,
            group,
            live,
        )?;

        let cpu = match self
            .cpu
            .alloc(request.max_cpu_cores, request.max_ram_bytes, live)
        {
            Ok(cpu) => cpu,
            Err(e) => {
                if live {
                    self.unwind_gpus(&gpus);
                }
                return Err(e.with("stage", "cpu"));
            }
        };

        let disk = match self.disk.alloc(request.max_disk_bytes, live) {
            Ok(disk) => disk,
            Err(e) => {
                if live {
                    if let Some(ref cpu) = cpu {
                        if let Err(release_err) = self.cpu.release(cpu) {
                            log::error!("cpu rollback failed: {}", release_err);
                        }
                    }
                    self.unwind_gpus(&gpus);
                }
                return Err(e.with("stage", "disk"));
            }
        };

        Ok(Allocation { cpu, disk, gpus })
    }

    /// Whether the request would fit right now, without reserving anything
    pub fn fits(&self, request: &AllocRequest, group: &str) -> bool {
        self.alloc(request, group, false).is_ok()
    }

    /// Return every reservation; all are attempted, the first error wins
    pub fn release(&self, allocation: &Allocation) -> Result<()> {
        let mut first_err: Option<WorkerError> = None;
        let mut note = |res: Result<()>| {
            if let Err(e) = res {
                if first_err.is_none() {
                    first_err = Some(e);
                } else {
                    log::error!("additional release failure: {}", e);
                }
            }
        };

        for gpu in &allocation.gpus {
            note(self.gpus.return_gpus(gpu));
        }
        if let Some(ref cpu) = allocation.cpu {
            note(self.cpu.release(cpu));
        }
        if let Some(ref disk) = allocation.disk {
            note(self.disk.release(disk));
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn unwind_gpus(&self, gpus: &[GpuAllocation]) {
        for gpu in gpus {
            if let Err(e) = self.gpus.return_gpus(gpu) {
                log::error!("gpu rollback failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn fixture(cores: u32, ram: u64) -> Resources {
        let probe = StaticProbe::new(vec![GpuDevice {
            uuid: "GPU-aa".to_string(),
            name: "GeForce GTX 1080".to_string(),
            index: 0,
            free_mem: 1_000,
            total_mem: 1_000,
        }]);
        let dir = tempfile::tempdir().unwrap();
        let disk = DiskTracker::new(dir.path()).unwrap();
        // Leak the tempdir so the path stays valid for the test's lifetime
        std::mem::forget(dir);

        Resources::new(
            Arc::new(GpuInventory::init(&probe, None).unwrap()),
            Arc::new(CpuTracker::new(cores, ram)),
            Arc::new(disk),
        )
    }

    fn request(cores: u32, ram: u64, slots: u32, gpu_mem: u64, disk: u64) -> AllocRequest {
        AllocRequest {
            max_cpu_cores: cores,
            max_ram_bytes: ram,
            max_gpu_slots: slots,
            gpu_divisibles: default_divisibles(slots),
            max_gpu_mem_bytes: gpu_mem,
            max_disk_bytes: disk,
        }
    }

    #[test]
    fn test_compose_and_release() {
        let resources = fixture(8, 1_000_000);
        let req = request(2, 1_000, 1, 100, 4096);

        let allocation = resources.alloc(&req, "expt-1", true).unwrap();
        assert!(allocation.cpu.is_some());
        assert!(allocation.disk.is_some());
        assert_eq!(allocation.gpus.len(), 1);

        resources.release(&allocation).unwrap();
        assert_eq!(resources.cpu.free(), (8, 1_000_000));
        assert_eq!(resources.disk.promised(), 0);
    }

    #[test]
    fn test_release_twice_reports_double_release() {
        let resources = fixture(8, 1_000_000);
        let allocation = resources
            .alloc(&request(1, 100, 0, 0, 0), "expt-1", true)
            .unwrap();
        resources.release(&allocation).unwrap();
        assert_eq!(
            resources.release(&allocation).unwrap_err().kind(),
            ErrorKind::DoubleRelease
        );
    }

    #[test]
    fn test_later_failure_rolls_back_gpu() {
        // CPU cap of 1 core forces the second stage to fail
        let resources = fixture(1, 10);
        let req = request(4, 0, 1, 100, 0);

        let err = resources.alloc(&req, "expt-1", true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Exhausted);

        // The GPU reservation must have been unwound: the full card fits again
        let again = request(0, 0, 2, 0, 0);
        resources.alloc(&again, "expt-2", true).unwrap();
    }

    #[test]
    fn test_dry_run_composition() {
        let resources = fixture(8, 1_000_000);
        let req = request(2, 1_000, 1, 100, 4096);

        assert!(resources.fits(&req, "expt-1"));
        assert_eq!(resources.cpu.free(), (8, 1_000_000));
        assert_eq!(resources.disk.promised(), 0);
    }

    #[test]
    fn test_default_divisibles_ladder() {
        assert_eq!(default_divisibles(8), vec![8, 4, 2, 1]);
        assert_eq!(default_divisibles(3), vec![2, 1]);
        assert_eq!(default_divisibles(1), vec![1]);
        assert_eq!(default_divisibles(0), vec![1]);
    }
}
