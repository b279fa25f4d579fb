//! CPU core and RAM accounting
//!
//! One registry per worker process. Soft limits default to the
//! hardware-detected totals and may be lowered by configuration; an
//! allocation that would breach either cap is rejected outright.

use crate::error::{Result, WorkerError};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone)]
pub struct CpuAllocation {
    pub id: u64,
    pub cores: u32,
    pub ram_bytes: u64,
}

struct State {
    soft_cores: u32,
    soft_ram: u64,
    used_cores: u32,
    used_ram: u64,
    tracking: HashSet<u64>,
}

pub struct CpuTracker {
    state: Mutex<State>,
    next_alloc: AtomicU64,
}

impl CpuTracker {
    /// Tracker capped at the host's detected core and memory totals
    pub fn detect() -> Self {
        let sys = sysinfo::System::new_all();
        let cores = sys.cpus().len().max(1) as u32;
        let ram = sys.total_memory();
        log::debug!("cpu tracker sees {} cores, {} bytes ram", cores, ram);
        Self::new(cores, ram)
    }

    pub fn new(soft_cores: u32, soft_ram: u64) -> Self {
        CpuTracker {
            state: Mutex::new(State {
                soft_cores,
                soft_ram,
                used_cores: 0,
                used_ram: 0,
                tracking: HashSet::new(),
            }),
            next_alloc: AtomicU64::new(1),
        }
    }

    /// Lower or raise the soft caps; in-use amounts cannot be stranded
    pub fn set_limits(&self, cores: u32, ram: u64) -> Result<()> {
        let mut state = self.state.lock();
        if cores < state.used_cores || ram < state.used_ram {
            return Err(WorkerError::exhausted("limit below current usage")
                .with("cores_in_use", state.used_cores)
                .with("ram_in_use", state.used_ram));
        }
        state.soft_cores = cores;
        state.soft_ram = ram;
        Ok(())
    }

    /// Reserve cores and RAM; `live = false` checks without reserving
    pub fn alloc(&self, cores: u32, ram: u64, live: bool) -> Result<Option<CpuAllocation>> {
        if cores == 0 && ram == 0 {
            return Ok(None);
        }

        let mut state = self.state.lock();
        if state.used_cores + cores > state.soft_cores {
            return Err(WorkerError::exhausted("insufficient cpu cores")
                .with("want", cores)
                .with("free", state.soft_cores - state.used_cores));
        }
        if state.used_ram + ram > state.soft_ram {
            return Err(WorkerError::exhausted("insufficient ram")
                .with("want", ram)
                .with("free", state.soft_ram - state.used_ram));
        }

        if !live {
            return Ok(Some(CpuAllocation {
                id: 0,
                cores,
                ram_bytes: ram,
            }));
        }

        let id = self.next_alloc.fetch_add(1, Ordering::SeqCst);
        state.used_cores += cores;
        state.used_ram += ram;
        state.tracking.insert(id);
        Ok(Some(CpuAllocation {
            id,
            cores,
            ram_bytes: ram,
        }))
    }

    /// Restore the exact counters an allocation charged
    pub fn release(&self, alloc: &CpuAllocation) -> Result<()> {
        let mut state = self.state.lock();
        if !state.tracking.remove(&alloc.id) {
            return Err(WorkerError::double_release("cpu allocation unknown")
                .with("alloc", alloc.id));
        }
        state.used_cores -= alloc.cores;
        state.used_ram -= alloc.ram_bytes;
        Ok(())
    }

    /// `(free_cores, free_ram)` under the soft caps
    pub fn free(&self) -> (u32, u64) {
        let state = self.state.lock();
        (
            state.soft_cores - state.used_cores,
            state.soft_ram - state.used_ram,
        )
    }
}
