//! CUDA device inventory and slot allocator
//!
//! Devices are tracked as slot pools: each card contributes a slot count
//! derived from its marketing name and the free memory the driver reported
//! when the worker started. Allocations charge whole divisibles (permitted
//! per-card slot granularities) so experiments never land on fractional
//! cards. A card with a recorded ECC failure is excluded from new fits but
//! keeps its live allocations until they are returned.

use crate::error::{ErrorKind, Result, WorkerError};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// One device as seen by a probe
#[derive(Debug, Clone)]
pub struct GpuDevice {
    pub uuid: String,
    pub name: String,
    pub index: u32,
    pub free_mem: u64,
    pub total_mem: u64,
}

/// Source of device inventory and health
///
/// The NVML-backed implementation lives behind the `nvml-probe` feature;
/// configuration-seeded static probes serve GPU-less hosts and tests.
pub trait GpuProbe: Send + Sync {
    fn enumerate(&self) -> Result<Vec<GpuDevice>>;

    /// Devices currently reporting uncorrected ECC errors, with a reason
    fn ecc_failures(&self) -> Result<Vec<(String, String)>>;
}

/// Probe over a fixed device list, used for tests and static configs
pub struct StaticProbe {
    devices: Vec<GpuDevice>,
    ecc: Mutex<Vec<(String, String)>>,
}

impl StaticProbe {
    pub fn new(devices: Vec<GpuDevice>) -> Self {
        StaticProbe {
            devices,
            ecc: Mutex::new(Vec::new()),
        }
    }

    /// Mark a device as failed for subsequent `ecc_failures` calls
    pub fn fail_device(&self, uuid: &str, reason: &str) {
        self.ecc.lock().push((uuid.to_string(), reason.to_string()));
    }
}

impl GpuProbe for StaticProbe {
    fn enumerate(&self) -> Result<Vec<GpuDevice>> {
        Ok(self.devices.clone())
    }

    fn ecc_failures(&self) -> Result<Vec<(String, String)>> {
        Ok(self.ecc.lock().clone())
    }
}

/// Slots contributed by a device, keyed off its marketing name
///
/// Consumer cards carry one slot, the upper GeForce tier two, and
/// titan-class hardware four. Unrecognized devices default to one.
pub fn slots_for_name(name: &str) -> u32 {
    let name = name.to_ascii_lowercase();
    if name.contains("titan") || name.contains("a100") || name.contains("v100") {
        4
    } else if name.contains("1070")
        || name.contains("1080")
        || name.contains("2070")
        || name.contains("2080")
        || name.contains("3080")
    {
        2
    } else {
        1
    }
}

#[derive(Debug, Clone)]
struct Entry {
    uuid: String,
    name: String,
    group: Option<String>,
    total_slots: u32,
    total_mem: u64,
    free_slots: u32,
    free_mem: u64,
    ecc_failure: Option<String>,
    tracking: HashSet<u64>,
}

/// One card's share of a GPU reservation
#[derive(Debug, Clone)]
pub struct GpuAllocation {
    pub id: u64,
    pub uuid: String,
    pub group: String,
    pub slots: u32,
    pub mem_bytes: u64,
    pub env: HashMap<String, String>,
}

/// Process-wide GPU inventory, one mutex over the whole allocation state
pub struct GpuInventory {
    entries: Mutex<HashMap<String, Entry>>,
    next_alloc: AtomicU64,
}

impl GpuInventory {
    /// Build the inventory from a probe, optionally restricted by a
    /// `CUDA_VISIBLE_DEVICES`-style comma list (UUIDs preferred; bare
    /// indices are accepted with a warning).
    pub fn init(probe: &dyn GpuProbe, visible: Option<&str>) -> Result<Self> {
        let devices = probe.enumerate()?;
        let devices = match visible {
            Some(csv) => filter_visible(devices, csv),
            None => devices,
        };

        let mut entries = HashMap::new();
        for dev in devices {
            let slots = slots_for_name(&dev.name);
            log::debug!(
                "gpu {} ({}) joins inventory with {} slots, {} bytes free",
                dev.uuid,
                dev.name,
                slots,
                dev.free_mem
            );
            entries.insert(
                dev.uuid.clone(),
                Entry {
                    uuid: dev.uuid,
                    name: dev.name,
                    group: None,
                    total_slots: slots,
                    total_mem: dev.free_mem,
                    free_slots: slots,
                    free_mem: dev.free_mem,
                    ecc_failure: None,
                    tracking: HashSet::new(),
                },
            );
        }

        Ok(GpuInventory {
            entries: Mutex::new(entries),
            next_alloc: AtomicU64::new(1),
        })
    }

    /// Fit `max_slots` onto the inventory using the permitted divisibles
    ///
    /// `live = false` computes the hypothetical allocation without touching
    /// state; its allocations carry id 0 and cannot be returned. When
    /// `max_gpu_mem` is zero the fit takes all remaining memory on every
    /// matched card, which intentionally starves later arrivals in the same
    /// group (see DESIGN.md).
    pub fn alloc_gpus(
        &self,
        max_slots: u32,
        max_gpu_mem: u64,
        divisibles: &[u32],
        group: &str,
        live: bool,
    ) -> Result<Vec<GpuAllocation>> {
        if max_slots == 0 {
            return Ok(Vec::new());
        }

        let mut entries = self.entries.lock();

        // The fit runs on a scratch copy; state is published only on success,
        // which keeps partial reservations invisible to concurrent callers.
        let mut scratch = entries.clone();
        let chosen = fit(&mut scratch, max_slots, max_gpu_mem, divisibles, group)?;

        let joined: Vec<&str> = chosen.iter().map(|(uuid, _, _)| uuid.as_str()).collect();
        let device_list = joined.join(",");
        let mut env = HashMap::new();
        env.insert("CUDA_VISIBLE_DEVICES".to_string(), device_list.clone());
        env.insert("NVIDIA_VISIBLE_DEVICES".to_string(), device_list);

        let mut allocations = Vec::with_capacity(chosen.len());
        for (uuid, slots, mem) in &chosen {
            let id = if live {
                self.next_alloc.fetch_add(1, Ordering::SeqCst)
            } else {
                0
            };
            if live {
                let entry = scratch.get_mut(uuid).expect("fit returned unknown uuid");
                entry.tracking.insert(id);
            }
            allocations.push(GpuAllocation {
                id,
                uuid: uuid.clone(),
                group: group.to_string(),
                slots: *slots,
                mem_bytes: *mem,
                env: env.clone(),
            });
        }

        if live {
            *entries = scratch;
        }
        Ok(allocations)
    }

    /// Return one card's share, restoring the exact counters it charged
    pub fn return_gpus(&self, alloc: &GpuAllocation) -> Result<()> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&alloc.uuid).ok_or_else(|| {
            WorkerError::not_found("allocated device no longer in inventory")
                .with("uuid", &alloc.uuid)
        })?;

        match entry.group {
            Some(ref bound) if *bound == alloc.group => {}
            ref other => {
                return Err(WorkerError::fatal("device group does not match allocation")
                    .with("uuid", &alloc.uuid)
                    .with("bound", other.as_deref().unwrap_or("<none>"))
                    .with("returning", &alloc.group));
            }
        }

        if !entry.tracking.remove(&alloc.id) {
            return Err(WorkerError::double_release("allocation unknown to device")
                .with("uuid", &alloc.uuid)
                .with("alloc", alloc.id));
        }

        entry.free_slots = (entry.free_slots + alloc.slots).min(entry.total_slots);
        entry.free_mem = (entry.free_mem + alloc.mem_bytes).min(entry.total_mem);

        // A fully idle card leaves its group so other projects can claim it
        if entry.free_slots == entry.total_slots && entry.tracking.is_empty() {
            entry.group = None;
        }
        Ok(())
    }

    /// Record first-seen ECC failures without disturbing live allocations
    pub fn record_ecc(&self, failures: &[(String, String)]) {
        let mut entries = self.entries.lock();
        for (uuid, reason) in failures {
            if let Some(entry) = entries.get_mut(uuid) {
                if entry.ecc_failure.is_none() {
                    log::warn!("gpu {} excluded from new fits: {}", uuid, reason);
                    entry.ecc_failure = Some(reason.clone());
                }
            }
        }
    }

    /// Poll the probe for ECC failures on a jittered ~30 s cadence
    pub async fn monitor(
        self: Arc<Self>,
        probe: Arc<dyn GpuProbe>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let jitter = rand::thread_rng().gen_range(25_000..35_000);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(jitter)) => {}
                _ = shutdown.changed() => {
                    log::debug!("gpu monitor stopping");
                    return;
                }
            }

            match probe.ecc_failures() {
                Ok(failures) => self.record_ecc(&failures),
                Err(e) => log::warn!("gpu health poll failed: {}", e),
            }
        }
    }

    /// Snapshot of `(uuid, free_slots, free_mem)` for logs and tests
    pub fn free_state(&self) -> Vec<(String, u32, u64)> {
        let entries = self.entries.lock();
        let mut state: Vec<_> = entries
            .values()
            .map(|e| (e.uuid.clone(), e.free_slots, e.free_mem))
            .collect();
        state.sort();
        state
    }

    pub fn device_count(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Select `(uuid, slots, mem)` charges against the scratch inventory
fn fit(
    scratch: &mut HashMap<String, Entry>,
    max_slots: u32,
    max_gpu_mem: u64,
    divisibles: &[u32],
    group: &str,
) -> Result<Vec<(String, u32, u64)>> {
    let usable = |entry: &Entry| {
        entry.ecc_failure.is_none()
            && (entry.group.is_none() || entry.group.as_deref() == Some(group))
    };

    // Single-card pack: the smallest divisible covering the whole request,
    // on the lowest-UUID card that has the slots and the memory for it.
    if let Some(single) = divisibles
        .iter()
        .copied()
        .filter(|d| *d >= max_slots)
        .min()
    {
        let mut candidates: Vec<&Entry> = scratch
            .values()
            .filter(|e| usable(e) && e.free_slots >= single && e.free_mem >= max_gpu_mem)
            .collect();
        candidates.sort_by(|a, b| a.uuid.cmp(&b.uuid));

        if let Some(chosen) = candidates.first() {
            let uuid = chosen.uuid.clone();
            let mem = if max_gpu_mem == 0 {
                chosen.free_mem
            } else {
                max_gpu_mem
            };
            charge(scratch, &uuid, single, mem, group);
            return Ok(vec![(uuid, single, mem)]);
        }
    }

    // Cross-card greedy: repeatedly charge the card that can absorb the
    // largest divisible still needed, preferring tighter fits, then lower
    // UUIDs, so exact-size cards win over oversized ones.
    let mut remaining = max_slots;
    let mut chosen: Vec<(String, u32)> = Vec::new();
    let mut used: HashSet<String> = HashSet::new();

    while remaining > 0 {
        // Best card this round: largest chargeable divisible, then the
        // tightest card (fewest free slots), then the lower UUID.
        let pick = scratch
            .values()
            .filter(|e| usable(e) && !used.contains(&e.uuid))
            .filter_map(|e| {
                divisibles
                    .iter()
                    .copied()
                    .filter(|d| *d > 0 && *d <= remaining && *d <= e.free_slots)
                    .max()
                    .map(|charge_slots| (charge_slots, e.free_slots, e.uuid.clone()))
            })
            .max_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)).then(b.2.cmp(&a.2)));

        let Some((charge_slots, _, uuid)) = pick else {
            return Err(WorkerError::exhausted("no available slots")
                .with("wanted", max_slots)
                .with("short", remaining)
                .with("group", group));
        };
        used.insert(uuid.clone());
        chosen.push((uuid, charge_slots));
        remaining -= charge_slots;
    }

    // Memory divides equally among the chosen cards
    let per_card_mem = if max_gpu_mem == 0 {
        0
    } else {
        max_gpu_mem / chosen.len() as u64
    };
    for (uuid, _) in &chosen {
        let entry = &scratch[uuid];
        if max_gpu_mem != 0 && entry.free_mem < per_card_mem {
            return Err(WorkerError::exhausted("insufficient gpu memory")
                .with("uuid", uuid)
                .with("need", per_card_mem)
                .with("free", entry.free_mem));
        }
    }

    let mut charges = Vec::with_capacity(chosen.len());
    for (uuid, slots) in chosen {
        let mem = if max_gpu_mem == 0 {
            scratch[&uuid].free_mem
        } else {
            per_card_mem
        };
        charge(scratch, &uuid, slots, mem, group);
        charges.push((uuid, slots, mem));
    }
    Ok(charges)
}

fn charge(scratch: &mut HashMap<String, Entry>, uuid: &str, slots: u32, mem: u64, group: &str) {
    let entry = scratch.get_mut(uuid).expect("charging unknown uuid");
    entry.free_slots -= slots;
    entry.free_mem -= mem;
    entry.group = Some(group.to_string());
}

fn filter_visible(devices: Vec<GpuDevice>, csv: &str) -> Vec<GpuDevice> {
    let mut keep: Vec<GpuDevice> = Vec::new();
    for token in csv.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        if token.chars().all(|c| c.is_ascii_digit()) {
            log::warn!(
                "CUDA_VISIBLE_DEVICES entry {:?} is an index; device UUIDs are preferred",
                token
            );
            let index: u32 = token.parse().unwrap_or(u32::MAX);
            if let Some(dev) = devices.iter().find(|d| d.index == index) {
                keep.push(dev.clone());
            }
        } else if let Some(dev) = devices.iter().find(|d| d.uuid == token) {
            keep.push(dev.clone());
        } else {
            log::warn!("CUDA_VISIBLE_DEVICES entry {:?} matches no device", token);
        }
    }
    keep
}
