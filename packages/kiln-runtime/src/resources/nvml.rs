//! NVML-backed GPU probe
//!
//! Talks to the NVIDIA management library through `nvml-wrapper`. The
//! library is loaded at runtime, so this builds anywhere; `NvmlProbe::new`
//! fails on hosts without the driver.

use crate::error::{Result, WorkerError};
use crate::resources::gpu::{GpuDevice, GpuProbe};
use nvml_wrapper::enum_wrappers::device::{EccCounter, MemoryError};
use nvml_wrapper::Nvml;

pub struct NvmlProbe {
    nvml: Nvml,
}

impl NvmlProbe {
    pub fn new() -> Result<Self> {
        let nvml = Nvml::init().map_err(|e| {
            WorkerError::io("nvml initialization failed").with_source(e)
        })?;
        Ok(NvmlProbe { nvml })
    }
}

impl GpuProbe for NvmlProbe {
    fn enumerate(&self) -> Result<Vec<GpuDevice>> {
        let count = self
            .nvml
            .device_count()
            .map_err(|e| WorkerError::io("nvml device count failed").with_source(e))?;

        let mut devices = Vec::with_capacity(count as usize);
        for index in 0..count {
            let device = self
                .nvml
                .device_by_index(index)
                .map_err(|e| WorkerError::io("nvml device lookup failed").with_source(e))?;
            let uuid = device
                .uuid()
                .map_err(|e| WorkerError::io("nvml uuid read failed").with_source(e))?;
            let name = device
                .name()
                .map_err(|e| WorkerError::io("nvml name read failed").with_source(e))?;
            let memory = device
                .memory_info()
                .map_err(|e| WorkerError::io("nvml memory read failed").with_source(e))?;

            devices.push(GpuDevice {
                uuid,
                name,
                index,
                free_mem: memory.free,
                total_mem: memory.total,
            });
        }
        Ok(devices)
    }

    fn ecc_failures(&self) -> Result<Vec<(String, String)>> {
        let count = self
            .nvml
            .device_count()
            .map_err(|e| WorkerError::io("nvml device count failed").with_source(e))?;

        let mut failures = Vec::new();
        for index in 0..count {
            let device = self
                .nvml
                .device_by_index(index)
                .map_err(|e| WorkerError::io("nvml device lookup failed").with_source(e))?;
            let uuid = device
                .uuid()
                .map_err(|e| WorkerError::io("nvml uuid read failed").with_source(e))?;

            // Cards without ECC report NotSupported; that is not a failure
            match device.total_ecc_errors(MemoryError::Uncorrected, EccCounter::Aggregate) {
                Ok(errors) if errors > 0 => {
                    failures.push((uuid, format!("{} uncorrected ecc errors", errors)));
                }
                Ok(_) => {}
                Err(nvml_wrapper::error::NvmlError::NotSupported) => {}
                Err(e) => {
                    log::warn!("ecc counter read failed for {}: {}", uuid, e);
                }
            }
        }
        Ok(failures)
    }
}
