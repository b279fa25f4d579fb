//! Experiment request data model
//!
//! The JSON shapes here mirror what the python client emits, wire names
//! included, so requests round-trip byte-compatibly through the envelope.

use crate::error::{Result, WorkerError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Human-readable resource demand attached to every experiment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(default)]
    pub cpus: u32,
    #[serde(default)]
    pub gpus: u32,
    #[serde(default)]
    pub hdd: String,
    #[serde(default)]
    pub ram: String,
    #[serde(rename = "gpuMem", default)]
    pub gpu_mem: String,
}

/// A named reference to an external blob
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(rename = "local", default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
    #[serde(default)]
    pub mutable: bool,
    #[serde(default)]
    pub unpack: bool,
    #[serde(default)]
    pub qualified: String,
}

impl Artifact {
    /// Whether the artifact lives on the local filesystem
    pub fn is_local(&self) -> bool {
        self.qualified.starts_with("file://")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub key: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub artifacts: HashMap<String, Artifact>,
    #[serde(rename = "pythonenv", default)]
    pub python_env: Vec<String>,
    #[serde(rename = "pythonver", default)]
    pub python_ver: String,
    #[serde(rename = "resources_needed", default)]
    pub resource: Resource,
    #[serde(default)]
    pub time_added: f64,
    #[serde(default)]
    pub max_duration: String,
}

/// Submission-side configuration that rides along with the experiment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestConfig {
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub pip: Vec<String>,
    #[serde(default)]
    pub lifetime: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub experiment: Experiment,
    #[serde(default)]
    pub config: RequestConfig,
}

impl Request {
    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| WorkerError::malformed("request json parse failed").with_source(e))
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| WorkerError::malformed("request json encode failed").with_source(e))
    }

    /// Mutable artifacts are candidates for upload after the run
    pub fn mutable_artifacts(&self) -> impl Iterator<Item = (&String, &Artifact)> {
        self.experiment
            .artifacts
            .iter()
            .filter(|(_, art)| art.mutable)
    }
}
