//! Process-wide backend environment.
//!
//! The device capability and the model database are handed to the node at
//! construction instead of living in singletons, so tests can build as
//! many environments as they need.

use std::sync::Arc;

use crate::model::{ModelDatabase, SharedDatabase};

/// The GPU this node serves from. The concrete driver stack is opaque;
/// only identity and capacity are exposed to the control plane.
#[derive(Debug, Clone)]
pub struct GpuDevice {
    pub gpu_id: u32,
    pub device_name: String,
    pub total_memory: u64,
    pub free_memory: u64,
}

impl GpuDevice {
    /// Probe device `gpu_id`.
    pub fn probe(gpu_id: u32) -> Self {
        const DEVICE_MEMORY: u64 = 16 * 1024 * 1024 * 1024;
        Self {
            gpu_id,
            device_name: format!("gpu-{gpu_id}"),
            total_memory: DEVICE_MEMORY,
            free_memory: DEVICE_MEMORY,
        }
    }
}

/// Everything the node needs from the process environment.
pub struct BackendEnvironment {
    pub device: GpuDevice,
    pub model_db: SharedDatabase,
}

impl BackendEnvironment {
    pub fn new(device: GpuDevice, model_db: ModelDatabase) -> Arc<Self> {
        Arc::new(Self { device, model_db: Arc::new(model_db) })
    }
}
