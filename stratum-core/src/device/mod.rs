//! Device context, recording sessions and submission.
//!
//! A [`Device`] owns every long-lived pool and is shared by reference
//! count. Recording sessions and queues each hold an `Arc<Device>`, so the
//! pools outlive every state handle and batch buffer they hand out.

mod queue;
mod recording;

pub use queue::Queue;
pub use recording::CommandRecording;

use crate::alloc::{BlockPool, BoPool, StatePool};
use crate::config::DeviceConfig;
use crate::error::Result;
use crate::exec::ExecLock;
use crate::kernel::MemoryProvider;
use std::sync::Arc;

/// Device-wide pools over one kernel memory provider.
pub struct Device {
    config: DeviceConfig,
    provider: Arc<dyn MemoryProvider>,
    batch_pool: Arc<BoPool>,
    dynamic_state_pool: Arc<BlockPool>,
    surface_state_pool: Arc<BlockPool>,
    instruction_pool: Arc<BlockPool>,
    dynamic_state: StatePool,
    surface_state: StatePool,
    exec_lock: ExecLock,
}

impl Device {
    /// Validate `config` and build every pool. Block pools start empty and
    /// grow on first use.
    pub fn new(config: DeviceConfig, provider: Arc<dyn MemoryProvider>) -> Result<Arc<Self>> {
        config.validate()?;

        let batch_pool = Arc::new(BoPool::new(provider.clone(), config.batch.buffer_size));
        let dynamic_state_pool = Arc::new(BlockPool::new(
            "dynamic_state",
            &config.dynamic_state,
            provider.clone(),
        )?);
        let surface_state_pool = Arc::new(BlockPool::new(
            "surface_state",
            &config.surface_state,
            provider.clone(),
        )?);
        let instruction_pool = Arc::new(BlockPool::new(
            "instruction",
            &config.instruction,
            provider.clone(),
        )?);
        let dynamic_state = StatePool::new(dynamic_state_pool.clone(), &config.state_pool)?;
        let surface_state = StatePool::new(surface_state_pool.clone(), &config.state_pool)?;

        tracing::info!(
            block_size = config.dynamic_state.block_size,
            batch_size = config.batch.buffer_size,
            "device created"
        );

        Ok(Arc::new(Self {
            config,
            provider,
            batch_pool,
            dynamic_state_pool,
            surface_state_pool,
            instruction_pool,
            dynamic_state,
            surface_state,
            exec_lock: ExecLock::new(),
        }))
    }

    /// Effective configuration.
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Kernel memory provider.
    pub fn provider(&self) -> &Arc<dyn MemoryProvider> {
        &self.provider
    }

    /// Pool of batch buffers.
    pub fn batch_pool(&self) -> &Arc<BoPool> {
        &self.batch_pool
    }

    /// Block pool behind dynamic state.
    pub fn dynamic_state_pool(&self) -> &Arc<BlockPool> {
        &self.dynamic_state_pool
    }

    /// Block pool behind surface state.
    pub fn surface_state_pool(&self) -> &Arc<BlockPool> {
        &self.surface_state_pool
    }

    /// Block pool for shader kernels.
    pub fn instruction_pool(&self) -> &Arc<BlockPool> {
        &self.instruction_pool
    }

    /// Long-lived dynamic state.
    pub fn dynamic_state(&self) -> &StatePool {
        &self.dynamic_state
    }

    /// Long-lived surface state.
    pub fn surface_state(&self) -> &StatePool {
        &self.surface_state
    }

    /// Lock serializing buffer table construction and submission.
    pub fn exec_lock(&self) -> &ExecLock {
        &self.exec_lock
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("config", &self.config)
            .field("batch_pool", &self.batch_pool)
            .field("dynamic_state_pool", &self.dynamic_state_pool)
            .field("surface_state_pool", &self.surface_state_pool)
            .field("instruction_pool", &self.instruction_pool)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::HostKernel;

    #[test]
    fn new_builds_empty_pools() {
        let kernel = Arc::new(HostKernel::new());
        let device = Device::new(DeviceConfig::default(), kernel.clone()).unwrap();
        assert_eq!(device.dynamic_state_pool().size(), 0);
        assert_eq!(device.instruction_pool().name(), "instruction");
        assert_eq!(kernel.object_count(), 0);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = DeviceConfig::default().with_block_size(1000);
        let err = Device::new(config, Arc::new(HostKernel::new())).unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn drop_releases_kernel_objects() {
        let kernel = Arc::new(HostKernel::new());
        {
            let device = Device::new(DeviceConfig::default(), kernel.clone()).unwrap();
            let state = device.dynamic_state().alloc(64, 64).unwrap();
            device.dynamic_state().free(state);
            let bo = device.batch_pool().alloc().unwrap();
            device.batch_pool().free(bo);
            assert!(kernel.object_count() >= 2);
        }
        assert_eq!(kernel.object_count(), 0);
    }
}
