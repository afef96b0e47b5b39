//! Common test utilities for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use stratum_core::alloc::BlockPool;
use stratum_core::config::{BatchConfig, BlockPoolConfig, DeviceConfig, StatePoolConfig};
use stratum_core::device::{Device, Queue};
use stratum_core::kernel::{HostKernel, MemoryProvider};

/// Create a host kernel for testing.
pub fn test_kernel() -> Arc<HostKernel> {
    Arc::new(HostKernel::new())
}

/// Create a block pool with the given block size over `provider`.
pub fn test_block_pool(block_size: u32, provider: Arc<dyn MemoryProvider>) -> Arc<BlockPool> {
    let config = BlockPoolConfig::default().with_block_size(block_size);
    Arc::new(BlockPool::new("test", &config, provider).expect("valid block pool config"))
}

/// Create a device config with small pools so growth happens early.
pub fn small_device_config() -> DeviceConfig {
    DeviceConfig::default()
        .with_block_size(256)
        .with_state_pool(StatePoolConfig::default().with_size_classes(6, 8))
        .with_batch(BatchConfig::default().with_buffer_size(256))
}

/// Create a device and a queue over one host kernel.
pub fn test_device(config: DeviceConfig) -> (Arc<HostKernel>, Arc<Device>, Queue) {
    let kernel = test_kernel();
    let device = Device::new(config, kernel.clone()).expect("valid device config");
    let queue = Queue::new(device.clone(), kernel.clone());
    (kernel, device, queue)
}

/// Read a little-endian u64 out of a buffer object of the host kernel.
pub fn read_u64(kernel: &HostKernel, handle: stratum_core::BoHandle, offset: u32) -> u64 {
    let bytes = kernel
        .read(handle, u64::from(offset), 8)
        .expect("range inside buffer object");
    u64::from_le_bytes(bytes.try_into().expect("eight bytes"))
}
