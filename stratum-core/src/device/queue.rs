//! Submission of finalized buffer tables.

use super::Device;
use crate::error::{Result, StratumError};
use crate::exec::ExecBuffer;
use crate::kernel::Submitter;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Hands buffer tables to a [`Submitter`] and records where the kernel
/// placed every buffer.
pub struct Queue {
    device: Arc<Device>,
    submitter: Arc<dyn Submitter>,
    serial: AtomicU64,
}

impl Queue {
    /// Create a queue for `device`.
    pub fn new(device: Arc<Device>, submitter: Arc<dyn Submitter>) -> Self {
        Self {
            device,
            submitter,
            serial: AtomicU64::new(0),
        }
    }

    /// The device this queue submits for.
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Serial of the last successful submission, zero if none.
    pub fn last_serial(&self) -> u64 {
        self.serial.load(Ordering::Acquire)
    }

    /// Execute `exec` and return its serial.
    ///
    /// Addresses reported by the kernel are written back into the buffer
    /// objects, so the next finalize sees any move as a stale relocation.
    pub fn submit(&self, exec: &ExecBuffer) -> Result<u64> {
        let _guard = self.device.exec_lock().lock();
        let addresses = self.submitter.execute(exec).inspect_err(|e| {
            tracing::error!(code = e.code(), error = %e, "submission failed");
        })?;
        if addresses.len() != exec.objects().len() {
            return Err(StratumError::Submission {
                cause: format!(
                    "kernel returned {} addresses for {} buffers",
                    addresses.len(),
                    exec.objects().len()
                ),
            });
        }

        let mut moved = 0;
        for (object, address) in exec.objects().iter().zip(addresses) {
            if object.bo.address() != address {
                moved += 1;
                object.bo.set_address(address);
            }
        }

        let serial = self.serial.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(
            serial,
            buffers = exec.objects().len(),
            relocations = exec.relocation_count(),
            moved,
            "submitted buffer table"
        );
        Ok(serial)
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("last_serial", &self.last_serial())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::device::CommandRecording;
    use crate::kernel::{HostKernel, MemoryProvider};
    use crate::types::GpuAddress;

    #[test]
    fn submit_writes_back_moved_addresses() {
        let kernel = Arc::new(HostKernel::new());
        let device = Device::new(DeviceConfig::default(), kernel.clone()).unwrap();
        let queue = Queue::new(device.clone(), kernel.clone());
        let target = device.batch_pool().alloc().unwrap();

        let mut rec = CommandRecording::new(&device).unwrap();
        rec.emit_address_command(0x7000_0000, &target, 4).unwrap();
        let exec = rec.end().unwrap();
        assert!(exec.no_reloc());
        assert_eq!(queue.submit(&exec).unwrap(), 1);

        kernel.move_buffer(target.handle(), GpuAddress::new(0x7_0000_0000));
        assert_eq!(queue.submit(&exec).unwrap(), 2);
        assert_eq!(target.address(), GpuAddress::new(0x7_0000_0000));

        let submissions = kernel.submissions();
        assert_eq!(submissions[0].patched, 0);
        assert_eq!(submissions[1].patched, 1);
        assert_eq!(queue.last_serial(), 2);
    }

    #[test]
    fn failed_submission_keeps_serial() {
        let kernel = Arc::new(HostKernel::new());
        let device = Device::new(DeviceConfig::default(), kernel.clone()).unwrap();
        let queue = Queue::new(device.clone(), kernel.clone());

        let mut rec = CommandRecording::new(&device).unwrap();
        rec.emit_dwords(&[0]).unwrap();
        let exec = rec.end().unwrap();
        let entry = exec.objects().last().unwrap().handle;
        kernel.close(entry);

        let err = queue.submit(&exec).unwrap_err();
        assert_eq!(err.code(), "E301");
        assert_eq!(queue.last_serial(), 0);
    }
}
