//! One command recording session.

use super::Device;
use crate::alloc::StateStream;
use crate::batch::{Batch, BatchBufferSource, RelocList};
use crate::error::{Result, StratumError};
use crate::exec::ExecBuffer;
use crate::kernel::BufferObject;
use crate::types::State;
use std::sync::Arc;

/// Keep the first error of a recording.
fn latch<T>(slot: &mut Option<StratumError>, result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        if slot.is_none() {
            tracing::warn!(code = e.code(), error = %e, "command recording failed");
            *slot = Some(e.clone());
        }
    }
    result
}

/// A batch plus the transient state and relocations recorded with it.
///
/// Single-threaded: a recording belongs to whichever thread is filling
/// it. The first failure is remembered and reported again by
/// [`end`](Self::end), so the code filling the batch can stop checking
/// errors command by command.
pub struct CommandRecording {
    device: Arc<Device>,
    batch: Batch,
    dynamic_stream: StateStream,
    surface_stream: StateStream,
    surface_relocs: RelocList,
    error: Option<StratumError>,
}

impl CommandRecording {
    /// Open a session with one batch buffer and empty state streams.
    pub fn new(device: &Arc<Device>) -> Result<Self> {
        let source: Arc<dyn BatchBufferSource> = device.batch_pool().clone();
        let batch = Batch::new(source, device.config().batch.reloc_capacity)?;
        Ok(Self {
            device: Arc::clone(device),
            batch,
            dynamic_stream: StateStream::new(device.dynamic_state_pool().clone()),
            surface_stream: StateStream::new(device.surface_state_pool().clone()),
            surface_relocs: RelocList::with_capacity(device.config().batch.reloc_capacity),
            error: None,
        })
    }

    /// The device this session records for.
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// The batch being recorded.
    pub fn batch(&self) -> &Batch {
        &self.batch
    }

    /// Direct access to the batch. Errors from it are not latched.
    pub fn batch_mut(&mut self) -> &mut Batch {
        &mut self.batch
    }

    /// Relocations recorded into surface state.
    pub fn surface_relocs(&self) -> &RelocList {
        &self.surface_relocs
    }

    /// First error recorded so far, if any.
    pub fn error(&self) -> Option<&StratumError> {
        self.error.as_ref()
    }

    /// Reserve `dwords` in the batch.
    pub fn emit(&mut self, dwords: u32) -> Result<&mut [u32]> {
        latch(&mut self.error, self.batch.emit(dwords))
    }

    /// Append `words` to the batch.
    pub fn emit_dwords(&mut self, words: &[u32]) -> Result<()> {
        latch(&mut self.error, self.batch.emit_dwords(words))
    }

    /// Append a three-dword command: `header` followed by the address of
    /// `target` plus `delta`.
    pub fn emit_address_command(
        &mut self,
        header: u32,
        target: &Arc<BufferObject>,
        delta: u32,
    ) -> Result<()> {
        let result = self.batch.command(3).and_then(|mut cmd| {
            cmd.set(0, header);
            cmd.set_address(1, target, delta)?;
            Ok(())
        });
        latch(&mut self.error, result)
    }

    /// Allocate transient dynamic state, freed by [`reset`](Self::reset).
    pub fn alloc_dynamic_state(&mut self, size: u32, align: u32) -> Result<State> {
        latch(&mut self.error, self.dynamic_stream.alloc(size, align))
    }

    /// Allocate transient surface state, freed by [`reset`](Self::reset).
    pub fn alloc_surface_state(&mut self, size: u32, align: u32) -> Result<State> {
        latch(&mut self.error, self.surface_stream.alloc(size, align))
    }

    /// Write the address of `target` plus `delta` at byte `at` of a surface
    /// state and record the relocation against the surface state pool.
    pub fn add_surface_reloc(
        &mut self,
        state: &mut State,
        at: u32,
        target: &Arc<BufferObject>,
        delta: u32,
    ) -> Result<()> {
        let location = state.offset() + at;
        let address = latch(
            &mut self.error,
            self.surface_relocs.add(location, target, delta),
        )?;
        state.write(at, &address.as_u64().to_le_bytes());
        Ok(())
    }

    /// Splice the commands of `secondary` into this batch.
    ///
    /// A single-buffer secondary is copied inline; a chained one is copied
    /// into fresh buffers that this batch chains through (see
    /// [`Batch::emit_batch`]). `secondary` must still be recording. Its
    /// surface relocations are merged as well; its state stays owned by
    /// `secondary`, which must outlive every submission of this recording.
    pub fn execute_secondary(&mut self, secondary: &CommandRecording) -> Result<()> {
        let result = self.batch.emit_batch(&secondary.batch);
        latch(&mut self.error, result)?;
        let result = self.surface_relocs.append(&secondary.surface_relocs, 0);
        latch(&mut self.error, result)
    }

    /// Terminate the batch and build its buffer table.
    ///
    /// Surface state relocations go first, then the batch buffers from
    /// newest to oldest; the first buffer is where execution starts.
    pub fn end(&mut self) -> Result<ExecBuffer> {
        if let Some(e) = &self.error {
            return Err(e.clone());
        }
        let result = self.batch.end();
        latch(&mut self.error, result)?;

        let mut builder = self.device.exec_lock().builder();
        if !self.surface_relocs.is_empty() {
            let surface = self.device.surface_state_pool().bo();
            builder.add_buffer(surface, self.surface_relocs.as_slice());
        }
        let buffers = self.batch.buffers();
        for (index, buffer) in buffers.iter().enumerate().rev() {
            if let Some(bo) = buffer.bo() {
                builder.add_buffer(bo, self.batch.buffer_relocs(index));
            }
        }
        let entry = buffers
            .first()
            .and_then(|b| b.bo().map(|bo| (bo, b.length())))
            .ok_or_else(|| StratumError::Submission {
                cause: "recording has no batch buffer".to_string(),
            })?;
        builder.finish(entry.0, entry.1)
    }

    /// Discard everything recorded and start over with the first buffer.
    pub fn reset(&mut self) {
        self.batch.reset();
        self.dynamic_stream.finish();
        self.surface_stream.finish();
        self.surface_relocs.clear();
        self.error = None;
    }
}

impl std::fmt::Debug for CommandRecording {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRecording")
            .field("batch", &self.batch)
            .field("surface_relocs", &self.surface_relocs.len())
            .field("error", &self.error)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{MI_BATCH_BUFFER_END, MI_NOOP};
    use crate::config::{BatchConfig, DeviceConfig};
    use crate::kernel::HostKernel;

    fn device(batch_size: u32) -> Arc<Device> {
        let config =
            DeviceConfig::default().with_batch(BatchConfig::default().with_buffer_size(batch_size));
        Device::new(config, Arc::new(HostKernel::new())).unwrap()
    }

    #[test]
    fn end_puts_entry_buffer_last() {
        let device = device(128);
        let target = device.batch_pool().alloc().unwrap();
        let mut rec = CommandRecording::new(&device).unwrap();
        for _ in 0..20 {
            rec.emit_address_command(0x7000_0000, &target, 0).unwrap();
        }
        let exec = rec.end().unwrap();

        let first = rec.batch().buffers()[0].bo().unwrap();
        assert_eq!(exec.objects().last().unwrap().handle, first.handle());
        assert_eq!(exec.batch_len(), rec.batch().buffers()[0].length());
        assert!(exec.no_reloc());
        // Every chained buffer and the target appear once.
        assert_eq!(exec.objects().len(), rec.batch().buffers().len() + 1);
        assert_eq!(exec.relocation_count(), rec.batch().relocs().len());
    }

    #[test]
    fn surface_relocs_are_written_and_registered() {
        let device = device(4096);
        let target = device.batch_pool().alloc().unwrap();
        let mut rec = CommandRecording::new(&device).unwrap();
        let mut state = rec.alloc_surface_state(64, 64).unwrap();
        rec.add_surface_reloc(&mut state, 16, &target, 0x40).unwrap();

        let mut bytes = [0u8; 8];
        state.read(16, &mut bytes);
        assert_eq!(u64::from_le_bytes(bytes), target.address().as_u64() + 0x40);

        rec.emit_dwords(&[0x1234]).unwrap();
        let exec = rec.end().unwrap();
        let surface = device.surface_state_pool().bo();
        let index = exec.index_of(surface).unwrap();
        let entry = exec.objects()[index].relocations[0];
        assert_eq!(entry.offset, state.offset() + 16);
        assert_eq!(entry.delta, 0x40);
    }

    #[test]
    fn end_reports_latched_error() {
        let device = device(4096);
        let mut rec = CommandRecording::new(&device).unwrap();
        let err = rec.alloc_dynamic_state(1 << 20, 64).unwrap_err();
        assert_eq!(err.code(), "E102");
        rec.emit_dwords(&[1, 2]).unwrap();

        let reported = rec.end().unwrap_err();
        assert_eq!(reported.code(), "E102");

        rec.reset();
        assert!(rec.error().is_none());
        rec.emit_dwords(&[1]).unwrap();
        assert!(rec.end().is_ok());
    }

    #[test]
    fn execute_secondary_splices_commands() {
        let device = device(4096);
        let target = device.batch_pool().alloc().unwrap();

        let mut secondary = CommandRecording::new(&device).unwrap();
        secondary.emit_address_command(0x7300_0000, &target, 8).unwrap();

        let mut primary = CommandRecording::new(&device).unwrap();
        primary.emit_dwords(&[0xabcd]).unwrap();
        primary.execute_secondary(&secondary).unwrap();
        let exec = primary.end().unwrap();

        let words = primary.batch().recorded(0);
        assert_eq!(words[1], 0x7300_0000);
        assert_eq!(&words[4..], &[MI_BATCH_BUFFER_END, MI_NOOP]);
        assert_eq!(primary.batch().relocs().as_slice()[0].location, 8);
        assert!(exec.index_of(&target).is_some());
    }

    #[test]
    fn reset_returns_stream_blocks() {
        let device = device(4096);
        let mut rec = CommandRecording::new(&device).unwrap();
        for _ in 0..10 {
            let _ = rec.alloc_dynamic_state(1024, 64).unwrap();
        }
        let stats = device.dynamic_state_pool().stats();
        assert!(stats.live_blocks() > 0);
        rec.reset();
        assert_eq!(device.dynamic_state_pool().stats().live_blocks(), 0);
    }

    #[test]
    fn execute_secondary_copies_a_chained_secondary() {
        let device = device(128);
        let target = device.batch_pool().alloc().unwrap();

        let mut secondary = CommandRecording::new(&device).unwrap();
        for i in 0..25 {
            secondary.emit_address_command(0x7500_0000, &target, i * 8).unwrap();
        }
        assert!(secondary.batch().buffers().len() > 1);

        let mut primary = CommandRecording::new(&device).unwrap();
        primary.emit_dwords(&[0xabcd]).unwrap();
        primary.execute_secondary(&secondary).unwrap();
        primary.emit_dwords(&[0xef01]).unwrap();
        let exec = primary.end().unwrap();

        // One table entry per primary buffer plus the target, none of them
        // the secondary's buffers.
        let buffers = primary.batch().buffers();
        assert_eq!(exec.objects().len(), buffers.len() + 1);
        for buffer in secondary.batch().buffers() {
            assert!(exec.index_of(buffer.bo().unwrap()).is_none());
        }
        let address_relocs = primary
            .batch()
            .relocs()
            .iter()
            .filter(|r| Arc::ptr_eq(&r.target, &target))
            .count();
        assert_eq!(address_relocs, 25);
        assert_eq!(exec.relocation_count(), primary.batch().relocs().len());
    }

    #[test]
    fn reset_revokes_stream_states() {
        let device = device(4096);
        let mut rec = CommandRecording::new(&device).unwrap();
        let state = rec.alloc_dynamic_state(64, 64).unwrap();
        assert!(state.is_live());
        rec.reset();
        assert!(!state.is_live());
    }
}
