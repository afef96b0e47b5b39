//! Append-only command batch with automatic chaining.

use super::command::{
    BATCH_BUFFER_START_DWORDS, CHAIN_RESERVE, MI_BATCH_BUFFER_END, MI_BATCH_BUFFER_START, MI_NOOP,
};
use super::reloc::{RelocList, Relocation};
use crate::alloc::BoPool;
use crate::config::DEFAULT_RELOC_CAPACITY;
use crate::error::{Result, StratumError};
use crate::kernel::BufferObject;
use crate::types::GpuAddress;
use std::ops::Range;
use std::sync::Arc;

/// Supplies fresh batch buffers when a batch fills up.
pub trait BatchBufferSource: Send + Sync {
    /// Size of every buffer this source hands out.
    fn buffer_size(&self) -> u32;

    /// Get a CPU-mapped buffer of [`buffer_size`](Self::buffer_size) bytes.
    fn acquire(&self) -> Result<Arc<BufferObject>>;

    /// Give a buffer back once the batch no longer uses it.
    fn release(&self, bo: Arc<BufferObject>);
}

impl BatchBufferSource for BoPool {
    fn buffer_size(&self) -> u32 {
        self.bo_size()
    }

    fn acquire(&self) -> Result<Arc<BufferObject>> {
        self.alloc()
    }

    fn release(&self, bo: Arc<BufferObject>) {
        self.free(bo);
    }
}

enum Storage {
    /// Fixed host memory for precompiled sequences that are spliced into
    /// live batches and never submitted on their own.
    Host(Vec<u32>),
    /// A mapped buffer object owned by this batch while recording.
    Bo(Arc<BufferObject>),
}

/// One buffer of a batch chain.
pub struct BatchBuffer {
    storage: Storage,
    capacity: u32,
    length: u32,
    jump_offset: Option<u32>,
    first_reloc: usize,
    num_relocs: usize,
}

impl BatchBuffer {
    fn new(storage: Storage, capacity: u32, first_reloc: usize) -> Self {
        Self {
            storage,
            capacity,
            length: 0,
            jump_offset: None,
            first_reloc,
            num_relocs: 0,
        }
    }

    /// Backing buffer object, `None` for host batches.
    pub fn bo(&self) -> Option<&Arc<BufferObject>> {
        match &self.storage {
            Storage::Bo(bo) => Some(bo),
            Storage::Host(_) => None,
        }
    }

    /// Bytes recorded into this buffer. Set when the buffer is finished.
    pub fn length(&self) -> u32 {
        self.length
    }

    /// Offset of the chaining jump, if this buffer continues in another.
    pub fn jump_offset(&self) -> Option<u32> {
        self.jump_offset
    }

    /// Range of the batch relocation list whose locations are in this buffer.
    pub fn reloc_range(&self) -> Range<usize> {
        self.first_reloc..self.first_reloc + self.num_relocs
    }

    fn words(&self) -> &[u32] {
        match &self.storage {
            Storage::Host(words) => words,
            Storage::Bo(bo) => match bo.map_ptr() {
                // SAFETY: the batch owns the buffer while recording, the
                // mapping is page aligned and covers `capacity` bytes.
                Some(map) => unsafe {
                    let len = self.capacity as usize / 4;
                    std::slice::from_raw_parts(map.as_ptr().cast::<u32>(), len)
                },
                None => &[],
            },
        }
    }

    fn words_mut(&mut self) -> &mut [u32] {
        match &mut self.storage {
            Storage::Host(words) => words,
            Storage::Bo(bo) => match bo.map_ptr() {
                // SAFETY: see `words`; `&mut self` makes the slice unique.
                Some(map) => unsafe {
                    let len = self.capacity as usize / 4;
                    std::slice::from_raw_parts_mut(map.as_ptr().cast::<u32>(), len)
                },
                None => &mut [],
            },
        }
    }
}

/// A command being written into reserved batch space.
pub struct Command<'a> {
    batch: &'a mut Batch,
    at: u32,
    dwords: u32,
}

impl Command<'_> {
    /// Byte offset of the command inside the current buffer.
    pub fn offset(&self) -> u32 {
        self.at
    }

    /// Write dword `index` of the command.
    pub fn set(&mut self, index: u32, word: u32) -> &mut Self {
        debug_assert!(index < self.dwords, "dword {index} outside command");
        let base = (self.at / 4) as usize;
        self.batch.current_mut().words_mut()[base + index as usize] = word;
        self
    }

    /// Write a relocated 48-bit address into dwords `index` and `index + 1`.
    pub fn set_address(
        &mut self,
        index: u32,
        target: &Arc<BufferObject>,
        delta: u32,
    ) -> Result<&mut Self> {
        debug_assert!(index + 1 < self.dwords, "address outside command");
        let address = self.batch.relocs.add(self.at + index * 4, target, delta)?;
        let (low, high) = address.to_dwords();
        self.set(index, low);
        self.set(index + 1, high);
        Ok(self)
    }
}

/// Recording state of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    /// Accepting commands.
    Recording,
    /// Terminated by [`Batch::end`].
    Finished,
}

/// An in-progress command stream.
///
/// Commands go into the current buffer. When a command does not fit and the
/// batch has a [`BatchBufferSource`], a new buffer is acquired, a jump to it
/// is written into the space held back at the end of the full buffer and
/// recording continues in the new one. All buffers share one relocation
/// list; each buffer knows the range of it that belongs to it.
pub struct Batch {
    buffers: Vec<BatchBuffer>,
    relocs: RelocList,
    next: u32,
    end: u32,
    source: Option<Arc<dyn BatchBufferSource>>,
    state: BatchState,
}

impl Batch {
    /// Create a chaining batch whose buffers come from `source`.
    pub fn new(source: Arc<dyn BatchBufferSource>, reloc_capacity: usize) -> Result<Self> {
        let capacity = source.buffer_size();
        let end = capacity
            .checked_sub(CHAIN_RESERVE)
            .ok_or(StratumError::BatchOverflow {
                requested: CHAIN_RESERVE,
                available: capacity,
            })?;
        let bo = source.acquire()?;
        Ok(Self {
            buffers: vec![BatchBuffer::new(Storage::Bo(bo), capacity, 0)],
            relocs: RelocList::with_capacity(reloc_capacity),
            next: 0,
            end,
            source: Some(source),
            state: BatchState::Recording,
        })
    }

    /// Create a fixed-size batch in host memory. It cannot chain; running
    /// out of room is a [`StratumError::BatchOverflow`].
    pub fn host(capacity: u32) -> Self {
        let capacity = capacity & !3;
        Self {
            buffers: vec![BatchBuffer::new(
                Storage::Host(vec![0; capacity as usize / 4]),
                capacity,
                0,
            )],
            relocs: RelocList::with_capacity(DEFAULT_RELOC_CAPACITY),
            next: 0,
            end: capacity,
            source: None,
            state: BatchState::Recording,
        }
    }

    /// Current recording state.
    pub fn state(&self) -> BatchState {
        self.state
    }

    /// Byte offset of the next command in the current buffer.
    pub fn offset(&self) -> u32 {
        self.next
    }

    /// The chain, oldest buffer first.
    pub fn buffers(&self) -> &[BatchBuffer] {
        &self.buffers
    }

    /// The relocation list shared by every buffer.
    pub fn relocs(&self) -> &RelocList {
        &self.relocs
    }

    /// Relocations located in buffer `index`.
    pub fn buffer_relocs(&self, index: usize) -> &[Relocation] {
        let range = if index + 1 == self.buffers.len() && self.state == BatchState::Recording {
            self.buffers[index].first_reloc..self.relocs.len()
        } else {
            self.buffers[index].reloc_range()
        };
        &self.relocs.as_slice()[range]
    }

    /// Words recorded into buffer `index` so far.
    pub fn recorded(&self, index: usize) -> &[u32] {
        let buffer = &self.buffers[index];
        let len = if index + 1 == self.buffers.len() && self.state == BatchState::Recording {
            self.next
        } else {
            buffer.length
        };
        &buffer.words()[..(len / 4) as usize]
    }

    /// Reserve `dwords` contiguous dwords and return them for writing.
    pub fn emit(&mut self, dwords: u32) -> Result<&mut [u32]> {
        let bytes = self.bytes_for(dwords as usize)?;
        let at = self.reserve(bytes)?;
        let base = (at / 4) as usize;
        Ok(&mut self.current_mut().words_mut()[base..base + dwords as usize])
    }

    /// Append `words` as one command.
    pub fn emit_dwords(&mut self, words: &[u32]) -> Result<()> {
        let dwords = u32::try_from(words.len()).map_err(|_| self.overflow(u32::MAX))?;
        self.emit(dwords)?.copy_from_slice(words);
        Ok(())
    }

    /// Reserve a command of `dwords` dwords for field-wise writing.
    pub fn command(&mut self, dwords: u32) -> Result<Command<'_>> {
        let bytes = self.bytes_for(dwords as usize)?;
        let at = self.reserve(bytes)?;
        Ok(Command {
            batch: self,
            at,
            dwords,
        })
    }

    /// Record a relocation at `location` in the current buffer.
    pub fn emit_reloc(
        &mut self,
        location: u32,
        target: &Arc<BufferObject>,
        delta: u32,
    ) -> Result<GpuAddress> {
        debug_assert!(location < self.next, "relocation outside recorded commands");
        self.relocs.add(location, target, delta)
    }

    /// Copy the commands recorded in `other` into this batch, together with
    /// their relocations.
    ///
    /// A single-buffer `other` is copied in place, chaining only if it does
    /// not fit. A chained `other` is copied buffer by buffer: this batch
    /// jumps to a fresh buffer holding the first one, every further buffer
    /// gets its own fresh buffer and recording continues after the last.
    /// `other`'s own jumps are dropped and re-emitted against the copies.
    ///
    /// `other` must still be recording. Every size check happens before
    /// this batch is touched, so a rejected splice leaves it unchanged.
    pub fn emit_batch(&mut self, other: &Batch) -> Result<()> {
        debug_assert_eq!(other.state, BatchState::Recording, "spliced batch is terminated");
        let segments = other.segments();
        let limit = self.buffer_limit();
        let mut total = 0u32;
        for (words, _) in &segments {
            let bytes = self.bytes_for(words.len())?;
            if bytes > limit {
                return Err(self.overflow(bytes));
            }
            total = total.checked_add(bytes).ok_or_else(|| self.overflow(u32::MAX))?;
        }
        if self.source.is_none() && total > self.end - self.next {
            return Err(self.overflow(total));
        }
        self.relocs.reserve(other.relocs.len() + segments.len())?;

        let chained = segments.len() > 1 && self.source.is_some();
        for (i, (words, relocs)) in segments.into_iter().enumerate() {
            if chained && (i > 0 || self.next > 0) {
                self.chain()?;
            }
            let bytes = self.bytes_for(words.len())?;
            let at = self.reserve(bytes)?;
            let base = (at / 4) as usize;
            self.current_mut().words_mut()[base..base + words.len()].copy_from_slice(words);
            self.relocs.extend_shifted(relocs, at)?;
        }
        Ok(())
    }

    /// Terminate the batch: emit the end command and pad to 8 bytes.
    pub fn end(&mut self) -> Result<()> {
        debug_assert_eq!(self.state, BatchState::Recording, "batch already ended");
        self.emit_dwords(&[MI_BATCH_BUFFER_END])?;
        if self.next % 8 != 0 {
            self.emit_dwords(&[MI_NOOP])?;
        }
        self.finish_current();
        self.state = BatchState::Finished;
        Ok(())
    }

    /// Drop all but the first buffer and every relocation, and start
    /// recording again.
    pub fn reset(&mut self) {
        for buffer in self.buffers.drain(1..) {
            if let (Some(source), Storage::Bo(bo)) = (&self.source, buffer.storage) {
                source.release(bo);
            }
        }
        let first = &mut self.buffers[0];
        first.length = 0;
        first.jump_offset = None;
        first.first_reloc = 0;
        first.num_relocs = 0;
        self.end = first.capacity - if self.source.is_some() { CHAIN_RESERVE } else { 0 };
        self.relocs.clear();
        self.next = 0;
        self.state = BatchState::Recording;
    }

    /// Recorded payload and relocations of every buffer, without the
    /// chaining jumps and their relocations.
    fn segments(&self) -> Vec<(&[u32], &[Relocation])> {
        (0..self.buffers.len())
            .map(|i| {
                let words = self.recorded(i);
                let relocs = self.buffer_relocs(i);
                let Some(jump) = self.buffers[i].jump_offset else {
                    return (words, relocs);
                };
                let payload = match relocs.split_last() {
                    Some((last, rest)) if last.location == jump + 4 => rest,
                    _ => relocs,
                };
                (&words[..(jump / 4) as usize], payload)
            })
            .collect()
    }

    /// Largest reservation a single buffer of this batch can hold.
    fn buffer_limit(&self) -> u32 {
        match &self.source {
            Some(source) => source.buffer_size() - CHAIN_RESERVE,
            None => self.end,
        }
    }

    fn bytes_for(&self, dwords: usize) -> Result<u32> {
        u32::try_from(dwords)
            .ok()
            .and_then(|d| d.checked_mul(4))
            .ok_or_else(|| self.overflow(u32::MAX))
    }

    fn overflow(&self, requested: u32) -> StratumError {
        StratumError::BatchOverflow {
            requested,
            available: self.end - self.next,
        }
    }

    fn current_mut(&mut self) -> &mut BatchBuffer {
        let last = self.buffers.len() - 1;
        &mut self.buffers[last]
    }

    fn finish_current(&mut self) {
        let next = self.next;
        let total = self.relocs.len();
        let current = self.current_mut();
        current.length = next;
        current.num_relocs = total - current.first_reloc;
    }

    /// Reserve `bytes` in the current buffer, chaining if needed. Returns
    /// the byte offset of the reservation.
    ///
    /// A request no single buffer can hold fails without chaining.
    fn reserve(&mut self, bytes: u32) -> Result<u32> {
        debug_assert_eq!(self.state, BatchState::Recording, "emit into a finished batch");
        let fits = self.next.checked_add(bytes).is_some_and(|end| end <= self.end);
        if !fits {
            if self.source.is_none() || bytes > self.buffer_limit() {
                return Err(self.overflow(bytes));
            }
            self.chain()?;
        }
        let at = self.next;
        self.next += bytes;
        Ok(at)
    }

    /// Continue recording in a fresh buffer.
    fn chain(&mut self) -> Result<()> {
        let Some(source) = self.source.clone() else {
            return Err(StratumError::BatchOverflow {
                requested: CHAIN_RESERVE,
                available: self.end - self.next,
            });
        };
        self.relocs.reserve(1)?;
        let bo = source.acquire()?;

        // Give back the space held for the jump and emit it.
        self.end += CHAIN_RESERVE;
        let jump = self.next;
        let address = self.relocs.add(jump + 4, &bo, 0)?;
        let (low, high) = address.to_dwords();
        let mut words = vec![MI_BATCH_BUFFER_START, low, high];
        if (jump + BATCH_BUFFER_START_DWORDS * 4) % 8 != 0 {
            words.push(MI_NOOP);
        }
        let base = (jump / 4) as usize;
        self.current_mut().words_mut()[base..base + words.len()].copy_from_slice(&words);
        self.next += words.len() as u32 * 4;
        self.current_mut().jump_offset = Some(jump);
        self.finish_current();

        let capacity = source.buffer_size();
        self.buffers
            .push(BatchBuffer::new(Storage::Bo(bo), capacity, self.relocs.len()));
        self.next = 0;
        self.end = capacity - CHAIN_RESERVE;
        tracing::debug!(buffers = self.buffers.len(), "batch chained to new buffer");
        Ok(())
    }
}

impl Drop for Batch {
    fn drop(&mut self) {
        if let Some(source) = &self.source {
            for buffer in self.buffers.drain(..) {
                if let Storage::Bo(bo) = buffer.storage {
                    source.release(bo);
                }
            }
        }
    }
}

impl std::fmt::Debug for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch")
            .field("buffers", &self.buffers.len())
            .field("relocs", &self.relocs.len())
            .field("next", &self.next)
            .field("state", &self.state)
            .finish()
    }
}
