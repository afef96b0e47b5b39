//! Finalize: consolidate a recording into a buffer table for submission.
//!
//! Building a table is two passes. The first registers every buffer that
//! owns relocations, in the order they are added, and every buffer those
//! relocations point at. The second rewrites each relocation's target into
//! a table index and compares presumed against current addresses. Indices
//! must all exist before the second pass because a relocation can target a
//! buffer registered after it.
//!
//! Table slots are tracked on the buffer objects themselves, so building
//! is serialized by the device-wide [`ExecLock`].

use crate::batch::Relocation;
use crate::error::{Result, StratumError};
use crate::kernel::BufferObject;
use crate::types::{BoHandle, GpuAddress};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

/// A relocation in the form the submission collaborator consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocationEntry {
    /// Byte offset of the address inside the owning buffer.
    pub offset: u32,
    /// Table index of the target buffer.
    pub target_index: u32,
    /// Offset added to the target's address.
    pub delta: u32,
    /// Address written at record time.
    pub presumed_address: GpuAddress,
}

/// One buffer of a finalized table.
#[derive(Debug, Clone)]
pub struct ExecObject {
    /// The buffer object, for writing back addresses after execution.
    pub bo: Arc<BufferObject>,
    /// Handle at finalize time.
    pub handle: BoHandle,
    /// Size at finalize time.
    pub size: u64,
    /// Address the recording assumed for this buffer.
    pub presumed_address: GpuAddress,
    /// Relocations whose locations are inside this buffer.
    pub relocations: Vec<RelocationEntry>,
}

/// A finalized, deduplicated buffer table. The last object is the batch
/// buffer execution starts in.
#[derive(Debug, Clone)]
pub struct ExecBuffer {
    objects: Vec<ExecObject>,
    batch_len: u32,
    need_reloc: bool,
}

impl ExecBuffer {
    /// Buffers in table order.
    pub fn objects(&self) -> &[ExecObject] {
        &self.objects
    }

    /// Bytes to execute in the entry buffer.
    pub fn batch_len(&self) -> u32 {
        self.batch_len
    }

    /// Whether any relocation target has moved since it was recorded.
    pub fn need_reloc(&self) -> bool {
        self.need_reloc
    }

    /// Whether the kernel may skip relocation processing entirely.
    pub fn no_reloc(&self) -> bool {
        !self.need_reloc
    }

    /// Total relocation entries across all buffers.
    pub fn relocation_count(&self) -> usize {
        self.objects.iter().map(|o| o.relocations.len()).sum()
    }

    /// Table index of `bo`, if it is part of this table.
    pub fn index_of(&self, bo: &Arc<BufferObject>) -> Option<usize> {
        self.objects.iter().position(|o| Arc::ptr_eq(&o.bo, bo))
    }
}

/// Serializes buffer table construction for one device.
#[derive(Debug, Default)]
pub struct ExecLock(Mutex<()>);

impl ExecLock {
    /// Create an unlocked exec lock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start building a table. Blocks while another table is being built.
    pub fn builder(&self) -> ExecBuilder<'_> {
        ExecBuilder {
            _guard: self.0.lock(),
            slots: Vec::new(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ()> {
        self.0.lock()
    }
}

struct Slot {
    bo: Arc<BufferObject>,
    relocs: Vec<Relocation>,
}

/// Builds one [`ExecBuffer`] while holding the device exec lock.
pub struct ExecBuilder<'a> {
    _guard: MutexGuard<'a, ()>,
    slots: Vec<Slot>,
}

impl ExecBuilder<'_> {
    /// Register `bo` together with the relocations located inside it.
    ///
    /// A buffer is only ever given one slot; the relocations of a repeated
    /// add are kept only if the first add had none. Returns the slot index.
    pub fn add_buffer(&mut self, bo: &Arc<BufferObject>, relocs: &[Relocation]) -> u32 {
        let index = match self.slot_of(bo) {
            Some(index) => index,
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    bo: Arc::clone(bo),
                    relocs: Vec::new(),
                });
                bo.set_exec_index(index);
                index
            }
        };

        let slot = &mut self.slots[index as usize];
        if slot.relocs.is_empty() && !relocs.is_empty() {
            slot.relocs = relocs.to_vec();
            for reloc in relocs {
                self.add_buffer(&reloc.target, &[]);
            }
        }
        index
    }

    /// Number of buffers registered so far.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Check if no buffer has been registered.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Move `entry` to the last slot, resolve every relocation and produce
    /// the table.
    pub fn finish(mut self, entry: &Arc<BufferObject>, batch_len: u32) -> Result<ExecBuffer> {
        let entry_index = self.slot_of(entry).ok_or_else(|| StratumError::Submission {
            cause: format!("entry buffer {} not in buffer table", entry.handle()),
        })? as usize;
        let last = self.slots.len() - 1;
        if entry_index != last {
            self.slots.swap(entry_index, last);
            self.slots[entry_index].bo.set_exec_index(entry_index as u32);
            self.slots[last].bo.set_exec_index(last as u32);
        }

        let mut need_reloc = false;
        let mut objects = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            let mut relocations = Vec::with_capacity(slot.relocs.len());
            for reloc in &slot.relocs {
                let target_index =
                    self.slot_of(&reloc.target)
                        .ok_or_else(|| StratumError::Submission {
                            cause: format!(
                                "relocation target {} not in buffer table",
                                reloc.target.handle()
                            ),
                        })?;
                need_reloc |= reloc.is_stale();
                relocations.push(RelocationEntry {
                    offset: reloc.location,
                    target_index,
                    delta: reloc.delta,
                    presumed_address: reloc.presumed_address,
                });
            }
            objects.push(ExecObject {
                bo: Arc::clone(&slot.bo),
                handle: slot.bo.handle(),
                size: slot.bo.size(),
                presumed_address: slot.bo.address(),
                relocations,
            });
        }

        let exec = ExecBuffer {
            objects,
            batch_len,
            need_reloc,
        };
        tracing::debug!(
            buffers = exec.objects.len(),
            relocations = exec.relocation_count(),
            need_reloc,
            batch_len,
            "finalized buffer table"
        );
        Ok(exec)
    }

    fn slot_of(&self, bo: &Arc<BufferObject>) -> Option<u32> {
        let index = bo.exec_index()?;
        let slot = self.slots.get(index as usize)?;
        Arc::ptr_eq(&slot.bo, bo).then_some(index)
    }
}
