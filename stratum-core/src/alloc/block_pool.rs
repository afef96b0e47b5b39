//! Growable pool of fixed-size blocks shared by every thread of a device.
//!
//! The pool owns one host-backed mapping promoted to a GPU-visible buffer
//! object. When the cursor reaches the end of the mapping, exactly one
//! thread grows it: it extends the backing file, maps the new size, binds it
//! as a new kernel object and publishes the new end. Superseded mappings are
//! retired, not unmapped, because other threads may still be reading through
//! a base pointer they loaded before the growth. Since every mapping views
//! the same file, blocks keep their contents and offsets across growths.
//!
//! Allocation and free are lock-free apart from the growth itself.

use super::cursor::{AtomicCursor, Bump, Cursor};
use super::free_list::{FreeList, LinkStore};
use super::gate::GrowthGate;
use crate::config::BlockPoolConfig;
use crate::error::{Result, StratumError};
use crate::kernel::{BufferObject, MemoryProvider};
use crate::types::{Block, BoHandle};
use memmap2::{MmapOptions, MmapRaw};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::File;
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};

/// A mapping and the kernel handle bound to it.
struct Mapping {
    mmap: MmapRaw,
    handle: BoHandle,
}

/// State touched only by the growing thread and teardown.
#[derive(Default)]
struct Backing {
    file: Option<File>,
    current: Option<Mapping>,
    retired: Vec<Mapping>,
}

/// Point-in-time counters of a block pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BlockPoolStats {
    /// Blocks handed out, including free-list reuse.
    pub blocks_allocated: u64,
    /// Blocks returned.
    pub blocks_freed: u64,
    /// Number of growths.
    pub growths: u64,
    /// Current mapping size in bytes.
    pub mapping_size: u64,
    /// Superseded mappings kept alive until teardown.
    pub retired_mappings: usize,
}

impl BlockPoolStats {
    /// Blocks currently handed out.
    #[must_use]
    pub fn live_blocks(&self) -> u64 {
        self.blocks_allocated - self.blocks_freed
    }
}

/// A device-wide pool of fixed-size blocks.
pub struct BlockPool {
    name: String,
    provider: Arc<dyn MemoryProvider>,
    block_size: u32,
    initial_size: u64,
    max_size: u64,
    cursor: AtomicCursor,
    free_list: FreeList,
    map: AtomicPtr<u8>,
    bo: Arc<BufferObject>,
    gate: GrowthGate,
    poisoned: AtomicBool,
    backing: Mutex<Backing>,
    allocated: AtomicU64,
    freed: AtomicU64,
    growths: AtomicU64,
}

impl BlockPool {
    /// Create an empty pool. No memory is reserved until the first `alloc`.
    pub fn new(
        name: impl Into<String>,
        config: &BlockPoolConfig,
        provider: Arc<dyn MemoryProvider>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            provider,
            block_size: config.block_size,
            initial_size: config.initial_size(),
            max_size: config.max_size,
            cursor: AtomicCursor::default(),
            free_list: FreeList::new(),
            map: AtomicPtr::new(ptr::null_mut()),
            bo: Arc::new(BufferObject::unbound()),
            gate: GrowthGate::new(),
            poisoned: AtomicBool::new(false),
            backing: Mutex::new(Backing::default()),
            allocated: AtomicU64::new(0),
            freed: AtomicU64::new(0),
            growths: AtomicU64::new(0),
        })
    }

    /// Name used in logs and errors.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size of every block.
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Current mapping size.
    pub fn size(&self) -> u32 {
        self.cursor.end()
    }

    /// The buffer object backing the pool. Its handle changes on growth.
    pub fn bo(&self) -> &Arc<BufferObject> {
        &self.bo
    }

    /// Whether a growth failed and the pool refuses further allocations.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Reserve one block.
    ///
    /// Only blocks while another thread is growing the pool.
    pub fn alloc(&self) -> Result<Block> {
        loop {
            if self.is_poisoned() {
                return Err(self.poisoned_error());
            }
            if let Some(offset) = self.free_list.pop(self) {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                return Ok(Block::from_raw(offset));
            }

            match self.cursor.bump(self.block_size) {
                Bump::Fits(offset) => {
                    self.allocated.fetch_add(1, Ordering::Relaxed);
                    return Ok(Block::from_raw(offset));
                }
                Bump::Refill(old) => {
                    let result = self.grow(old.end);
                    match result {
                        Ok(new_end) => {
                            self.cursor.publish(Cursor {
                                next: old.next + self.block_size,
                                end: new_end,
                            });
                            self.gate.wake_all();
                            self.allocated.fetch_add(1, Ordering::Relaxed);
                            return Ok(Block::from_raw(old.next));
                        }
                        Err(e) => {
                            tracing::error!(
                                pool = %self.name,
                                old_size = old.end,
                                error = %e,
                                "block pool growth failed, pool poisoned"
                            );
                            self.poisoned.store(true, Ordering::Release);
                            self.gate.wake_all();
                            return Err(e);
                        }
                    }
                }
                Bump::Wait(old_end) => {
                    self.gate
                        .wait_while(|| self.cursor.end() == old_end && !self.is_poisoned());
                }
            }
        }
    }

    /// Return a block to the pool.
    ///
    /// The block must have come from this pool.
    pub fn free(&self, block: Block) {
        let offset = block.into_raw();
        debug_assert!(offset < self.size(), "freed block outside pool");
        debug_assert_eq!(offset % self.block_size, 0, "freed block is misaligned");
        self.freed.fetch_add(1, Ordering::Relaxed);
        self.free_list.push(offset, self);
    }

    /// Copy `bytes` into a block starting at `at`.
    ///
    /// # Panics
    ///
    /// Panics if the write would leave the block.
    pub fn write_block(&self, block: &mut Block, at: u32, bytes: &[u8]) {
        assert!(
            at as usize + bytes.len() <= self.block_size as usize,
            "write past end of block"
        );
        let dst = self.ptr_at(block.offset() + at);
        // SAFETY: the range is inside a block this caller owns exclusively.
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), dst.as_ptr(), bytes.len()) };
    }

    /// Copy bytes out of a block starting at `at`.
    ///
    /// # Panics
    ///
    /// Panics if the read would leave the block.
    pub fn read_block(&self, block: &Block, at: u32, out: &mut [u8]) {
        assert!(
            at as usize + out.len() <= self.block_size as usize,
            "read past end of block"
        );
        let src = self.ptr_at(block.offset() + at);
        // SAFETY: see `write_block`.
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), out.as_mut_ptr(), out.len()) };
    }

    /// Counters for monitoring and tests.
    pub fn stats(&self) -> BlockPoolStats {
        BlockPoolStats {
            blocks_allocated: self.allocated.load(Ordering::Relaxed),
            blocks_freed: self.freed.load(Ordering::Relaxed),
            growths: self.growths.load(Ordering::Relaxed),
            mapping_size: u64::from(self.size()),
            retired_mappings: self.backing.lock().retired.len(),
        }
    }

    /// CPU pointer to `offset` through the current mapping.
    ///
    /// `offset` must lie inside a block or state handed out by this pool.
    pub(crate) fn ptr_at(&self, offset: u32) -> NonNull<u8> {
        let base = self.map.load(Ordering::Acquire);
        debug_assert!(!base.is_null(), "pool has no mapping");
        // SAFETY: the caller obtained `offset` from an allocation that saw
        // the growth covering it, and mappings are never unmapped while the
        // pool is alive. The mapping base is never null once published.
        unsafe { NonNull::new_unchecked(base.add(offset as usize)) }
    }

    pub(crate) fn read_u32(&self, offset: u32) -> u32 {
        self.link(offset).load(Ordering::Relaxed)
    }

    pub(crate) fn write_u32(&self, offset: u32, value: u32) {
        self.link(offset).store(value, Ordering::Relaxed);
    }

    fn link(&self, offset: u32) -> &AtomicU32 {
        debug_assert_eq!(offset % 4, 0);
        // SAFETY: offsets are 4-byte aligned and inside the mapping (see
        // `ptr_at`); the word is only accessed atomically.
        unsafe { &*self.ptr_at(offset).as_ptr().cast::<AtomicU32>() }
    }

    fn grow(&self, old_size: u32) -> Result<u32> {
        let old_size = u64::from(old_size);
        let new_size = if old_size == 0 {
            self.initial_size
        } else {
            old_size * 2
        };
        if new_size > self.max_size {
            return Err(StratumError::OutOfMemory {
                pool: self.name.clone(),
                requested: new_size,
                cause: format!("pool ceiling of {} bytes reached", self.max_size),
            });
        }
        let oom = |cause: String| StratumError::OutOfMemory {
            pool: self.name.clone(),
            requested: new_size,
            cause,
        };

        let mut backing = self.backing.lock();
        if backing.file.is_none() {
            backing.file = Some(tempfile::tempfile().map_err(|e| oom(e.to_string()))?);
        }
        let Some(file) = backing.file.as_ref() else {
            return Err(oom("backing file missing".to_string()));
        };
        file.set_len(new_size).map_err(|e| oom(e.to_string()))?;
        let mmap = MmapOptions::new()
            .len(new_size as usize)
            .map_raw(file)
            .map_err(|e| oom(e.to_string()))?;
        let base = NonNull::new(mmap.as_mut_ptr()).ok_or_else(|| oom("null mapping".to_string()))?;
        let handle = self.provider.bind_userptr(base, new_size)?;
        let address = self.provider.address(handle);

        self.map.store(base.as_ptr(), Ordering::Release);
        self.bo.rebind(handle, new_size, address, base);
        if let Some(old) = backing.current.replace(Mapping { mmap, handle }) {
            backing.retired.push(old);
        }
        self.growths.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            pool = %self.name,
            block_size = self.block_size,
            old_size,
            new_size,
            handle = %handle,
            "block pool grew"
        );
        Ok(new_size as u32)
    }

    pub(crate) fn poisoned_error(&self) -> StratumError {
        StratumError::OutOfMemory {
            pool: self.name.clone(),
            requested: u64::from(self.size()) * 2,
            cause: "an earlier growth failed".to_string(),
        }
    }
}

impl LinkStore for BlockPool {
    fn read_link(&self, offset: u32) -> u32 {
        self.read_u32(offset)
    }

    fn write_link(&self, offset: u32, next: u32) {
        self.write_u32(offset, next);
    }
}

impl Drop for BlockPool {
    fn drop(&mut self) {
        let backing = self.backing.get_mut();
        let current = backing.current.take();
        for mapping in backing.retired.drain(..).chain(current) {
            self.provider.close(mapping.handle);
            drop(mapping.mmap);
        }
    }
}

impl std::fmt::Debug for BlockPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockPool")
            .field("name", &self.name)
            .field("block_size", &self.block_size)
            .field("size", &self.size())
            .field("poisoned", &self.is_poisoned())
            .finish()
    }
}
