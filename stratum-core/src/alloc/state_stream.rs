//! Single-writer bump allocator for per-recording transient state.

use super::block_pool::BlockPool;
use crate::error::{Result, StratumError};
use crate::types::{Block, Lease, State};
use std::sync::Arc;

/// Marks the end of the block chain. Blocks are block-size aligned so this
/// is never a real block offset.
const NULL_BLOCK: u32 = 1;

/// Bytes at the head of every block holding the previous block's offset.
const HEADER_SIZE: u32 = 4;

fn align_up(value: u32, align: u32) -> Option<u32> {
    Some(value.checked_add(align - 1)? & !(align - 1))
}

/// Bump allocator over a chain of blocks, released all at once by
/// [`finish`](Self::finish).
///
/// Not thread-safe: one stream belongs to one recording session. States
/// it hands out stop being usable once it finishes.
#[derive(Debug)]
pub struct StateStream {
    block_pool: Arc<BlockPool>,
    lease: Lease,
    current_block: u32,
    next: u32,
    end: u32,
    blocks: u32,
}

impl StateStream {
    /// Create an empty stream. Blocks are taken lazily.
    pub fn new(block_pool: Arc<BlockPool>) -> Self {
        Self {
            block_pool,
            lease: Lease::default(),
            current_block: NULL_BLOCK,
            next: 0,
            end: 0,
            blocks: 0,
        }
    }

    /// Number of blocks currently chained.
    pub fn block_count(&self) -> u32 {
        self.blocks
    }

    /// Largest allocation that fits in a block at the given alignment.
    ///
    /// Zero when the alignment leaves no room after the block header.
    pub fn capacity(&self, align: u32) -> u32 {
        align_up(HEADER_SIZE, align.max(1))
            .and_then(|start| self.block_pool.block_size().checked_sub(start))
            .unwrap_or(0)
    }

    /// Allocate `size` bytes aligned to `align`.
    ///
    /// An allocation never spans blocks, so `size` is limited to
    /// [`capacity`](Self::capacity).
    pub fn alloc(&mut self, size: u32, align: u32) -> Result<State> {
        let align = align.max(1);
        debug_assert!(align.is_power_of_two(), "alignment {align} is not a power of two");
        let capacity = self.capacity(align);
        if size > capacity || capacity == 0 {
            return Err(StratumError::StreamAllocTooLarge { size, capacity });
        }

        // `align` is below the block size here, so aligning an offset inside
        // the pool cannot overflow.
        let mut offset = align_up(self.next, align).unwrap_or(u32::MAX);
        if self.blocks == 0 || offset.saturating_add(size) > self.end {
            let block = self.block_pool.alloc()?;
            let start = block.into_raw();
            self.block_pool.write_u32(start, self.current_block);
            self.current_block = start;
            self.next = start + HEADER_SIZE;
            self.end = start + self.block_pool.block_size();
            self.blocks += 1;
            offset = align_up(self.next, align).unwrap_or(u32::MAX);
        }
        self.next = offset + size;
        Ok(State::leased(offset, size, self.block_pool.ptr_at(offset), &self.lease))
    }

    /// Return every block to the pool and reset for the next session.
    ///
    /// States allocated before the call are revoked: reading or writing
    /// them afterwards panics.
    pub fn finish(&mut self) {
        self.lease.revoke();
        let mut block = self.current_block;
        while block != NULL_BLOCK {
            let prev = self.block_pool.read_u32(block);
            self.block_pool.free(Block::from_raw(block));
            block = prev;
        }
        self.current_block = NULL_BLOCK;
        self.next = 0;
        self.end = 0;
        self.blocks = 0;
    }
}

impl Drop for StateStream {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BlockPoolConfig;
    use crate::kernel::HostKernel;
    use std::collections::HashSet;

    fn block_pool() -> Arc<BlockPool> {
        Arc::new(
            BlockPool::new(
                "stream",
                &BlockPoolConfig::default().with_block_size(256),
                Arc::new(HostKernel::new()),
            )
            .unwrap(),
        )
    }

    #[test]
    fn bump_allocates_with_alignment() {
        let mut stream = StateStream::new(block_pool());
        let a = stream.alloc(10, 1).unwrap();
        let b = stream.alloc(16, 16).unwrap();
        assert_eq!(a.offset(), HEADER_SIZE);
        assert_eq!(b.offset(), 16);
        assert_eq!(b.size(), 16);
        assert_eq!(stream.block_count(), 1);
    }

    #[test]
    fn overflow_chains_new_block() {
        let pool = block_pool();
        let mut stream = StateStream::new(pool.clone());
        let a = stream.alloc(200, 4).unwrap();
        let b = stream.alloc(100, 4).unwrap();
        assert_eq!(stream.block_count(), 2);
        assert_ne!(a.offset() / 256, b.offset() / 256);
        assert_eq!(b.offset() % 256, HEADER_SIZE);
        // Back-link points at the first block.
        assert_eq!(pool.read_u32(b.offset() - HEADER_SIZE), a.offset() - HEADER_SIZE);
    }

    #[test]
    fn single_allocation_limited_to_one_block() {
        let mut stream = StateStream::new(block_pool());
        assert_eq!(stream.capacity(4), 252);
        assert!(stream.alloc(252, 4).is_ok());
        let err = stream.alloc(253, 4).unwrap_err();
        assert!(err.is_capacity_exceeded());
        assert_eq!(stream.capacity(64), 192);
        assert!(stream.alloc(193, 64).is_err());
    }

    #[test]
    fn finish_returns_every_block() {
        let pool = block_pool();
        let mut stream = StateStream::new(pool.clone());
        for _ in 0..50 {
            let _ = stream.alloc(100, 8).unwrap();
        }
        let acquired = stream.block_count() as u64;
        assert_eq!(pool.stats().live_blocks(), acquired);

        stream.finish();
        let stats = pool.stats();
        assert_eq!(stats.live_blocks(), 0);
        assert_eq!(stats.blocks_freed, acquired);
        assert_eq!(stream.block_count(), 0);
    }

    #[test]
    fn reuse_after_finish_draws_from_returned_blocks() {
        let pool = block_pool();
        let mut stream = StateStream::new(pool.clone());
        let mut first_session = HashSet::new();
        for _ in 0..10 {
            first_session.insert(stream.alloc(120, 8).unwrap().offset() / 256);
        }
        stream.finish();

        let mut second_session = HashSet::new();
        for _ in 0..10 {
            second_session.insert(stream.alloc(120, 8).unwrap().offset() / 256);
        }
        assert_eq!(first_session, second_session);
        assert_eq!(pool.stats().growths, 1);
    }

    #[test]
    fn drop_finishes() {
        let pool = block_pool();
        {
            let mut stream = StateStream::new(pool.clone());
            let _ = stream.alloc(64, 4).unwrap();
        }
        assert_eq!(pool.stats().live_blocks(), 0);
    }

    #[test]
    fn alignment_beyond_block_is_rejected() {
        let pool = block_pool();
        let mut stream = StateStream::new(pool.clone());
        assert_eq!(stream.capacity(256), 0);
        assert_eq!(stream.capacity(512), 0);
        assert_eq!(stream.capacity(1 << 31), 0);
        for align in [256, 512, 1 << 31] {
            let err = stream.alloc(16, align).unwrap_err();
            assert_eq!(err.code(), "E102");
        }
        assert_eq!(stream.block_count(), 0);
        assert_eq!(pool.stats().blocks_allocated, 0);

        // The largest alignment that still leaves room stays inside its block.
        let state = stream.alloc(128, 128).unwrap();
        assert_eq!(state.offset() % 256, 128);
    }

    #[test]
    fn finished_state_cannot_touch_reused_block() {
        let pool = block_pool();
        let mut stream = StateStream::new(pool.clone());
        let mut stale = stream.alloc(64, 4).unwrap();
        stale.write(0, &[1; 8]);
        assert!(stale.is_live());
        stream.finish();
        assert!(!stale.is_live());

        let mut reused = pool.alloc().unwrap();
        assert_eq!(reused.offset(), stale.offset() - HEADER_SIZE);
        pool.write_block(&mut reused, HEADER_SIZE, &[0xaa; 8]);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            stale.write(0, &[0x55; 8]);
        }));
        assert!(result.is_err());

        let mut out = [0u8; 8];
        pool.read_block(&reused, HEADER_SIZE, &mut out);
        assert_eq!(out, [0xaa; 8]);
        pool.free(reused);
    }
}
