//! Fixed-size state pool: power-of-two size classes carved from blocks.

use super::block_pool::BlockPool;
use super::cursor::{AtomicCursor, Bump, Cursor};
use super::free_list::FreeList;
use super::gate::GrowthGate;
use crate::config::StatePoolConfig;
use crate::error::{Result, StratumError};
use crate::types::State;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// One size class.
#[derive(Debug, Default)]
struct Bucket {
    cursor: AtomicCursor,
    free_list: FreeList,
    gate: GrowthGate,
}

/// Point-in-time counters of a state pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatePoolStats {
    /// States handed out.
    pub allocated: u64,
    /// States returned.
    pub freed: u64,
    /// Blocks taken from the block pool.
    pub blocks: u64,
}

/// Lock-free allocator of small, long-lived states.
///
/// Requests are rounded up to a power-of-two size class. Each class bumps
/// through a block taken from the block pool and recycles freed states
/// through its own free list. Blocks are never given back: fragmentation is
/// bounded by one partially used block per class.
#[derive(Debug)]
pub struct StatePool {
    block_pool: Arc<BlockPool>,
    min_size_log2: u32,
    max_size_log2: u32,
    buckets: Vec<Bucket>,
    allocated: AtomicU64,
    freed: AtomicU64,
    blocks: AtomicU64,
}

impl StatePool {
    /// Create a pool carving states out of `block_pool`.
    pub fn new(block_pool: Arc<BlockPool>, config: &StatePoolConfig) -> Result<Self> {
        config.validate(block_pool.block_size())?;
        let buckets = (0..config.bucket_count()).map(|_| Bucket::default()).collect();
        Ok(Self {
            block_pool,
            min_size_log2: config.min_size_log2,
            max_size_log2: config.max_size_log2,
            buckets,
            allocated: AtomicU64::new(0),
            freed: AtomicU64::new(0),
            blocks: AtomicU64::new(0),
        })
    }

    /// The block pool states are carved from.
    pub fn block_pool(&self) -> &Arc<BlockPool> {
        &self.block_pool
    }

    /// log2 of the size class serving `max(size, align)`.
    pub fn size_class(&self, size: u32, align: u32) -> Result<u32> {
        let too_large = || StratumError::StateTooLarge {
            size,
            align,
            max: 1 << self.max_size_log2,
        };
        let rounded = size
            .max(align)
            .max(1)
            .checked_next_power_of_two()
            .ok_or_else(too_large)?;
        let log2 = rounded.trailing_zeros().max(self.min_size_log2);
        if log2 > self.max_size_log2 {
            return Err(too_large());
        }
        Ok(log2)
    }

    /// Allocate a state of at least `size` bytes aligned to `align`.
    pub fn alloc(&self, size: u32, align: u32) -> Result<State> {
        debug_assert!(
            align == 0 || align.is_power_of_two(),
            "alignment {align} is not a power of two"
        );
        let log2 = self.size_class(size, align)?;
        let state_size = 1u32 << log2;
        let bucket = &self.buckets[(log2 - self.min_size_log2) as usize];
        let offset = self.alloc_from(bucket, state_size)?;
        self.allocated.fetch_add(1, Ordering::Relaxed);
        Ok(State::new(offset, state_size, self.block_pool.ptr_at(offset)))
    }

    /// Return a state to its size class.
    pub fn free(&self, state: State) {
        let size = state.size();
        debug_assert!(size.is_power_of_two(), "state was not allocated from a state pool");
        let log2 = size.trailing_zeros();
        debug_assert!(
            (self.min_size_log2..=self.max_size_log2).contains(&log2),
            "state size {size} is not a size class of this pool"
        );
        let bucket = &self.buckets[(log2 - self.min_size_log2) as usize];
        self.freed.fetch_add(1, Ordering::Relaxed);
        bucket.free_list.push(state.offset(), self.block_pool.as_ref());
    }

    /// Counters for monitoring and tests.
    pub fn stats(&self) -> StatePoolStats {
        StatePoolStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            freed: self.freed.load(Ordering::Relaxed),
            blocks: self.blocks.load(Ordering::Relaxed),
        }
    }

    fn alloc_from(&self, bucket: &Bucket, state_size: u32) -> Result<u32> {
        if let Some(offset) = bucket.free_list.pop(self.block_pool.as_ref()) {
            return Ok(offset);
        }
        loop {
            match bucket.cursor.bump(state_size) {
                Bump::Fits(offset) => return Ok(offset),
                Bump::Refill(_) => {
                    let block = match self.block_pool.alloc() {
                        Ok(block) => block,
                        Err(e) => {
                            bucket.gate.wake_all();
                            return Err(e);
                        }
                    };
                    let start = block.into_raw();
                    bucket.cursor.publish(Cursor {
                        next: start + state_size,
                        end: start + self.block_pool.block_size(),
                    });
                    bucket.gate.wake_all();
                    self.blocks.fetch_add(1, Ordering::Relaxed);
                    return Ok(start);
                }
                Bump::Wait(old_end) => {
                    bucket.gate.wait_while(|| {
                        bucket.cursor.end() == old_end && !self.block_pool.is_poisoned()
                    });
                    if self.block_pool.is_poisoned() {
                        return Err(self.block_pool.poisoned_error());
                    }
                }
            }
        }
    }
}
