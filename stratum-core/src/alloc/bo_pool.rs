//! Pool of reusable, CPU-mapped buffer objects for batch buffers.

use crate::error::Result;
use crate::kernel::{BufferObject, MemoryProvider};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time counters of a buffer object pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BoPoolStats {
    /// Buffer objects created from the kernel.
    pub created: u64,
    /// Allocations served from the free list.
    pub reused: u64,
    /// Buffer objects currently idle in the pool.
    pub idle: usize,
}

/// Hands out equally sized buffer objects and recycles them on free.
///
/// Objects are created and mapped on a miss and only closed when the pool
/// is dropped.
pub struct BoPool {
    provider: Arc<dyn MemoryProvider>,
    bo_size: u32,
    free: Mutex<Vec<Arc<BufferObject>>>,
    owned: Mutex<Vec<Arc<BufferObject>>>,
    created: AtomicU64,
    reused: AtomicU64,
}

impl BoPool {
    /// Create an empty pool of `bo_size`-byte objects.
    pub fn new(provider: Arc<dyn MemoryProvider>, bo_size: u32) -> Self {
        Self {
            provider,
            bo_size,
            free: Mutex::new(Vec::new()),
            owned: Mutex::new(Vec::new()),
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        }
    }

    /// Size of every object in the pool.
    pub fn bo_size(&self) -> u32 {
        self.bo_size
    }

    /// Take an idle object, creating and mapping a new one if none is idle.
    pub fn alloc(&self) -> Result<Arc<BufferObject>> {
        if let Some(bo) = self.free.lock().pop() {
            self.reused.fetch_add(1, Ordering::Relaxed);
            return Ok(bo);
        }

        let size = u64::from(self.bo_size);
        let handle = self.provider.create(size)?;
        let map = match self.provider.map(handle, 0, size) {
            Ok(map) => map,
            Err(e) => {
                self.provider.close(handle);
                return Err(e);
            }
        };
        let bo = Arc::new(BufferObject::new(handle, size, self.provider.address(handle)));
        bo.set_map(Some(map));
        self.owned.lock().push(bo.clone());
        self.created.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(handle = %handle, size, "bo pool created buffer object");
        Ok(bo)
    }

    /// Return an object to the pool.
    pub fn free(&self, bo: Arc<BufferObject>) {
        debug_assert_eq!(bo.size(), u64::from(self.bo_size), "buffer object from another pool");
        self.free.lock().push(bo);
    }

    /// Counters for monitoring and tests.
    pub fn stats(&self) -> BoPoolStats {
        BoPoolStats {
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            idle: self.free.lock().len(),
        }
    }
}

impl Drop for BoPool {
    fn drop(&mut self) {
        for bo in self.owned.get_mut().drain(..) {
            if let Some(map) = bo.map_ptr() {
                self.provider.unmap(map, bo.size());
            }
            bo.set_map(None);
            self.provider.close(bo.handle());
        }
    }
}

impl std::fmt::Debug for BoPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoPool")
            .field("bo_size", &self.bo_size)
            .field("stats", &self.stats())
            .finish()
    }
}
