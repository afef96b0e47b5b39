//! Allocation handles returned by the pools.
//!
//! Neither handle is `Clone`: returning a handle to its pool consumes it,
//! so a reservation cannot be freed twice from safe code.

use parking_lot::{RwLock, RwLockReadGuard};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

/// A block reserved from a [`BlockPool`](crate::alloc::BlockPool).
#[must_use = "blocks must be returned to their pool"]
#[derive(Debug, PartialEq, Eq)]
pub struct Block {
    offset: u32,
}

impl Block {
    pub(crate) const fn from_raw(offset: u32) -> Self {
        Self { offset }
    }

    /// Byte offset of the block inside the pool's mapping.
    #[must_use]
    pub const fn offset(&self) -> u32 {
        self.offset
    }

    pub(crate) fn into_raw(self) -> u32 {
        self.offset
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block@0x{:08x}", self.offset)
    }
}

/// Generation counter shared by a state stream and the states it hands out.
///
/// The stream bumps the generation under the write lock before returning
/// its blocks; states access memory under the read lock and only while
/// their generation is current.
#[derive(Debug, Clone, Default)]
pub(crate) struct Lease(Arc<RwLock<u64>>);

impl Lease {
    pub(crate) fn generation(&self) -> u64 {
        *self.0.read()
    }

    /// End the current generation. Returns once no state is mid-access.
    pub(crate) fn revoke(&self) {
        *self.0.write() += 1;
    }
}

#[derive(Debug)]
struct Tag {
    lease: Lease,
    generation: u64,
}

/// A region handed out by a state pool or state stream.
///
/// `map` points at the first byte of the region through whichever mapping
/// was current when the region was allocated. Pools keep every mapping
/// alive until they are dropped, so the pointer stays valid for the
/// pool's lifetime.
///
/// Pool states are returned by value, so they cannot outlive their
/// reservation. Stream states are released in bulk when the stream
/// finishes; after that [`read`](Self::read) and [`write`](Self::write)
/// panic instead of touching a block that may have a new owner.
#[must_use = "states should be written or returned to their pool"]
#[derive(Debug)]
pub struct State {
    offset: u32,
    size: u32,
    map: NonNull<u8>,
    tag: Option<Tag>,
}

// SAFETY: a `State` is an exclusive reservation of a byte range. The raw
// pointer is only dereferenced through `&mut self`/`&self` accessors, which
// hold the stream lease (if any) for the duration of the access, and the
// owning pool keeps the mapping alive.
unsafe impl Send for State {}
unsafe impl Sync for State {}

impl State {
    pub(crate) const fn new(offset: u32, size: u32, map: NonNull<u8>) -> Self {
        Self {
            offset,
            size,
            map,
            tag: None,
        }
    }

    pub(crate) fn leased(offset: u32, size: u32, map: NonNull<u8>, lease: &Lease) -> Self {
        Self {
            offset,
            size,
            map,
            tag: Some(Tag {
                generation: lease.generation(),
                lease: lease.clone(),
            }),
        }
    }

    /// Whether the memory behind this state still belongs to it.
    ///
    /// Always true for pool states; false for stream states once the
    /// stream has finished.
    pub fn is_live(&self) -> bool {
        self.tag
            .as_ref()
            .is_none_or(|tag| tag.lease.generation() == tag.generation)
    }

    /// Hold the lease for one access.
    fn access(&self) -> Option<RwLockReadGuard<'_, u64>> {
        let tag = self.tag.as_ref()?;
        let guard = tag.lease.0.read();
        assert_eq!(*guard, tag.generation, "state used after its stream finished");
        Some(guard)
    }

    /// Byte offset of the region inside the backing block pool.
    #[must_use]
    pub const fn offset(&self) -> u32 {
        self.offset
    }

    /// Size of the region in bytes.
    ///
    /// For state pool allocations this is the size class, which may be
    /// larger than what was requested.
    #[must_use]
    pub const fn size(&self) -> u32 {
        self.size
    }

    /// CPU pointer to the first byte of the region.
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.map.as_ptr()
    }

    /// Copy `bytes` into the region starting at `at`.
    ///
    /// # Panics
    ///
    /// Panics if the write would run past the end of the region, or if the
    /// state came from a stream that has since finished.
    pub fn write(&mut self, at: u32, bytes: &[u8]) {
        let end = at as usize + bytes.len();
        assert!(end <= self.size as usize, "write past end of state");
        let _lease = self.access();
        // SAFETY: the range lies inside this reservation, `&mut self`
        // guarantees no other handle aliases it and the lease keeps the
        // stream from releasing it during the copy.
        unsafe {
            let dst = self.map.as_ptr().add(at as usize);
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
        }
    }

    /// Copy bytes out of the region starting at `at`.
    ///
    /// # Panics
    ///
    /// Panics if the read would run past the end of the region, or if the
    /// state came from a stream that has since finished.
    pub fn read(&self, at: u32, out: &mut [u8]) {
        let end = at as usize + out.len();
        assert!(end <= self.size as usize, "read past end of state");
        let _lease = self.access();
        // SAFETY: see `write`.
        unsafe {
            let src = self.map.as_ptr().add(at as usize);
            std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), out.len());
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "state@0x{:08x}+{}", self.offset, self.size)
    }
}
