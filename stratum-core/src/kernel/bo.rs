//! Buffer objects shared between allocators, relocations and submission.

use crate::types::{BoHandle, GpuAddress};
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering};

/// Index value meaning "not in any buffer table".
const NO_INDEX: u32 = u32::MAX;

/// A kernel-backed memory object.
///
/// Fields are atomics because a block pool swaps its backing object in place
/// when it grows, and the submission path writes back kernel addresses while
/// other sessions may be recording relocations against the same object.
/// Relocations hold an `Arc<BufferObject>` and read the handle at finalize
/// time, so they always see the latest backing.
pub struct BufferObject {
    handle: AtomicU32,
    size: AtomicU64,
    address: AtomicU64,
    map: AtomicPtr<u8>,
    index: AtomicU32,
}

impl BufferObject {
    /// Create a buffer object description.
    #[must_use]
    pub fn new(handle: BoHandle, size: u64, address: GpuAddress) -> Self {
        Self {
            handle: AtomicU32::new(handle.as_u32()),
            size: AtomicU64::new(size),
            address: AtomicU64::new(address.as_u64()),
            map: AtomicPtr::new(ptr::null_mut()),
            index: AtomicU32::new(NO_INDEX),
        }
    }

    /// A placeholder with no kernel object behind it yet.
    #[must_use]
    pub fn unbound() -> Self {
        Self::new(BoHandle::NULL, 0, GpuAddress::default())
    }

    /// Kernel handle.
    pub fn handle(&self) -> BoHandle {
        BoHandle::new(self.handle.load(Ordering::Acquire))
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Last address reported by the kernel.
    pub fn address(&self) -> GpuAddress {
        GpuAddress::new(self.address.load(Ordering::Acquire))
    }

    /// Record a new address reported by the kernel.
    pub fn set_address(&self, address: GpuAddress) {
        self.address.store(address.as_u64(), Ordering::Release);
    }

    /// CPU mapping, if the object is mapped.
    pub fn map_ptr(&self) -> Option<NonNull<u8>> {
        NonNull::new(self.map.load(Ordering::Acquire))
    }

    pub(crate) fn set_map(&self, map: Option<NonNull<u8>>) {
        let raw = map.map_or(ptr::null_mut(), NonNull::as_ptr);
        self.map.store(raw, Ordering::Release);
    }

    /// Replace the backing kernel object. Size and address are published
    /// before the handle so a reader that sees the new handle sees both.
    pub(crate) fn rebind(
        &self,
        handle: BoHandle,
        size: u64,
        address: GpuAddress,
        map: NonNull<u8>,
    ) {
        self.size.store(size, Ordering::Release);
        self.address.store(address.as_u64(), Ordering::Release);
        self.map.store(map.as_ptr(), Ordering::Release);
        self.handle.store(handle.as_u32(), Ordering::Release);
    }

    /// Slot in the buffer table currently being built, if any.
    ///
    /// Only meaningful while the device exec lock is held.
    pub(crate) fn exec_index(&self) -> Option<u32> {
        match self.index.load(Ordering::Relaxed) {
            NO_INDEX => None,
            index => Some(index),
        }
    }

    pub(crate) fn set_exec_index(&self, index: u32) {
        self.index.store(index, Ordering::Relaxed);
    }
}

impl fmt::Debug for BufferObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferObject")
            .field("handle", &self.handle())
            .field("size", &self.size())
            .field("address", &self.address())
            .field("mapped", &self.map_ptr().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebind_replaces_backing() {
        let bo = BufferObject::unbound();
        assert!(bo.handle().is_null());
        assert!(bo.map_ptr().is_none());

        let mut backing = [0u8; 16];
        let map = NonNull::new(backing.as_mut_ptr()).unwrap();
        bo.rebind(BoHandle::new(7), 16, GpuAddress::new(0x1000), map);
        assert_eq!(bo.handle(), BoHandle::new(7));
        assert_eq!(bo.size(), 16);
        assert_eq!(bo.address(), GpuAddress::new(0x1000));
        assert_eq!(bo.map_ptr(), Some(map));
    }

    #[test]
    fn exec_index_starts_unset() {
        let bo = BufferObject::new(BoHandle::new(1), 4096, GpuAddress::new(0x2000));
        assert_eq!(bo.exec_index(), None);
        bo.set_exec_index(3);
        assert_eq!(bo.exec_index(), Some(3));
    }
}
