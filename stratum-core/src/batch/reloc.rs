//! Relocation records: deferred address fix-ups.

use crate::config::DEFAULT_RELOC_CAPACITY;
use crate::error::{Result, StratumError};
use crate::kernel::BufferObject;
use crate::types::GpuAddress;
use std::sync::Arc;

/// One address written into a buffer that must be patched if `target`
/// moves before execution.
#[derive(Debug, Clone)]
pub struct Relocation {
    /// Byte offset of the address inside the owning buffer.
    pub location: u32,
    /// Buffer the address points into.
    pub target: Arc<BufferObject>,
    /// Offset added to the target's address.
    pub delta: u32,
    /// Target address at the time the relocation was recorded.
    pub presumed_address: GpuAddress,
}

impl Relocation {
    /// Whether the target has moved since the relocation was recorded.
    pub fn is_stale(&self) -> bool {
        self.target.address() != self.presumed_address
    }
}

/// Append-only list of relocations for one buffer or batch.
#[derive(Debug, Clone)]
pub struct RelocList {
    entries: Vec<Relocation>,
}

impl Default for RelocList {
    fn default() -> Self {
        Self::new()
    }
}

impl RelocList {
    /// Create a list with the default initial capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_RELOC_CAPACITY)
    }

    /// Create a list with room for `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Record a relocation and return the address to write at `location`.
    pub fn add(
        &mut self,
        location: u32,
        target: &Arc<BufferObject>,
        delta: u32,
    ) -> Result<GpuAddress> {
        self.reserve(1)?;
        let presumed_address = target.address();
        self.entries.push(Relocation {
            location,
            target: Arc::clone(target),
            delta,
            presumed_address,
        });
        Ok(presumed_address.add(u64::from(delta)))
    }

    /// Merge another list, shifting every merged location by `offset`.
    ///
    /// Used when the commands `other` describes are copied into this list's
    /// buffer at `offset`.
    pub fn append(&mut self, other: &RelocList, offset: u32) -> Result<()> {
        self.extend_shifted(&other.entries, offset)
    }

    pub(crate) fn extend_shifted(&mut self, relocs: &[Relocation], offset: u32) -> Result<()> {
        self.reserve(relocs.len())?;
        self.entries.extend(relocs.iter().map(|r| Relocation {
            location: r.location + offset,
            ..r.clone()
        }));
        Ok(())
    }

    /// Ensure room for `additional` more entries, doubling the capacity.
    pub fn reserve(&mut self, additional: usize) -> Result<()> {
        let needed = self
            .entries
            .len()
            .checked_add(additional)
            .ok_or(StratumError::RelocGrowth {
                requested: usize::MAX,
            })?;
        let capacity = self.entries.capacity();
        if needed <= capacity {
            return Ok(());
        }
        let target = capacity
            .max(DEFAULT_RELOC_CAPACITY / 2)
            .saturating_mul(2)
            .max(needed);
        self.entries
            .try_reserve_exact(target - self.entries.len())
            .map_err(|_| StratumError::RelocGrowth { requested: target })
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the list is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current capacity.
    pub fn capacity(&self) -> usize {
        self.entries.capacity()
    }

    /// The recorded entries.
    pub fn as_slice(&self) -> &[Relocation] {
        &self.entries
    }

    /// Iterate over the recorded entries.
    pub fn iter(&self) -> std::slice::Iter<'_, Relocation> {
        self.entries.iter()
    }

    /// Drop every entry, keeping the allocation.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<'a> IntoIterator for &'a RelocList {
    type Item = &'a Relocation;
    type IntoIter = std::slice::Iter<'a, Relocation>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoHandle;

    fn bo(address: u64) -> Arc<BufferObject> {
        Arc::new(BufferObject::new(BoHandle::new(1), 4096, GpuAddress::new(address)))
    }

    #[test]
    fn add_returns_presumed_address_plus_delta() {
        let target = bo(0x10_0000);
        let mut list = RelocList::new();
        let address = list.add(8, &target, 0x40).unwrap();
        assert_eq!(address, GpuAddress::new(0x10_0040));
        assert_eq!(list.len(), 1);
        assert_eq!(list.as_slice()[0].presumed_address, GpuAddress::new(0x10_0000));
        assert!(!list.as_slice()[0].is_stale());

        target.set_address(GpuAddress::new(0x20_0000));
        assert!(list.as_slice()[0].is_stale());
    }

    #[test]
    fn growth_doubles() {
        let target = bo(0x1000);
        let mut list = RelocList::with_capacity(4);
        for i in 0..5 {
            list.add(i * 8, &target, 0).unwrap();
        }
        assert!(list.capacity() >= 8);
        assert_eq!(list.len(), 5);
    }

    #[test]
    fn append_shifts_locations() {
        let a = bo(0x1000);
        let b = bo(0x2000);
        let mut inner = RelocList::new();
        inner.add(4, &a, 0).unwrap();
        inner.add(20, &b, 16).unwrap();

        let mut outer = RelocList::new();
        outer.add(0, &a, 0).unwrap();
        outer.append(&inner, 256).unwrap();

        let locations: Vec<u32> = outer.iter().map(|r| r.location).collect();
        assert_eq!(locations, vec![0, 260, 276]);
        assert_eq!(outer.as_slice()[2].delta, 16);
        assert!(Arc::ptr_eq(&outer.as_slice()[2].target, &b));
    }

    #[test]
    fn clear_keeps_capacity() {
        let target = bo(0x1000);
        let mut list = RelocList::with_capacity(2);
        list.add(0, &target, 0).unwrap();
        let capacity = list.capacity();
        list.clear();
        assert!(list.is_empty());
        assert_eq!(list.capacity(), capacity);
    }
}
