//! Lock-free LIFO of offsets linked through the memory they describe.
//!
//! The head is a single 64-bit word holding the offset of the first free
//! element and a generation counter. Each free element stores the offset of
//! the next one in its first four bytes. Every successful push or pop bumps
//! the generation, so a compare-and-swap that raced with a pop/push/pop of
//! the same offset fails instead of installing a stale link (ABA).

use std::sync::atomic::{AtomicU64, Ordering};

/// Sentinel offset marking the end of a list. Never a valid element since
/// elements are at least 4-byte aligned.
pub const EMPTY: u32 = 1;

/// Storage for the per-element next links.
pub trait LinkStore {
    /// Read the link stored at `offset`.
    fn read_link(&self, offset: u32) -> u32;

    /// Store `next` as the link at `offset`.
    fn write_link(&self, offset: u32, next: u32);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Head {
    offset: u32,
    count: u32,
}

impl Head {
    const fn pack(self) -> u64 {
        (self.count as u64) << 32 | self.offset as u64
    }

    const fn unpack(raw: u64) -> Self {
        Self {
            offset: raw as u32,
            count: (raw >> 32) as u32,
        }
    }
}

/// A multi-producer, multi-consumer free list.
#[derive(Debug)]
pub struct FreeList {
    head: AtomicU64,
}

impl Default for FreeList {
    fn default() -> Self {
        Self::new()
    }
}

impl FreeList {
    /// Create an empty list.
    pub const fn new() -> Self {
        Self {
            head: AtomicU64::new(
                Head {
                    offset: EMPTY,
                    count: 0,
                }
                .pack(),
            ),
        }
    }

    /// Check whether the list is empty at this instant.
    pub fn is_empty(&self) -> bool {
        Head::unpack(self.head.load(Ordering::Acquire)).offset == EMPTY
    }

    /// Pop the most recently pushed offset.
    pub fn pop(&self, links: &impl LinkStore) -> Option<u32> {
        let mut current = Head::unpack(self.head.load(Ordering::Acquire));
        loop {
            if current.offset == EMPTY {
                return None;
            }
            // The element may be popped and rewritten by another thread
            // before the swap below; the generation check rejects that case.
            let next = links.read_link(current.offset);
            let new = Head {
                offset: next,
                count: current.count.wrapping_add(1),
            };
            match self.head.compare_exchange_weak(
                current.pack(),
                new.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(current.offset),
                Err(actual) => current = Head::unpack(actual),
            }
        }
    }

    /// Push `offset` onto the list.
    pub fn push(&self, offset: u32, links: &impl LinkStore) {
        debug_assert_ne!(offset, EMPTY, "pushed the free-list sentinel");
        debug_assert_eq!(offset % 4, 0, "free-list element is not 4-byte aligned");
        let mut current = Head::unpack(self.head.load(Ordering::Relaxed));
        loop {
            links.write_link(offset, current.offset);
            let new = Head {
                offset,
                count: current.count.wrapping_add(1),
            };
            match self.head.compare_exchange_weak(
                current.pack(),
                new.pack(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = Head::unpack(actual),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::Barrier;
    use std::sync::atomic::AtomicU32;

    /// Links stored in a word array indexed by offset / 4.
    struct Words(Vec<AtomicU32>);

    impl Words {
        fn new(bytes: usize) -> Self {
            Self((0..bytes / 4).map(|_| AtomicU32::new(0)).collect())
        }
    }

    impl LinkStore for Words {
        fn read_link(&self, offset: u32) -> u32 {
            self.0[offset as usize / 4].load(Ordering::Relaxed)
        }

        fn write_link(&self, offset: u32, next: u32) {
            self.0[offset as usize / 4].store(next, Ordering::Relaxed);
        }
    }

    #[test]
    fn empty_list_pops_none() {
        let list = FreeList::new();
        let words = Words::new(64);
        assert!(list.is_empty());
        assert_eq!(list.pop(&words), None);
    }

    #[test]
    fn lifo_order() {
        let list = FreeList::new();
        let words = Words::new(1024);
        for offset in [0, 64, 128] {
            list.push(offset, &words);
        }
        assert_eq!(list.pop(&words), Some(128));
        list.push(512, &words);
        assert_eq!(list.pop(&words), Some(512));
        assert_eq!(list.pop(&words), Some(64));
        assert_eq!(list.pop(&words), Some(0));
        assert_eq!(list.pop(&words), None);
    }

    #[test]
    fn generation_advances_on_every_operation() {
        let list = FreeList::new();
        let words = Words::new(256);
        list.push(64, &words);
        list.pop(&words);
        list.push(64, &words);
        let head = Head::unpack(list.head.load(Ordering::Relaxed));
        assert_eq!(head.offset, 64);
        assert_eq!(head.count, 3);
    }

    #[test]
    fn concurrent_push_pop_never_duplicates() {
        const THREADS: usize = 8;
        const ELEMENTS: u32 = 256;
        const ROUNDS: usize = 2000;

        let list = FreeList::new();
        let words = Words::new(ELEMENTS as usize * 64);
        for i in 0..ELEMENTS {
            list.push(i * 64, &words);
        }

        let live = Mutex::new(HashSet::new());
        let barrier = Barrier::new(THREADS);
        std::thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|| {
                    barrier.wait();
                    for _ in 0..ROUNDS {
                        let Some(offset) = list.pop(&words) else {
                            continue;
                        };
                        assert!(live.lock().insert(offset), "{offset} popped twice");
                        assert!(live.lock().remove(&offset));
                        list.push(offset, &words);
                    }
                });
            }
        });

        let mut drained = HashSet::new();
        while let Some(offset) = list.pop(&words) {
            assert!(drained.insert(offset));
        }
        assert_eq!(drained.len(), ELEMENTS as usize);
    }
}
