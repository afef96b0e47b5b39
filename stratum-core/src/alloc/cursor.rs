//! `{next, end}` bump cursor packed into one atomic word.
//!
//! Allocators advance `next` with a fetch-add on the whole word. The thread
//! whose add lands exactly on `end` refills the cursor, every thread that
//! overshoots waits for `end` to change.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Cursor {
    pub next: u32,
    pub end: u32,
}

impl Cursor {
    pub const fn pack(self) -> u64 {
        (self.end as u64) << 32 | self.next as u64
    }

    pub const fn unpack(raw: u64) -> Self {
        Self {
            next: raw as u32,
            end: (raw >> 32) as u32,
        }
    }
}

/// Outcome of advancing a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Bump {
    /// The reserved range is inside `[next, end)`.
    Fits(u32),
    /// The caller hit `end` exactly and must refill.
    Refill(Cursor),
    /// Another thread is refilling; wait for `end` to move past this value.
    Wait(u32),
}

#[derive(Debug, Default)]
pub(crate) struct AtomicCursor(AtomicU64);

impl AtomicCursor {
    pub fn load(&self) -> Cursor {
        Cursor::unpack(self.0.load(Ordering::Acquire))
    }

    pub fn end(&self) -> u32 {
        self.load().end
    }

    pub fn bump(&self, size: u32) -> Bump {
        let old = Cursor::unpack(self.0.fetch_add(u64::from(size), Ordering::AcqRel));
        if old.next < old.end {
            Bump::Fits(old.next)
        } else if old.next == old.end {
            Bump::Refill(old)
        } else {
            Bump::Wait(old.end)
        }
    }

    /// Install a refilled cursor. Overwriting the whole word discards the
    /// speculative increments of every thread that overshot the old end.
    pub fn publish(&self, cursor: Cursor) {
        self.0.swap(cursor.pack(), Ordering::AcqRel);
    }
}
