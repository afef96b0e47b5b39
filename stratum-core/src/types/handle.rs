//! Kernel-side identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kernel handle of a buffer object.
///
/// Handles are small integers issued by the memory provider. Zero is never
/// issued and is used to mark a buffer object that has no backing yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct BoHandle(u32);

impl BoHandle {
    /// The null handle.
    pub const NULL: Self = Self(0);

    /// Create a handle from its raw value.
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw handle value.
    #[must_use]
    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    /// Check if this is the null handle.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for BoHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bo#{}", self.0)
    }
}

impl From<u32> for BoHandle {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

/// Address of a buffer object in the GPU's virtual address space.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct GpuAddress(u64);

impl GpuAddress {
    /// Create an address from its raw value.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw address.
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Offset the address by `delta` bytes.
    #[must_use]
    pub const fn add(&self, delta: u64) -> Self {
        Self(self.0.wrapping_add(delta))
    }

    /// Split into the (low, high) dwords a command word expects.
    #[must_use]
    pub const fn to_dwords(&self) -> (u32, u32) {
        (self.0 as u32, (self.0 >> 32) as u32)
    }
}

impl fmt::Display for GpuAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:012x}", self.0)
    }
}

impl From<u64> for GpuAddress {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}
