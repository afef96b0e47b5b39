//! Boundary to the kernel driver.
//!
//! The allocators only ever talk to the kernel through [`MemoryProvider`],
//! and finalized command buffers leave through [`Submitter`]. A complete
//! in-process implementation of both lives in [`host`].

mod bo;
pub mod host;

pub use bo::BufferObject;
pub use host::{HostKernel, SubmissionRecord};

use crate::error::Result;
use crate::exec::ExecBuffer;
use crate::types::{BoHandle, GpuAddress};
use std::ptr::NonNull;

/// Creates, maps and releases kernel memory objects.
///
/// Implementations must be usable from many threads at once: block pools
/// call into the provider from whichever thread wins a growth race.
pub trait MemoryProvider: Send + Sync {
    /// Create a buffer object of `size` bytes.
    fn create(&self, size: u64) -> Result<BoHandle>;

    /// Map `size` bytes of a buffer object starting at `offset`.
    fn map(&self, handle: BoHandle, offset: u64, size: u64) -> Result<NonNull<u8>>;

    /// Release a mapping returned by [`map`](Self::map).
    fn unmap(&self, ptr: NonNull<u8>, size: u64);

    /// Promote host memory to a GPU-visible buffer object.
    ///
    /// The caller keeps `ptr..ptr + size` alive until the returned handle is
    /// closed.
    fn bind_userptr(&self, ptr: NonNull<u8>, size: u64) -> Result<BoHandle>;

    /// Close a handle. Closing an unknown handle is a no-op.
    fn close(&self, handle: BoHandle);

    /// Address the kernel currently places the object at.
    fn address(&self, handle: BoHandle) -> GpuAddress;
}

/// Executes a finalized buffer table.
pub trait Submitter: Send + Sync {
    /// Run `exec` and return the final GPU address of every object, in
    /// table order.
    fn execute(&self, exec: &ExecBuffer) -> Result<Vec<GpuAddress>>;
}
