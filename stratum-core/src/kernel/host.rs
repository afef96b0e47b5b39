//! In-process kernel for running without GPU hardware.
//!
//! `HostKernel` backs every buffer object with anonymous memory, hands out
//! addresses from a simulated 48-bit GPU address space and executes buffer
//! tables by validating them and applying relocations the way the kernel
//! would: any relocation whose presumed address is stale gets patched in
//! the owner's memory.

use super::{MemoryProvider, Submitter};
use crate::error::{Result, StratumError};
use crate::exec::ExecBuffer;
use crate::types::{BoHandle, GpuAddress};
use memmap2::MmapMut;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ptr::NonNull;

/// First address handed out. Placed above 4 GiB so the high dword of an
/// address is exercised.
const ADDRESS_BASE: u64 = 1 << 32;

/// End of the simulated address space.
const ADDRESS_LIMIT: u64 = 1 << 48;

const PAGE_SIZE: u64 = 4096;

enum Backing {
    Owned(MmapMut),
    /// Host memory owned by the caller of `bind_userptr`.
    User { ptr: usize },
}

struct HostObject {
    size: u64,
    address: u64,
    backing: Backing,
}

impl HostObject {
    fn base_ptr(&mut self) -> *mut u8 {
        match &mut self.backing {
            Backing::Owned(mmap) => mmap.as_mut_ptr(),
            Backing::User { ptr } => *ptr as *mut u8,
        }
    }
}

/// Summary of one executed buffer table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionRecord {
    /// Handles in table order; the last one is the batch.
    pub handles: Vec<BoHandle>,
    /// Total relocation entries.
    pub relocations: usize,
    /// Relocations that had a stale presumed address and were patched.
    pub patched: usize,
    /// Whether the table asked for relocation processing.
    pub need_reloc: bool,
    /// Bytes of the batch executed.
    pub batch_len: u32,
}

struct HostState {
    objects: HashMap<BoHandle, HostObject>,
    next_handle: u32,
    next_address: u64,
    submissions: Vec<SubmissionRecord>,
}

/// A complete [`MemoryProvider`] and [`Submitter`] backed by host memory.
pub struct HostKernel {
    state: Mutex<HostState>,
}

impl Default for HostKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl HostKernel {
    /// Create an empty kernel.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HostState {
                objects: HashMap::new(),
                next_handle: 1,
                next_address: ADDRESS_BASE,
                submissions: Vec::new(),
            }),
        }
    }

    /// Number of open handles.
    pub fn object_count(&self) -> usize {
        self.state.lock().objects.len()
    }

    /// Move a buffer object to a new address, as the kernel may do between
    /// submissions. Returns false for unknown handles.
    pub fn move_buffer(&self, handle: BoHandle, address: GpuAddress) -> bool {
        match self.state.lock().objects.get_mut(&handle) {
            Some(object) => {
                object.address = address.as_u64();
                true
            }
            None => false,
        }
    }

    /// Copy `len` bytes of a buffer object starting at `offset`.
    pub fn read(&self, handle: BoHandle, offset: u64, len: usize) -> Option<Vec<u8>> {
        let mut state = self.state.lock();
        let object = state.objects.get_mut(&handle)?;
        if offset + len as u64 > object.size {
            return None;
        }
        let mut out = vec![0u8; len];
        // SAFETY: the range was checked against the object size and the
        // backing stays alive while the handle is open.
        unsafe {
            std::ptr::copy_nonoverlapping(
                object.base_ptr().add(offset as usize),
                out.as_mut_ptr(),
                len,
            );
        }
        Some(out)
    }

    /// Every buffer table executed so far.
    pub fn submissions(&self) -> Vec<SubmissionRecord> {
        self.state.lock().submissions.clone()
    }

    fn insert(&self, size: u64, backing: Backing) -> std::result::Result<BoHandle, String> {
        let mut state = self.state.lock();
        let span = size.div_ceil(PAGE_SIZE) * PAGE_SIZE + PAGE_SIZE;
        if state.next_address + span > ADDRESS_LIMIT {
            return Err("GPU address space exhausted".to_string());
        }
        let handle = BoHandle::new(state.next_handle);
        state.next_handle += 1;
        let address = state.next_address;
        state.next_address += span;
        state.objects.insert(
            handle,
            HostObject {
                size,
                address,
                backing,
            },
        );
        Ok(handle)
    }
}

impl MemoryProvider for HostKernel {
    fn create(&self, size: u64) -> Result<BoHandle> {
        if size == 0 {
            return Err(StratumError::KernelCreate {
                size,
                cause: "zero-sized buffer object".to_string(),
            });
        }
        let mmap = MmapMut::map_anon(size as usize).map_err(|e| StratumError::KernelCreate {
            size,
            cause: e.to_string(),
        })?;
        self.insert(size, Backing::Owned(mmap))
            .map_err(|cause| StratumError::KernelCreate { size, cause })
    }

    fn map(&self, handle: BoHandle, offset: u64, size: u64) -> Result<NonNull<u8>> {
        let mut state = self.state.lock();
        let object = state
            .objects
            .get_mut(&handle)
            .ok_or_else(|| StratumError::KernelMap {
                handle,
                cause: "unknown handle".to_string(),
            })?;
        if offset + size > object.size {
            return Err(StratumError::KernelMap {
                handle,
                cause: format!(
                    "range {}..{} outside object of {} bytes",
                    offset,
                    offset + size,
                    object.size
                ),
            });
        }
        // SAFETY: offset is inside the object.
        let ptr = unsafe { object.base_ptr().add(offset as usize) };
        NonNull::new(ptr).ok_or_else(|| StratumError::KernelMap {
            handle,
            cause: "null mapping".to_string(),
        })
    }

    fn unmap(&self, _ptr: NonNull<u8>, _size: u64) {
        // Mappings alias the object's backing, which lives until close.
    }

    fn bind_userptr(&self, ptr: NonNull<u8>, size: u64) -> Result<BoHandle> {
        if size == 0 || size % PAGE_SIZE != 0 {
            return Err(StratumError::KernelBind {
                size,
                cause: "userptr size must be a non-zero multiple of the page size".to_string(),
            });
        }
        self.insert(
            size,
            Backing::User {
                ptr: ptr.as_ptr() as usize,
            },
        )
        .map_err(|cause| StratumError::KernelBind { size, cause })
    }

    fn close(&self, handle: BoHandle) {
        self.state.lock().objects.remove(&handle);
    }

    fn address(&self, handle: BoHandle) -> GpuAddress {
        self.state
            .lock()
            .objects
            .get(&handle)
            .map(|o| GpuAddress::new(o.address))
            .unwrap_or_default()
    }
}

impl Submitter for HostKernel {
    fn execute(&self, exec: &ExecBuffer) -> Result<Vec<GpuAddress>> {
        let mut state = self.state.lock();
        let objects = exec.objects();
        let batch = objects.last().ok_or_else(|| StratumError::Submission {
            cause: "empty buffer table".to_string(),
        })?;
        if u64::from(exec.batch_len()) > batch.size || exec.batch_len() % 8 != 0 {
            return Err(StratumError::Submission {
                cause: format!(
                    "batch length {} invalid for {}-byte batch object",
                    exec.batch_len(),
                    batch.size
                ),
            });
        }

        let mut addresses = Vec::with_capacity(objects.len());
        for object in objects {
            let host = state
                .objects
                .get(&object.handle)
                .ok_or_else(|| StratumError::Submission {
                    cause: format!("unknown handle {}", object.handle),
                })?;
            addresses.push(host.address);
        }

        let mut relocations = 0;
        let mut patched = 0;
        for object in objects {
            for reloc in &object.relocations {
                relocations += 1;
                let target = *addresses.get(reloc.target_index as usize).ok_or_else(|| {
                    StratumError::Submission {
                        cause: format!(
                            "relocation in {} targets index {} of {}",
                            object.handle,
                            reloc.target_index,
                            objects.len()
                        ),
                    }
                })?;
                if u64::from(reloc.offset) + 8 > object.size {
                    return Err(StratumError::Submission {
                        cause: format!(
                            "relocation at {} outside {} ({} bytes)",
                            reloc.offset, object.handle, object.size
                        ),
                    });
                }
                if target == reloc.presumed_address.as_u64() {
                    continue;
                }
                let value = target.wrapping_add(u64::from(reloc.delta)).to_le_bytes();
                if let Some(host) = state.objects.get_mut(&object.handle) {
                    // SAFETY: the location was bounds-checked against the
                    // object size above.
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            value.as_ptr(),
                            host.base_ptr().add(reloc.offset as usize),
                            value.len(),
                        );
                    }
                }
                patched += 1;
            }
        }

        tracing::debug!(
            buffers = objects.len(),
            relocations,
            patched,
            need_reloc = exec.need_reloc(),
            "host kernel executed buffer table"
        );
        state.submissions.push(SubmissionRecord {
            handles: objects.iter().map(|o| o.handle).collect(),
            relocations,
            patched,
            need_reloc: exec.need_reloc(),
            batch_len: exec.batch_len(),
        });

        Ok(addresses.into_iter().map(GpuAddress::new).collect())
    }
}
