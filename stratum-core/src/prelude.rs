//! Prelude for convenient imports.
//!
//! This module re-exports the most commonly used types and traits.
//!
//! # Example
//!
//! ```ignore
//! use stratum_core::prelude::*;
//! ```

// Core types
pub use crate::types::{Block, BoHandle, GpuAddress, State};

// Error handling
pub use crate::error::{Result, StratumError};

// Configuration
pub use crate::config::{BatchConfig, BlockPoolConfig, DeviceConfig, StatePoolConfig};

// Kernel boundary
pub use crate::kernel::{BufferObject, HostKernel, MemoryProvider, Submitter};

// Allocators
pub use crate::alloc::{BlockPool, BoPool, StatePool, StateStream};

// Batches and finalize
pub use crate::batch::{Batch, BatchBufferSource, RelocList, Relocation};
pub use crate::exec::{ExecBuffer, ExecLock, ExecObject, RelocationEntry};

// Device
pub use crate::device::{CommandRecording, Device, Queue};
