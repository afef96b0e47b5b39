//! Stratum Core Library
//!
//! Memory and command-encoding core of a GPU driver.
//!
//! # Key Components
//!
//! - **Block pool**: a growable, lock-free pool of fixed-size blocks over one
//!   kernel buffer object
//! - **State pool / state stream**: size-class and bump allocators carved
//!   from block pools
//! - **Batch**: a chaining command encoder with a relocation list
//! - **Exec**: consolidation of a recording into a deduplicated buffer table
//! - **Device**: the context that owns the pools, plus recording sessions and
//!   a submission queue
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use stratum_core::prelude::*;
//!
//! let kernel = Arc::new(HostKernel::new());
//! let device = Device::new(DeviceConfig::default(), kernel.clone())?;
//! let queue = Queue::new(device.clone(), kernel.clone());
//!
//! let mut rec = CommandRecording::new(&device)?;
//! let state = rec.alloc_dynamic_state(64, 64)?;
//! rec.emit_address_command(0x7800_0000, device.dynamic_state_pool().bo(), state.offset())?;
//! let exec = rec.end()?;
//! let serial = queue.submit(&exec)?;
//! assert_eq!(serial, 1);
//! # Ok::<(), StratumError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod alloc;
pub mod batch;
pub mod config;
pub mod device;
pub mod error;
pub mod exec;
pub mod kernel;
pub mod prelude;
pub mod testing;
pub mod types;

// Re-export key types at crate root for convenience
pub use alloc::{BlockPool, BoPool, StatePool, StateStream};
pub use batch::{Batch, RelocList};
pub use config::DeviceConfig;
pub use device::{CommandRecording, Device, Queue};
pub use error::{Result, StratumError};
pub use exec::ExecBuffer;
pub use types::{Block, BoHandle, GpuAddress, State};
