//! Allocators over kernel memory.
//!
//! # Layers
//!
//! ```text
//! ┌───────────────────────┐ ┌───────────────────────┐
//! │ StatePool (shared)    │ │ StateStream (session) │
//! │ size classes 64..1K   │ │ bump + block chain    │
//! └───────────┬───────────┘ └───────────┬───────────┘
//!             └──────────┬──────────────┘
//!             ┌──────────▼──────────┐
//!             │ BlockPool           │   FreeList + {next, end} cursor,
//!             │ growable mapping    │   doubling growth, retired maps
//!             └──────────┬──────────┘
//!                        │ bind_userptr
//!             ┌──────────▼──────────┐
//!             │ MemoryProvider      │
//!             └─────────────────────┘
//! ```
//!
//! `BoPool` sits beside the block pools and recycles whole buffer objects
//! for batch buffers.

mod block_pool;
mod bo_pool;
mod cursor;
mod free_list;
mod gate;
mod state_pool;
mod state_stream;

pub use block_pool::{BlockPool, BlockPoolStats};
pub use bo_pool::{BoPool, BoPoolStats};
pub use free_list::{EMPTY, FreeList, LinkStore};
pub use gate::GrowthGate;
pub use state_pool::{StatePool, StatePoolStats};
pub use state_stream::StateStream;
