//! Strongly-typed handles used across stratum.

mod handle;
mod state;

pub use handle::{BoHandle, GpuAddress};
pub use state::{Block, State};
pub(crate) use state::Lease;
