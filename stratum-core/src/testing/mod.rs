//! Test support: fault-injecting kernel providers.
//!
//! [`HostKernel`](crate::kernel::HostKernel) covers the happy path; the
//! types here make it misbehave.

pub mod chaos;

pub use chaos::{ChaosConfig, ChaosKernel};
