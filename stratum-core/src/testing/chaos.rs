//! Fault injection for kernel memory providers.
//!
//! Wraps a [`MemoryProvider`] and makes `create` and `bind_userptr` fail on
//! demand, to test out-of-memory propagation and pool poisoning.

use crate::error::{Result, StratumError};
use crate::kernel::MemoryProvider;
use crate::types::{BoHandle, GpuAddress};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Which provider calls fail, and when.
///
/// # Example
///
/// ```
/// use stratum_core::testing::ChaosConfig;
///
/// let config = ChaosConfig::new()
///     .with_seed(42)
///     .with_bind_failure_rate(0.1)
///     .fail_create_after(3);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ChaosConfig {
    /// Probability of a `create` call failing (0.0 - 1.0).
    pub create_failure_rate: f64,
    /// Probability of a `bind_userptr` call failing (0.0 - 1.0).
    pub bind_failure_rate: f64,
    /// Number of `create` calls that succeed before every later one fails.
    pub create_budget: Option<u64>,
    /// Number of `bind_userptr` calls that succeed before every later one fails.
    pub bind_budget: Option<u64>,
    /// Random seed for reproducibility.
    pub seed: u64,
}

impl ChaosConfig {
    /// Create a configuration that injects nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the random seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the probability of `create` failing.
    pub fn with_create_failure_rate(mut self, rate: f64) -> Self {
        self.create_failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Set the probability of `bind_userptr` failing.
    pub fn with_bind_failure_rate(mut self, rate: f64) -> Self {
        self.bind_failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Let `calls` creates succeed, then fail every one after.
    pub fn fail_create_after(mut self, calls: u64) -> Self {
        self.create_budget = Some(calls);
        self
    }

    /// Let `calls` binds succeed, then fail every one after.
    pub fn fail_bind_after(mut self, calls: u64) -> Self {
        self.bind_budget = Some(calls);
        self
    }
}

/// A [`MemoryProvider`] that fails according to a [`ChaosConfig`].
pub struct ChaosKernel {
    inner: Arc<dyn MemoryProvider>,
    config: ChaosConfig,
    rng: parking_lot::Mutex<StdRng>,
    creates: AtomicU64,
    binds: AtomicU64,
    injected: AtomicU64,
}

impl ChaosKernel {
    /// Wrap `inner`.
    pub fn new(inner: Arc<dyn MemoryProvider>, config: ChaosConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            inner,
            config,
            rng: parking_lot::Mutex::new(rng),
            creates: AtomicU64::new(0),
            binds: AtomicU64::new(0),
            injected: AtomicU64::new(0),
        }
    }

    /// Number of failures injected so far.
    pub fn injection_count(&self) -> u64 {
        self.injected.load(Ordering::SeqCst)
    }

    /// The configuration.
    pub fn config(&self) -> &ChaosConfig {
        &self.config
    }

    fn should_fail(&self, calls: &AtomicU64, budget: Option<u64>, rate: f64) -> bool {
        let call = calls.fetch_add(1, Ordering::SeqCst);
        let fail = budget.is_some_and(|b| call >= b)
            || (rate > 0.0 && self.rng.lock().r#gen::<f64>() < rate);
        if fail {
            self.injected.fetch_add(1, Ordering::SeqCst);
        }
        fail
    }
}

impl MemoryProvider for ChaosKernel {
    fn create(&self, size: u64) -> Result<BoHandle> {
        let (budget, rate) = (self.config.create_budget, self.config.create_failure_rate);
        if self.should_fail(&self.creates, budget, rate) {
            return Err(StratumError::KernelCreate {
                size,
                cause: "injected failure".to_string(),
            });
        }
        self.inner.create(size)
    }

    fn map(&self, handle: BoHandle, offset: u64, size: u64) -> Result<NonNull<u8>> {
        self.inner.map(handle, offset, size)
    }

    fn unmap(&self, ptr: NonNull<u8>, size: u64) {
        self.inner.unmap(ptr, size);
    }

    fn bind_userptr(&self, ptr: NonNull<u8>, size: u64) -> Result<BoHandle> {
        if self.should_fail(&self.binds, self.config.bind_budget, self.config.bind_failure_rate) {
            return Err(StratumError::KernelBind {
                size,
                cause: "injected failure".to_string(),
            });
        }
        self.inner.bind_userptr(ptr, size)
    }

    fn close(&self, handle: BoHandle) {
        self.inner.close(handle);
    }

    fn address(&self, handle: BoHandle) -> GpuAddress {
        self.inner.address(handle)
    }
}

impl std::fmt::Debug for ChaosKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaosKernel")
            .field("config", &self.config)
            .field("injected", &self.injection_count())
            .finish()
    }
}
