//! Wait primitive for threads that lose a growth race.

use parking_lot::{Condvar, Mutex};

/// Parks threads until a refill publishes a new cursor end.
///
/// Waiters re-check their condition under the mutex and the refilling thread
/// takes the mutex before notifying, so a wakeup cannot slip between the
/// check and the wait.
#[derive(Debug, Default)]
pub struct GrowthGate {
    lock: Mutex<()>,
    cond: Condvar,
}

impl GrowthGate {
    /// Create a gate with no waiters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Block while `blocked` returns true.
    pub fn wait_while(&self, mut blocked: impl FnMut() -> bool) {
        let mut guard = self.lock.lock();
        while blocked() {
            self.cond.wait(&mut guard);
        }
    }

    /// Wake every parked thread.
    pub fn wake_all(&self) {
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn waiter_released_by_wake() {
        let gate = GrowthGate::new();
        let ready = AtomicBool::new(false);
        std::thread::scope(|s| {
            let waiter = s.spawn(|| gate.wait_while(|| !ready.load(Ordering::Acquire)));
            std::thread::sleep(std::time::Duration::from_millis(10));
            ready.store(true, Ordering::Release);
            gate.wake_all();
            waiter.join().unwrap();
        });
    }

    #[test]
    fn satisfied_condition_does_not_block() {
        GrowthGate::new().wait_while(|| false);
    }
}
