//! Process-wide actuation lock. Holders get an RAII guard; contenders never
//! wait, they skip their tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct ActuationLock {
    busy: Arc<AtomicBool>,
}

/// Releases the lock on drop.
#[derive(Debug)]
pub struct ActuationGuard {
    busy: Arc<AtomicBool>,
    holder: &'static str,
}

impl ActuationLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock if it is free. Returns `None` when someone else holds it.
    pub fn try_acquire(&self, holder: &'static str) -> Option<ActuationGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ActuationGuard {
                busy: Arc::clone(&self.busy),
                holder,
            })
    }

    #[cfg(test)]
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

impl ActuationGuard {
    pub fn holder(&self) -> &'static str {
        self.holder
    }
}

impl Drop for ActuationGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}
