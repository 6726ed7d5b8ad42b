//! Session-lock gate.
//!
//! The host UI flips this flag on user session transitions; every connection
//! task samples it between I/O rounds and stops moving bytes while the
//! session is locked.  A gate can be constructed disabled, in which case it
//! reads as perpetually unlocked — that models the "ignore session lock"
//! configuration without a second code path at the call sites.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cloneable handle to the process-wide lock flag.
#[derive(Debug, Clone, Default)]
pub struct SessionGate {
    flag: Option<Arc<AtomicBool>>,
}

impl SessionGate {
    /// A live gate, initially unlocked.
    pub fn new() -> Self {
        Self {
            flag: Some(Arc::new(AtomicBool::new(false))),
        }
    }

    /// A gate that never reports locked.
    pub fn disabled() -> Self {
        Self { flag: None }
    }

    /// Mark the session locked (release ordering).
    pub fn lock(&self) {
        if let Some(flag) = &self.flag {
            flag.store(true, Ordering::Release);
        }
    }

    /// Mark the session unlocked (release ordering).
    pub fn unlock(&self) {
        if let Some(flag) = &self.flag {
            flag.store(false, Ordering::Release);
        }
    }

    /// Observe the flag (acquire ordering).  Disabled gates are never
    /// locked.
    pub fn is_locked(&self) -> bool {
        self.flag
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let gate = SessionGate::new();
        let observer = gate.clone();
        assert!(!observer.is_locked());
        gate.lock();
        assert!(observer.is_locked());
        gate.unlock();
        assert!(!observer.is_locked());
    }

    #[test]
    fn disabled_gate_ignores_lock() {
        let gate = SessionGate::disabled();
        gate.lock();
        assert!(!gate.is_locked());
    }
}
