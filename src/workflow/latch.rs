//! Re-entrancy and one-shot latches.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;

/// Whether a guarded operation is currently executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OpState {
    Idle,
    Running,
}

/// Drops overlapping calls to one operation instead of interleaving them.
#[derive(Debug, Default)]
pub struct OpLatch {
    running: AtomicBool,
}

impl OpLatch {
    /// Enter the operation. `None` when a call is already in flight.
    pub fn try_enter(&self) -> Option<OpGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| OpGuard {
                running: &self.running,
            })
    }

    pub fn state(&self) -> OpState {
        if self.running.load(Ordering::Acquire) {
            OpState::Running
        } else {
            OpState::Idle
        }
    }
}

/// Returns the latch to `Idle` when dropped.
#[derive(Debug)]
pub struct OpGuard<'a> {
    running: &'a AtomicBool,
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Fires at most once until explicitly reset.
#[derive(Debug, Default)]
pub struct OneShotLatch {
    fired: AtomicBool,
}

impl OneShotLatch {
    /// `true` for the first caller only.
    pub fn try_fire(&self) -> bool {
        self.fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn reset(&self) {
        self.fired.store(false, Ordering::Release);
    }
}
