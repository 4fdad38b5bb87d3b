//! Admission control gate ("attendant") for object creation under memory pressure.

use std::sync::{Arc, Condvar, Mutex};

use crate::error::{EngineResult, ReturnCode};
use crate::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateMode {
    Active,
    /// Waiters give up; a later `resume` re-opens the gate.
    Paused,
    /// Final. Waiters give up and nothing is admitted again.
    Stopped,
}

#[derive(Debug)]
struct GateState {
    mode: GateMode,
    // Bumped on every notify so a waiter never misses a wake-up between checks.
    epoch: u64,
    // Bumped on every pause; a waiter that saw one fails even if the gate was resumed since.
    pauses: u64,
}

/// Blocks object creation until the store has room. Clones share one gate.
#[derive(Debug, Clone)]
pub struct Attendant {
    inner: Arc<(Mutex<GateState>, Condvar)>,
}

impl Default for Attendant {
    fn default() -> Self {
        Self::new()
    }
}

impl Attendant {
    pub fn new() -> Self {
        Self {
            inner: Arc::new((
                Mutex::new(GateState {
                    mode: GateMode::Active,
                    epoch: 0,
                    pauses: 0,
                }),
                Condvar::new(),
            )),
        }
    }

    pub fn mode(&self) -> GateMode {
        lock(&self.inner.0).mode
    }

    /// Block until `has_space` holds. Fails with `Interrupted` while the gate is paused or stopped,
    /// and when it was paused at any point during the wait.
    pub fn admit(&self, mut has_space: impl FnMut() -> bool) -> EngineResult<()> {
        let (state, cv) = &*self.inner;
        let pauses = lock(state).pauses;
        loop {
            let epoch = {
                let guard = lock(state);
                if guard.mode != GateMode::Active || guard.pauses != pauses {
                    return Err(ReturnCode::Interrupted);
                }
                guard.epoch
            };
            if has_space() {
                return Ok(());
            }
            let mut guard = lock(state);
            while guard.mode == GateMode::Active && guard.epoch == epoch {
                guard = cv.wait(guard).unwrap_or_else(std::sync::PoisonError::into_inner);
            }
        }
    }

    pub fn same_gate(&self, other: &Attendant) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Space may have been freed; re-check waiters.
    pub fn notify(&self) {
        let (state, cv) = &*self.inner;
        lock(state).epoch += 1;
        cv.notify_all();
    }

    pub fn pause(&self) {
        let (state, cv) = &*self.inner;
        let mut guard = lock(state);
        if guard.mode == GateMode::Active {
            guard.mode = GateMode::Paused;
            guard.pauses += 1;
            guard.epoch += 1;
            cv.notify_all();
        }
    }

    pub fn resume(&self) {
        self.set_mode(GateMode::Active, |m| m == GateMode::Paused);
    }

    pub fn stop(&self) {
        self.set_mode(GateMode::Stopped, |_| true);
    }

    fn set_mode(&self, to: GateMode, when: impl Fn(GateMode) -> bool) {
        let (state, cv) = &*self.inner;
        let mut guard = lock(state);
        if when(guard.mode) {
            guard.mode = to;
            guard.epoch += 1;
            cv.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn admits_immediately_with_space() {
        let gate = Attendant::new();
        assert!(gate.admit(|| true).is_ok());
    }

    #[test]
    fn waits_until_notified() {
        let gate = Attendant::new();
        let space = Arc::new(AtomicBool::new(false));
        let (g, s) = (gate.clone(), space.clone());
        let waiter = thread::spawn(move || g.admit(|| s.load(Ordering::SeqCst)));
        thread::sleep(Duration::from_millis(20));
        space.store(true, Ordering::SeqCst);
        gate.notify();
        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn pause_fails_waiter_and_resume_reopens() {
        let gate = Attendant::new();
        let g = gate.clone();
        let waiter = thread::spawn(move || g.admit(|| false));
        thread::sleep(Duration::from_millis(20));
        gate.pause();
        assert_eq!(waiter.join().unwrap(), Err(ReturnCode::Interrupted));
        assert_eq!(gate.mode(), GateMode::Paused);
        gate.resume();
        assert_eq!(gate.mode(), GateMode::Active);
        assert!(gate.admit(|| true).is_ok());
    }

    #[test]
    fn pause_fails_waiter_even_after_quick_resume() {
        let gate = Attendant::new();
        let g = gate.clone();
        let waiter = thread::spawn(move || g.admit(|| false));
        thread::sleep(Duration::from_millis(20));
        // The waiter may only get the lock back after the resume.
        gate.pause();
        gate.resume();
        assert_eq!(waiter.join().unwrap(), Err(ReturnCode::Interrupted));
        assert_eq!(gate.mode(), GateMode::Active);
    }

    #[test]
    fn stop_is_final() {
        let gate = Attendant::new();
        gate.stop();
        gate.resume();
        assert_eq!(gate.mode(), GateMode::Stopped);
        assert_eq!(gate.admit(|| true), Err(ReturnCode::Interrupted));
    }
}
