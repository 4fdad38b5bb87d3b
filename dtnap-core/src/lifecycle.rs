//! Access-point lifecycle. Every transition happens under one mutex, and the side effects the
//! caller passes in run while it is held, so an engine signal can never race a release.

use std::fmt;
use std::sync::Mutex;

use log::warn;

use crate::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SapState {
    Idle,
    Running,
    Closing,
    Interrupting,
    /// Engine resources released. Terminal.
    Closed,
}

impl fmt::Display for SapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SapState::Idle => "idle",
            SapState::Running => "running",
            SapState::Closing => "closing",
            SapState::Interrupting => "interrupting",
            SapState::Closed => "closed",
        })
    }
}

/// What `close` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    /// Nothing in flight; resources released by the caller of `close`.
    Released,
    /// A receive is in flight; the receiving thread will release.
    Deferred,
    /// Already closing or closed.
    Nothing,
}

/// How a receive ended once the engine call returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settled {
    /// Back to idle; the engine outcome stands.
    Completed,
    /// Back to idle after an interrupt; report `Interrupted`.
    Interrupted,
    /// A close arrived mid-receive; resources released here, report `ConnectionAborted`.
    Released,
}

#[derive(Debug)]
pub struct Lifecycle {
    state: Mutex<SapState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SapState::Idle),
        }
    }

    pub fn state(&self) -> SapState {
        *lock(&self.state)
    }

    pub fn is_running(&self) -> bool {
        self.state() == SapState::Running
    }

    /// IDLE -> RUNNING. Any other state is returned as the error.
    pub fn begin_receive(&self) -> Result<(), SapState> {
        let mut state = lock(&self.state);
        match *state {
            SapState::Idle => {
                *state = SapState::Running;
                Ok(())
            }
            other => Err(other),
        }
    }

    /// RUNNING -> INTERRUPTING, running `signal` under the lock. No-op in any other state.
    pub fn interrupt(&self, signal: impl FnOnce()) -> bool {
        let mut state = lock(&self.state);
        if *state != SapState::Running {
            return false;
        }
        *state = SapState::Interrupting;
        signal();
        true
    }

    pub fn close(&self, signal: impl FnOnce(), release: impl FnOnce()) -> CloseAction {
        let mut state = lock(&self.state);
        match *state {
            SapState::Idle => {
                release();
                *state = SapState::Closed;
                CloseAction::Released
            }
            SapState::Running => {
                *state = SapState::Closing;
                signal();
                CloseAction::Deferred
            }
            // The engine was already signalled by the interrupt.
            SapState::Interrupting => {
                *state = SapState::Closing;
                CloseAction::Deferred
            }
            SapState::Closing | SapState::Closed => CloseAction::Nothing,
        }
    }

    /// Called by the receiving thread after the engine call returned.
    pub fn settle(&self, release: impl FnOnce(), resume: impl FnOnce()) -> Settled {
        let mut state = lock(&self.state);
        match *state {
            SapState::Running => {
                *state = SapState::Idle;
                Settled::Completed
            }
            SapState::Interrupting => {
                *state = SapState::Idle;
                resume();
                Settled::Interrupted
            }
            SapState::Closing => {
                release();
                *state = SapState::Closed;
                Settled::Released
            }
            other => {
                warn!("receive settled in unexpected state {other}");
                Settled::Completed
            }
        }
    }

    /// Release unconditionally. Only valid when no other thread can hold the access point.
    pub fn abandon(&self, release: impl FnOnce()) -> bool {
        let mut state = lock(&self.state);
        if *state == SapState::Closed {
            return false;
        }
        release();
        *state = SapState::Closed;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn close_idle_releases_once() {
        let lc = Lifecycle::new();
        let released = Cell::new(0);
        assert_eq!(
            lc.close(|| panic!("no signal on idle close"), || released.set(released.get() + 1)),
            CloseAction::Released
        );
        assert_eq!(lc.close(|| {}, || released.set(released.get() + 1)), CloseAction::Nothing);
        assert_eq!(released.get(), 1);
        assert_eq!(lc.state(), SapState::Closed);
    }

    #[test]
    fn interrupt_only_when_running() {
        let lc = Lifecycle::new();
        assert!(!lc.interrupt(|| panic!("idle interrupt must not signal")));
        assert_eq!(lc.state(), SapState::Idle);

        lc.begin_receive().unwrap();
        let signalled = Cell::new(false);
        assert!(lc.interrupt(|| signalled.set(true)));
        assert!(signalled.get());
        assert_eq!(lc.state(), SapState::Interrupting);
        // Second interrupt is a no-op.
        assert!(!lc.interrupt(|| panic!("double signal")));

        let resumed = Cell::new(false);
        assert_eq!(lc.settle(|| panic!("no release"), || resumed.set(true)), Settled::Interrupted);
        assert!(resumed.get());
        assert_eq!(lc.state(), SapState::Idle);
    }

    #[test]
    fn close_mid_receive_defers_release() {
        let lc = Lifecycle::new();
        lc.begin_receive().unwrap();
        let signalled = Cell::new(false);
        assert_eq!(
            lc.close(|| signalled.set(true), || panic!("released by closer")),
            CloseAction::Deferred
        );
        assert!(signalled.get());
        assert_eq!(lc.state(), SapState::Closing);

        let released = Cell::new(false);
        assert_eq!(lc.settle(|| released.set(true), || {}), Settled::Released);
        assert!(released.get());
        assert_eq!(lc.state(), SapState::Closed);
    }

    #[test]
    fn close_while_interrupting_goes_to_closing() {
        let lc = Lifecycle::new();
        lc.begin_receive().unwrap();
        lc.interrupt(|| {});
        assert_eq!(
            lc.close(|| panic!("already signalled"), || panic!("released by closer")),
            CloseAction::Deferred
        );
        assert_eq!(lc.settle(|| {}, || panic!("no resume when closing")), Settled::Released);
    }

    #[test]
    fn receive_needs_idle() {
        let lc = Lifecycle::new();
        lc.begin_receive().unwrap();
        assert_eq!(lc.begin_receive(), Err(SapState::Running));
        lc.settle(|| {}, || {});
        lc.close(|| {}, || {});
        assert_eq!(lc.begin_receive(), Err(SapState::Closed));
    }

    #[test]
    fn abandon_releases_unless_closed() {
        let lc = Lifecycle::new();
        lc.begin_receive().unwrap();
        let released = Cell::new(0);
        assert!(lc.abandon(|| released.set(released.get() + 1)));
        assert!(!lc.abandon(|| released.set(released.get() + 1)));
        assert_eq!(released.get(), 1);
    }
}
