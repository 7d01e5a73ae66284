//! Flusher state machine.
//!
//! The flusher runs as a single self-rescheduling task on the I/O
//! dispatcher. Each activation looks at the current state, does at most one
//! flush pass, and reports when to run next. Pause, resume and stop are
//! requests from other threads; the state only advances inside `step`.

use crate::dispatcher::JobOutcome;
use crate::store::CacheStore;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Weak;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlusherState {
    Initializing,
    Running,
    Pausing,
    Paused,
    Stopping,
    Stopped,
}

impl FlusherState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlusherState::Initializing => "initializing",
            FlusherState::Running => "running",
            FlusherState::Pausing => "pausing",
            FlusherState::Paused => "paused",
            FlusherState::Stopping => "stopping",
            FlusherState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for FlusherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn valid_transition(from: FlusherState, to: FlusherState) -> bool {
    use FlusherState::*;
    matches!(
        (from, to),
        (Initializing, Running)
            | (Initializing, Pausing)
            | (Initializing, Stopping)
            | (Running, Pausing)
            | (Running, Stopping)
            | (Pausing, Paused)
            | (Pausing, Running)
            | (Pausing, Stopping)
            | (Paused, Running)
            | (Paused, Stopping)
            | (Stopping, Stopped)
    )
}

pub struct Flusher {
    store: Weak<CacheStore>,
    state: Mutex<FlusherState>,
    cond: Condvar,
    interval: Duration,
}

impl Flusher {
    pub(crate) fn new(store: Weak<CacheStore>, interval: Duration) -> Self {
        Self {
            store,
            state: Mutex::new(FlusherState::Initializing),
            cond: Condvar::new(),
            interval,
        }
    }

    pub fn state(&self) -> FlusherState {
        *self.state.lock()
    }

    fn transition(&self, to: FlusherState) -> bool {
        let mut state = self.state.lock();
        if !valid_transition(*state, to) {
            warn!(from = %*state, to = %to, "invalid flusher transition ignored");
            return false;
        }
        debug!(from = %*state, to = %to, "flusher transitioning");
        *state = to;
        self.cond.notify_all();
        true
    }

    /// Ask the flusher to pause after its current pass.
    pub fn pause(&self) -> bool {
        self.transition(FlusherState::Pausing)
    }

    /// Resume a paused (or pausing) flusher.
    pub fn resume(&self) -> bool {
        self.transition(FlusherState::Running)
    }

    /// Ask the flusher to drain and stop. Returns false when it was
    /// already stopping or stopped.
    pub fn stop(&self) -> bool {
        self.transition(FlusherState::Stopping)
    }

    /// Block until the flusher reaches `want`, or the timeout passes.
    pub fn wait_for_state(&self, want: FlusherState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while *state != want {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return *state == want;
            }
        }
        true
    }

    /// One activation of the flusher task.
    pub(crate) fn step(&self) -> JobOutcome {
        match self.state() {
            FlusherState::Initializing => {
                info!("flusher starting");
                self.transition(FlusherState::Running);
                JobOutcome::Reschedule(Duration::ZERO)
            }
            FlusherState::Pausing => {
                self.transition(FlusherState::Paused);
                JobOutcome::Reschedule(self.interval)
            }
            FlusherState::Paused => JobOutcome::Reschedule(self.interval),
            FlusherState::Running => {
                let Some(store) = self.store.upgrade() else {
                    return JobOutcome::Done;
                };
                match store.do_flush(false) {
                    Some(delay) => JobOutcome::Reschedule(delay.min(self.interval)),
                    None => JobOutcome::Reschedule(self.interval),
                }
            }
            FlusherState::Stopping => {
                if let Some(store) = self.store.upgrade() {
                    store.flush_remaining();
                }
                info!("flusher stopped");
                self.transition(FlusherState::Stopped);
                JobOutcome::Done
            }
            FlusherState::Stopped => JobOutcome::Done,
        }
    }
}
