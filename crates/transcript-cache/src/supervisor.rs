//! Single-flight supervisor for reconciliation runs.
//!
//! Collapses overlapping requests for the same key into at most one
//! follow-up run. Transition table (`k` is the running key):
//!
//! | state              | event                   | next state         | result         |
//! |--------------------|-------------------------|--------------------|----------------|
//! | Idle               | request(x)              | Running(x)         | `Start`        |
//! | Running(k)         | request(k)              | RunningWithPending | `Coalesced`    |
//! | RunningWithPending | request(k)              | RunningWithPending | `Coalesced`    |
//! | Running / Pending  | request(x != k)         | Running(x)         | `Start`        |
//! | Running(k)         | finish                  | Idle               | `Idle`         |
//! | RunningWithPending | finish, still current   | Running(k)         | `RunAgain`     |
//! | RunningWithPending | finish, not current     | Idle               | `Idle`         |
//! | any                | finish with stale token | unchanged          | `Stale`        |
//! | Running / Pending  | abandon (owning token)  | Idle               | `true`         |
//! | any                | reset                   | Idle               |                |
//!
//! Entering `Idle` (or being reset) completes a cycle and wakes every
//! coalesced waiter.

use tokio::sync::watch;

use crate::epoch::Epoch;

/// Supervisor state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Running,
    RunningWithPending,
}

/// Proof that the holder owns the current run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunToken {
    generation: Epoch,
}

/// Answer to a run request
#[derive(Debug)]
pub enum Admission {
    /// Caller should run now and report back through [`TaskSupervisor::finish`]
    Start(RunToken),
    /// A run is already going; wait for its cycle to end instead
    Coalesced(CycleWaiter),
}

/// Answer to a finished run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The cycle is over
    Idle,
    /// A request arrived during the run; run exactly once more
    RunAgain(RunToken),
    /// The token no longer owns the supervisor (reset or superseded)
    Stale,
}

/// Resolves when the cycle it was created in ends
#[derive(Debug)]
pub struct CycleWaiter {
    rx: watch::Receiver<u64>,
    seen: u64,
}

impl CycleWaiter {
    pub async fn wait(mut self) {
        let seen = self.seen;
        // The supervisor owns the sender; if it is gone there is nothing to wait for.
        let _ = self.rx.wait_for(|cycles| *cycles > seen).await;
    }
}

/// Idle / Running / Running-with-pending state machine keyed by `K`
#[derive(Debug)]
pub struct TaskSupervisor<K> {
    state: SupervisorState,
    key: Option<K>,
    generation: Epoch,
    cycles: watch::Sender<u64>,
}

impl<K: PartialEq + Clone> Default for TaskSupervisor<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: PartialEq + Clone> TaskSupervisor<K> {
    pub fn new() -> Self {
        let (cycles, _) = watch::channel(0);
        Self {
            state: SupervisorState::Idle,
            key: None,
            generation: Epoch::ZERO,
            cycles,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Key of the running cycle, if any
    pub fn key(&self) -> Option<&K> {
        self.key.as_ref()
    }

    /// Ask to run for `key`
    pub fn request(&mut self, key: &K) -> Admission {
        match self.state {
            SupervisorState::Idle => self.start(key),
            _ if self.key.as_ref() == Some(key) => {
                self.state = SupervisorState::RunningWithPending;
                Admission::Coalesced(self.waiter())
            }
            _ => {
                // The old key's run is abandoned; release its waiters first.
                self.end_cycle();
                self.start(key)
            }
        }
    }

    /// Report that the run owning `token` finished.
    ///
    /// `still_current` says whether the key is still worth running for.
    pub fn finish(&mut self, token: RunToken, still_current: bool) -> Completion {
        if token.generation != self.generation {
            return Completion::Stale;
        }
        match self.state {
            SupervisorState::Idle => Completion::Stale,
            SupervisorState::RunningWithPending if still_current => {
                self.state = SupervisorState::Running;
                Completion::RunAgain(token)
            }
            SupervisorState::Running | SupervisorState::RunningWithPending => {
                self.end_cycle();
                Completion::Idle
            }
        }
    }

    /// End the cycle owned by `token` without a follow-up run.
    ///
    /// For a run whose task went away before it could call [`finish`](Self::finish).
    /// Returns whether anything was abandoned.
    pub fn abandon(&mut self, token: RunToken) -> bool {
        if token.generation != self.generation || self.state == SupervisorState::Idle {
            return false;
        }
        self.end_cycle();
        true
    }

    /// Forget any running cycle; outstanding tokens become stale
    pub fn reset(&mut self) {
        self.generation.bump();
        if self.state != SupervisorState::Idle {
            self.end_cycle();
        }
    }

    fn start(&mut self, key: &K) -> Admission {
        let generation = self.generation.bump();
        self.state = SupervisorState::Running;
        self.key = Some(key.clone());
        Admission::Start(RunToken { generation })
    }

    fn end_cycle(&mut self) {
        self.state = SupervisorState::Idle;
        self.key = None;
        self.cycles.send_modify(|cycles| *cycles += 1);
    }

    fn waiter(&self) -> CycleWaiter {
        CycleWaiter {
            rx: self.cycles.subscribe(),
            seen: *self.cycles.borrow(),
        }
    }
}
