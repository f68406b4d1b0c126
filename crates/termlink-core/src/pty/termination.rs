//! Two-phase shutdown state machine.
//!
//! A session is asked to stop politely first (SIGTERM), then forced after a
//! grace period (SIGKILL). The timing decisions live here as a pure state
//! machine driven by caller-supplied instants; the session wires it to real
//! signals and the exit watcher.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationPhase {
    /// Process alive, no shutdown requested.
    Running,
    /// Graceful signal sent; force kill due at the deadline.
    Terminating { deadline: Instant },
    /// Process exited on its own or within the grace period.
    Exited,
    /// Grace period elapsed; process was force killed.
    Killed,
}

#[derive(Debug)]
pub struct Termination {
    phase: TerminationPhase,
    grace: Duration,
}

impl Termination {
    pub const DEFAULT_GRACE: Duration = Duration::from_secs(2);

    pub fn new(grace: Duration) -> Self {
        Self {
            phase: TerminationPhase::Running,
            grace,
        }
    }

    pub fn phase(&self) -> TerminationPhase {
        self.phase
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.phase,
            TerminationPhase::Exited | TerminationPhase::Killed
        )
    }

    /// Request shutdown. Returns true when this call started the graceful
    /// phase; false when shutdown was already in progress or finished, so
    /// a second terminate request never re-signals the process.
    pub fn begin(&mut self, now: Instant) -> bool {
        match self.phase {
            TerminationPhase::Running => {
                self.phase = TerminationPhase::Terminating {
                    deadline: now + self.grace,
                };
                true
            }
            _ => false,
        }
    }

    /// The process exited. Valid in any phase; an exit that races the
    /// force-kill decision still counts as a clean exit.
    pub fn on_exit(&mut self) {
        if self.phase != TerminationPhase::Killed {
            self.phase = TerminationPhase::Exited;
        }
    }

    /// Whether the grace period has elapsed without an exit.
    pub fn should_force_kill(&self, now: Instant) -> bool {
        matches!(self.phase, TerminationPhase::Terminating { deadline } if now >= deadline)
    }

    pub fn mark_killed(&mut self) {
        self.phase = TerminationPhase::Killed;
    }

    /// Deadline of the pending graceful phase, if any.
    pub fn deadline(&self) -> Option<Instant> {
        match self.phase {
            TerminationPhase::Terminating { deadline } => Some(deadline),
            _ => None,
        }
    }
}

impl Default for Termination {
    fn default() -> Self {
        Self::new(Self::DEFAULT_GRACE)
    }
}
