//! The orchestration lifecycle state machine.
//!
//! One `StateMachine` exclusively owns the lifecycle of one in-memory
//! execution: Idle -> Parsing -> Validating -> Executing -> terminal, with
//! Executing <-> Paused and cancel from any non-terminal state. Every
//! transition is validated against a single allowed-transition table.
//!
//! The machine is the unit of serialization for checkpoints: `snapshot()`
//! produces a versioned, pure-data `MachineSnapshot` with no transient
//! handles, and `from_snapshot` reconstructs an equivalent machine.

use chrono::{DateTime, Utc};
use maestro_types::workflow::{
    ExecutionFailure, ExecutionState, MachineSnapshot, SNAPSHOT_VERSION,
};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A lifecycle operation requested against the wrong state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateTransitionError {
    #[error("invalid transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: ExecutionState,
        to: ExecutionState,
    },

    #[error("execution is already terminal in state {state:?}")]
    Terminal { state: ExecutionState },

    #[error("unsupported machine snapshot version {0} (expected {SNAPSHOT_VERSION})")]
    SnapshotVersion(u32),
}

// ---------------------------------------------------------------------------
// StateMachine
// ---------------------------------------------------------------------------

/// Authoritative lifecycle state for one workflow execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateMachine {
    state: ExecutionState,
    error: Option<ExecutionFailure>,
    resume_count: u32,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl StateMachine {
    /// A fresh machine in `Idle`.
    pub fn new() -> Self {
        Self {
            state: ExecutionState::Idle,
            error: None,
            resume_count: 0,
            started_at: None,
            completed_at: None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ExecutionState {
        self.state
    }

    /// The recorded failure, if the machine failed.
    pub fn error(&self) -> Option<&ExecutionFailure> {
        self.error.as_ref()
    }

    /// How many times this execution has been resumed.
    pub fn resume_count(&self) -> u32 {
        self.resume_count
    }

    /// When the execution started, if it has.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// When the execution reached a terminal state, if it has.
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Whether `from -> to` is a legal transition.
    pub fn allowed(from: ExecutionState, to: ExecutionState) -> bool {
        use ExecutionState::*;
        matches!(
            (from, to),
            (Idle, Parsing)
                | (Parsing, Validating)
                | (Parsing, Failed)
                | (Validating, Executing)
                | (Validating, Failed)
                | (Executing, Completed)
                | (Executing, Failed)
                | (Executing, Paused)
                | (Paused, Executing)
        ) || (to == Cancelled && !from.is_terminal())
    }

    fn transition_to(&mut self, to: ExecutionState) -> Result<(), StateTransitionError> {
        if self.state.is_terminal() {
            return Err(StateTransitionError::Terminal { state: self.state });
        }
        if !Self::allowed(self.state, to) {
            return Err(StateTransitionError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        if to.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Idle -> Parsing. Stamps the start time.
    pub fn start_parsing(&mut self) -> Result<(), StateTransitionError> {
        self.transition_to(ExecutionState::Parsing)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Parsing -> Validating.
    pub fn finish_parsing(&mut self) -> Result<(), StateTransitionError> {
        self.transition_to(ExecutionState::Validating)
    }

    /// Validating -> Executing.
    pub fn finish_validation(&mut self) -> Result<(), StateTransitionError> {
        self.transition_to(ExecutionState::Executing)
    }

    /// Executing -> Completed.
    pub fn complete(&mut self) -> Result<(), StateTransitionError> {
        self.transition_to(ExecutionState::Completed)
    }

    /// Parsing | Validating | Executing -> Failed, recording the failure.
    pub fn fail(&mut self, failure: ExecutionFailure) -> Result<(), StateTransitionError> {
        self.transition_to(ExecutionState::Failed)?;
        self.error = Some(failure);
        Ok(())
    }

    /// Executing -> Paused.
    pub fn pause(&mut self) -> Result<(), StateTransitionError> {
        self.transition_to(ExecutionState::Paused)
    }

    /// Resume into `Executing`, incrementing the resume counter.
    ///
    /// Accepted from `Paused` (explicit resume) and from `Executing` itself:
    /// a checkpoint written mid-flight snapshots the machine in `Executing`,
    /// so crash recovery restores an already-executing machine.
    pub fn resume(&mut self) -> Result<(), StateTransitionError> {
        match self.state {
            ExecutionState::Paused => {
                self.transition_to(ExecutionState::Executing)?;
            }
            ExecutionState::Executing => {}
            _ if self.state.is_terminal() => {
                return Err(StateTransitionError::Terminal { state: self.state });
            }
            _ => {
                return Err(StateTransitionError::InvalidTransition {
                    from: self.state,
                    to: ExecutionState::Executing,
                });
            }
        }
        self.resume_count += 1;
        Ok(())
    }

    /// Any non-terminal state -> Cancelled.
    pub fn cancel(&mut self) -> Result<(), StateTransitionError> {
        self.transition_to(ExecutionState::Cancelled)
    }

    // -----------------------------------------------------------------------
    // Serialization
    // -----------------------------------------------------------------------

    /// Pure serialization to a versioned snapshot.
    pub fn snapshot(&self) -> MachineSnapshot {
        MachineSnapshot {
            version: SNAPSHOT_VERSION,
            state: self.state,
            error: self.error.clone(),
            resume_count: self.resume_count,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }

    /// Reconstruct a machine from a snapshot, rejecting unknown versions.
    pub fn from_snapshot(snapshot: MachineSnapshot) -> Result<Self, StateTransitionError> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(StateTransitionError::SnapshotVersion(snapshot.version));
        }
        Ok(Self {
            state: snapshot.state,
            error: snapshot.error,
            resume_count: snapshot.resume_count,
            started_at: snapshot.started_at,
            completed_at: snapshot.completed_at,
        })
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
