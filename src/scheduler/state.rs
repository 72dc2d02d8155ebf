// src/scheduler/state.rs

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of one step.
///
/// `Queued -> Starting -> Running -> {Success, Failure, Skipped}`, with
/// `Failure -> Retrying -> Queued` while retry budget remains. Dynamic
/// placeholders sit in `Unresolved` until their producer finishes and then
/// become `Expanded` (or `Skipped`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Unresolved,
    Queued,
    Starting,
    Running,
    Retrying,
    Success,
    Failure,
    Skipped,
    Expanded,
}

impl StepState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepState::Success | StepState::Failure | StepState::Skipped | StepState::Expanded
        )
    }

    pub fn is_in_flight(self) -> bool {
        matches!(self, StepState::Starting | StepState::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Compute returned a failure.
    User,
    ResourceInit,
    Canceled,
    Io,
    InvalidOutput,
    /// Collect barrier saw failed instances under strict collection.
    UpstreamFailed,
}

impl FailureKind {
    pub fn retryable_by_default(self) -> bool {
        matches!(self, FailureKind::User | FailureKind::Io)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    UpstreamFailure,
    OptionalBranch,
    Canceled,
    /// Left out of a subset run and not known from an earlier one.
    NotSelected,
}

/// Typed failure of one step attempt. Recorded as data, never raised past
/// the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind:?} failure: {message}")]
pub struct StepFailure {
    pub kind: FailureKind,
    pub message: String,
    pub retryable: bool,
}

impl StepFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.retryable_by_default(),
        }
    }

    /// Retryable user failure.
    pub fn user(message: impl Into<String>) -> Self {
        Self::new(FailureKind::User, message)
    }

    /// User failure that must not consume retry budget.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::user(message).non_retryable()
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Canceled, message)
    }

    pub fn non_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }
}

impl From<anyhow::Error> for StepFailure {
    fn from(err: anyhow::Error) -> Self {
        StepFailure::user(format!("{err:#}"))
    }
}

/// Scheduler bookkeeping for a single step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    pub state: StepState,
    /// Current (or last) attempt, starting at 1 once queued.
    pub attempt: u32,
    pub skip_reason: Option<SkipReason>,
    pub failure: Option<StepFailure>,
}

impl StepRecord {
    pub(crate) fn new(state: StepState) -> Self {
        Self {
            state,
            attempt: if state == StepState::Queued { 1 } else { 0 },
            skip_reason: None,
            failure: None,
        }
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepState::Unresolved => "UNRESOLVED",
            StepState::Queued => "QUEUED",
            StepState::Starting => "STARTING",
            StepState::Running => "RUNNING",
            StepState::Retrying => "RETRYING",
            StepState::Success => "SUCCESS",
            StepState::Failure => "FAILURE",
            StepState::Skipped => "SKIPPED",
            StepState::Expanded => "EXPANDED",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_retryability_follows_kind() {
        assert!(StepFailure::user("boom").retryable);
        assert!(!StepFailure::fatal("boom").retryable);
        assert!(!StepFailure::new(FailureKind::ResourceInit, "db").retryable);
        assert!(!StepFailure::canceled("stop").retryable);
        assert!(StepFailure::new(FailureKind::Io, "disk").retryable);
    }

    #[test]
    fn terminal_states() {
        assert!(StepState::Expanded.is_terminal());
        assert!(StepState::Skipped.is_terminal());
        assert!(!StepState::Retrying.is_terminal());
        assert!(StepState::Running.is_in_flight());
    }
}
