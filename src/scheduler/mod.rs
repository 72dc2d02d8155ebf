// src/scheduler/mod.rs

//! Step scheduling: per-step state, retry policy, and the pure run-time
//! state machine that decides what runs next.

mod active;
pub mod retry;
pub mod state;
mod transition;

pub use active::{ActiveExecution, SchedulerSettings};
pub use retry::{Backoff, RetryPolicy};
pub use state::{FailureKind, SkipReason, StepFailure, StepRecord, StepState};
pub use transition::{
    InputValue, ProducedOutput, ResolvedInput, SchedulerStep, StepDispatch, StepOutcome,
    Transition,
};
