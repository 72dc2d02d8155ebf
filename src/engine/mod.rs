// src/engine/mod.rs

//! Run engine.
//!
//! This module ties together:
//! - the scheduler's [`ActiveExecution`](crate::scheduler::ActiveExecution)
//! - the event ledger every transition is recorded to
//! - the executor backend that runs compute
//! - the resource manager's init and teardown lifecycle
//! - cancellation and its grace period
//!
//! The pure core state machine lives in [`core`]; the async/IO shell is
//! implemented in [`runtime`].

use crate::plan::StepKey;
use crate::scheduler::StepOutcome;

/// Events flowing into the runtime from the executor, timers, and the
/// caller's cancellation token.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    /// Inputs and resources are ready; compute is about to run.
    StepRunning { step: StepKey, attempt: u32 },
    /// An attempt finished.
    StepCompleted {
        step: StepKey,
        attempt: u32,
        outcome: StepOutcome,
    },
    /// First failure of a resource factory, observed by `step`.
    ResourceInitFailed {
        step: StepKey,
        attempt: u32,
        resource: String,
        message: String,
    },
    /// The backoff before the next attempt of `step` elapsed.
    RetryReady { step: StepKey },
    /// The caller asked the run to stop.
    CancelRequested,
    /// Steps still running after a cancel are out of time.
    GraceExpired,
}

pub mod core;
pub mod event_handlers;
pub mod runtime;

pub use core::CoreRuntime;
pub use event_handlers::{CoreCommand, CoreStep};
pub use runtime::Runtime;
