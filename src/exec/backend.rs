// src/exec/backend.rs

//! Pluggable executor backend abstraction.
//!
//! The runtime talks to an `ExecutorBackend` instead of spawning compute
//! itself. This makes it easy to swap in a fake executor in tests while
//! keeping the production executor in [`executor`](super::executor).
//!
//! - [`InProcessExecutor`](super::InProcessExecutor) is the default
//!   implementation. It runs each attempt as a Tokio task in this process.
//! - Tests can provide their own `ExecutorBackend` that, for example, records
//!   which steps were dispatched and directly emits `StepCompleted` events.

use std::future::Future;
use std::pin::Pin;

use crate::errors::Result;
use crate::plan::StepKey;
use crate::scheduler::StepDispatch;

/// Trait abstracting how dispatched steps are executed.
///
/// An implementation must eventually send exactly one
/// `RuntimeEvent::StepCompleted` for every dispatched attempt it does not
/// abort.
pub trait ExecutorBackend: Send {
    /// Start running one attempt of a step.
    fn dispatch(
        &mut self,
        dispatch: StepDispatch,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Ask running steps to stop cooperatively.
    fn cancel_steps(
        &mut self,
        steps: Vec<StepKey>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Stop running steps immediately. No completion is expected afterwards.
    fn abort_steps(
        &mut self,
        steps: Vec<StepKey>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}
