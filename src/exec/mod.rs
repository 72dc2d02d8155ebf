// src/exec/mod.rs

//! Step execution layer.
//!
//! This module is responsible for actually running node compute for
//! dispatched steps and reporting back to the engine via `RuntimeEvent`s.
//!
//! - [`compute`] defines what user logic receives and returns.
//! - [`executor`] owns the in-process executor which manages step tasks.
//! - [`step_runner`] handles a single attempt: resources, inputs, compute,
//!   output validation and storage.
//! - [`outputs`] checks yielded values against declared outputs.
//! - [`backend`] provides the `ExecutorBackend` trait the runtime uses,
//!   which tests can replace with a fake implementation.

pub mod backend;
pub mod compute;
pub mod executor;
pub mod outputs;
mod step_runner;

pub use backend::ExecutorBackend;
pub use compute::{
    Compute, ComputeContext, ComputeFn, ComputeFuture, ComputeOutput, YieldedValue, compute_fn,
};
pub use executor::InProcessExecutor;
pub use outputs::is_valid_mapping_key;
