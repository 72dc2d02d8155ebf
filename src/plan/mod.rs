// src/plan/mod.rs

//! Plan compiler: flattens composites, type-checks edges, rejects cycles and
//! emits a flat step graph with dynamic placeholders left unexpanded.

pub mod compiler;
pub mod dynamic;
pub mod execution_plan;
mod flatten;
pub mod known_state;
pub mod step;
mod validate;

pub use compiler::compile;
pub use dynamic::materialize;
pub use execution_plan::{ExecutionPlan, OutputSnapshot, PlanSnapshot, StepSnapshot};
pub use known_state::KnownExecutionState;
pub use step::{ExecutionStep, StepInput, StepInputSource, StepKey, StepKind, StepOutputRef};
