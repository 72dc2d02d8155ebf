// src/config/mod.rs

//! Run configuration: mode selection, execution limits, retry defaults,
//! logging level, and per-node config/input values.

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{load_and_validate, load_from_path, parse_run_config};
pub use model::{
    ExecutionConfig, LoggingSection, NodeRunConfig, RawExecutionSection, RawRetrySection,
    RawRunConfig, RunConfig,
};
