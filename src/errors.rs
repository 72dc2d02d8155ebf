// src/errors.rs

//! Crate-wide error types.
//!
//! Definition and compile errors are fatal before any step runs. Failures of
//! individual steps are *not* Rust errors: they are recorded as data in the
//! ledger (see [`crate::scheduler::FailureKind`]).

use thiserror::Error;

/// Malformed graph detected while constructing definitions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("duplicate {kind} name '{name}' in {scope}")]
    DuplicateName {
        kind: &'static str,
        name: String,
        scope: String,
    },

    #[error("{scope}: dependency references unknown node '{node}'")]
    UnknownNode { scope: String, node: String },

    #[error("{scope}: node '{node}' has no {kind} named '{port}'")]
    UnknownPort {
        scope: String,
        node: String,
        kind: &'static str,
        port: String,
    },

    #[error("{scope}: node '{node}' depends on itself")]
    SelfLoop { scope: String, node: String },

    #[error("{scope}: collect input '{node}.{input}' must have exactly one upstream output (got {count})")]
    InvalidCollect {
        scope: String,
        node: String,
        input: String,
        count: usize,
    },

    #[error("{scope}: input '{node}.{input}' fans in dynamic output '{upstream}' without collecting it")]
    DynamicInFanIn {
        scope: String,
        node: String,
        input: String,
        upstream: String,
    },

    #[error("composite '{composite}': {message}")]
    InvalidMapping { composite: String, message: String },

    #[error("node '{node}' has no compute function")]
    MissingCompute { node: String },
}

/// Failure to turn a graph plus run configuration into an execution plan.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("type mismatch: output {producer} is not compatible with input {consumer}")]
    TypeMismatch { producer: String, consumer: String },

    #[error("dependency cycle detected involving: {}", cycle.join(" -> "))]
    DependencyCycle { cycle: Vec<String> },

    #[error("missing resources required by the plan: {}", missing.join(", "))]
    MissingResources { missing: Vec<String> },

    #[error("unknown mode '{0}'")]
    UnknownMode(String),

    #[error("input '{input}' of node '{handle}' must get a value from a dependency, a default, or the run config")]
    UnsatisfiedInput { handle: String, input: String },

    #[error("run config references unknown node '{0}'")]
    UnknownNodeConfig(String),

    #[error("invalid config for node '{handle}': {message}")]
    InvalidNodeConfig { handle: String, message: String },

    #[error("invalid dynamic dependency at '{handle}': {message}")]
    InvalidDynamic { handle: String, message: String },

    #[error("cannot build subset plan from unknown steps: {}", keys.join(", "))]
    StepNotFound { keys: Vec<String> },

    #[error("step '{step}' needs '{upstream}', which is neither selected nor known from an earlier run")]
    MissingKnownState { step: String, upstream: String },
}

#[derive(Error, Debug)]
pub enum PipedagError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] crate::ledger::LedgerError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, PipedagError>;
