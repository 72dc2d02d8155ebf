// src/scheduler/transition.rs

//! Values passed in and out of [`ActiveExecution`](super::ActiveExecution).

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;

use crate::io::OutputHandle;
use crate::plan::{ExecutionStep, StepKey};
use crate::scheduler::{SkipReason, StepFailure};

/// What one output of a finished step produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProducedOutput {
    Single(OutputHandle),
    /// Items of a dynamic output, in yield order. May be empty.
    Dynamic(Vec<(String, OutputHandle)>),
}

impl ProducedOutput {
    pub fn item(&self, mapping_key: &str) -> Option<&OutputHandle> {
        match self {
            ProducedOutput::Single(_) => None,
            ProducedOutput::Dynamic(items) => items
                .iter()
                .find(|(key, _)| key == mapping_key)
                .map(|(_, handle)| handle),
        }
    }

    pub fn handles(&self) -> Vec<OutputHandle> {
        match self {
            ProducedOutput::Single(handle) => vec![handle.clone()],
            ProducedOutput::Dynamic(items) => items.iter().map(|(_, h)| h.clone()).collect(),
        }
    }
}

/// Result of one attempt, as reported by the executor.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Success(BTreeMap<String, ProducedOutput>),
    Failure(StepFailure),
}

/// Where the value of a dispatched input comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum InputValue {
    Single(OutputHandle),
    /// Fan-in or collect: loaded and passed as a list, in this order.
    Many(Vec<OutputHandle>),
    Literal(Value),
    /// Ordering-only; nothing is passed to compute.
    Unit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedInput {
    pub name: String,
    pub type_name: String,
    pub value: InputValue,
}

/// A step the executor should start now.
#[derive(Debug, Clone)]
pub struct StepDispatch {
    pub step: ExecutionStep,
    pub attempt: u32,
    pub inputs: Vec<ResolvedInput>,
}

impl StepDispatch {
    pub fn key(&self) -> &StepKey {
        &self.step.key
    }
}

/// One observable state change. Every transition maps to exactly one
/// ledger event.
#[derive(Debug, Clone)]
pub enum Transition {
    Queued {
        step: StepKey,
        attempt: u32,
    },
    Starting(StepDispatch),
    Running {
        step: StepKey,
        attempt: u32,
    },
    Output {
        step: StepKey,
        attempt: u32,
        output: String,
        mapping_key: Option<String>,
        handle: OutputHandle,
    },
    Succeeded {
        step: StepKey,
        attempt: u32,
    },
    /// `terminal` is false when a retry follows.
    Failed {
        step: StepKey,
        attempt: u32,
        failure: StepFailure,
        terminal: bool,
    },
    Retrying {
        step: StepKey,
        attempt: u32,
        delay: Duration,
    },
    Skipped {
        step: StepKey,
        reason: SkipReason,
    },
    /// A placeholder was replaced by `steps`, one per mapping key.
    Materialized {
        placeholder: StepKey,
        producer: StepKey,
        output: String,
        mapping_keys: Vec<String>,
        steps: Vec<StepKey>,
    },
}

impl Transition {
    pub fn step_key(&self) -> &StepKey {
        match self {
            Transition::Starting(dispatch) => dispatch.key(),
            Transition::Materialized { placeholder, .. } => placeholder,
            Transition::Queued { step, .. }
            | Transition::Running { step, .. }
            | Transition::Output { step, .. }
            | Transition::Succeeded { step, .. }
            | Transition::Failed { step, .. }
            | Transition::Retrying { step, .. }
            | Transition::Skipped { step, .. } => step,
        }
    }

    /// Whether the step reached a state it will never leave.
    pub fn is_terminal(&self) -> bool {
        match self {
            Transition::Succeeded { .. }
            | Transition::Skipped { .. }
            | Transition::Materialized { .. } => true,
            Transition::Failed { terminal, .. } => *terminal,
            _ => false,
        }
    }
}

/// Structured result of a single scheduler step.
#[derive(Debug, Clone, Default)]
pub struct SchedulerStep {
    pub transitions: Vec<Transition>,
}

impl SchedulerStep {
    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }

    /// Dispatches produced by this step, in order.
    pub fn dispatched(&self) -> Vec<&StepDispatch> {
        self.transitions
            .iter()
            .filter_map(|t| match t {
                Transition::Starting(dispatch) => Some(dispatch),
                _ => None,
            })
            .collect()
    }
}
