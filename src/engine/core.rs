// src/engine/core.rs

//! Pure core runtime state machine.
//!
//! This module contains a synchronous, deterministic "core runtime" that
//! consumes [`RuntimeEvent`]s and produces:
//! - an updated core state
//! - a list of "commands" describing what the IO shell should do next
//!
//! The async/IO-heavy shell (`engine::runtime::Runtime`) is responsible for:
//! - reading events from channels
//! - writing ledger events
//! - sending dispatched steps to the executor
//! - timers for retries and the cancel grace period
//!
//! The core is intended to be extensively unit tested without any Tokio,
//! channels, or executors.

use std::time::Duration;

use tracing::info;

use crate::engine::RuntimeEvent;
use crate::engine::event_handlers::{
    CoreCommand, CoreStep, apply_transitions, failure_reason, handle_cancel_request,
    handle_grace_expired, handle_resource_init_failure, handle_retry_ready,
    handle_step_completion, handle_step_running,
};
use crate::ledger::{EventKind, RunStatus};
use crate::scheduler::ActiveExecution;

/// Pure core runtime state.
///
/// It has **no** channels, no Tokio types, and does not perform any IO.
#[derive(Debug)]
pub struct CoreRuntime {
    execution: ActiveExecution,
    grace_period: Duration,
    finished: bool,
}

impl CoreRuntime {
    pub fn new(execution: ActiveExecution, grace_period: Duration) -> Self {
        Self {
            execution,
            grace_period,
            finished: false,
        }
    }

    pub fn execution(&self) -> &ActiveExecution {
        &self.execution
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Record `RUN_STARTED` and dispatch the initial wave of steps.
    pub fn start(&mut self) -> CoreStep {
        let mut commands = vec![CoreCommand::Record {
            step: None,
            attempt: 0,
            kind: EventKind::RunStarted,
        }];
        let transitions = self.execution.start();
        apply_transitions(&self.execution, transitions, &mut commands);
        self.finish_if_done(CoreStep::running(commands))
    }

    /// Handle a single runtime event, updating core state and returning the
    /// resulting commands for the IO shell.
    pub fn step(&mut self, event: RuntimeEvent) -> CoreStep {
        if self.finished {
            return CoreStep {
                commands: Vec::new(),
                keep_running: false,
            };
        }

        let step = match event {
            RuntimeEvent::StepRunning { step, attempt } => {
                handle_step_running(&mut self.execution, step, attempt)
            }
            RuntimeEvent::StepCompleted {
                step,
                attempt,
                outcome,
            } => handle_step_completion(&mut self.execution, step, attempt, outcome),
            RuntimeEvent::ResourceInitFailed {
                step,
                attempt,
                resource,
                message,
            } => handle_resource_init_failure(step, attempt, resource, message),
            RuntimeEvent::RetryReady { step } => handle_retry_ready(&mut self.execution, step),
            RuntimeEvent::CancelRequested => {
                info!("cancel requested; skipping pending steps");
                handle_cancel_request(&mut self.execution, self.grace_period)
            }
            RuntimeEvent::GraceExpired => handle_grace_expired(&mut self.execution),
        };
        self.finish_if_done(step)
    }

    fn finish_if_done(&mut self, mut step: CoreStep) -> CoreStep {
        if self.finished || !self.execution.is_finished() {
            return step;
        }
        self.finished = true;

        let status = self.execution.run_status();
        let reason = match status {
            RunStatus::Failure => Some(failure_reason(&self.execution)),
            _ => None,
        };
        info!(?status, "all steps terminal; finishing run");
        step.commands.push(CoreCommand::Finish { status, reason });
        step.keep_running = false;
        step
    }
}
