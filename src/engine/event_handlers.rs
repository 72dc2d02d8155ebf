// src/engine/event_handlers.rs

//! Event handling logic for the core runtime.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::ledger::{EventKind, RunStatus};
use crate::plan::StepKey;
use crate::scheduler::{
    ActiveExecution, SchedulerStep, StepDispatch, StepOutcome, StepState, Transition,
};

/// Command produced by the pure core, to be executed by the outer IO shell.
#[derive(Debug, Clone)]
pub enum CoreCommand {
    /// Append an event to the run's ledger.
    Record {
        step: Option<StepKey>,
        attempt: u32,
        kind: EventKind,
    },
    /// Hand a ready step to the executor.
    Dispatch(StepDispatch),
    /// Send `RetryReady` for `step` after `delay`.
    ScheduleRetry { step: StepKey, delay: Duration },
    /// Ask running steps to stop cooperatively.
    CancelSteps(Vec<StepKey>),
    /// Send `GraceExpired` after the given period.
    StartGracePeriod(Duration),
    /// Stop running steps without waiting for them.
    AbortSteps(Vec<StepKey>),
    /// Steps materialized at run time declare these resources.
    RegisterResourceUsers(BTreeMap<String, usize>),
    /// `step` is terminal and no longer needs `keys`.
    ReleaseResources { step: StepKey, keys: Vec<String> },
    /// Tear down, record the terminal run event and stop.
    Finish {
        status: RunStatus,
        reason: Option<String>,
    },
}

/// Decision returned by the core after handling a single `RuntimeEvent`.
#[derive(Debug, Clone)]
pub struct CoreStep {
    /// Commands the IO shell should execute, in order.
    pub commands: Vec<CoreCommand>,
    /// Whether the outer runtime loop should keep running.
    pub keep_running: bool,
}

impl CoreStep {
    pub(crate) fn running(commands: Vec<CoreCommand>) -> Self {
        Self {
            commands,
            keep_running: true,
        }
    }
}

/// Translate scheduler transitions into ledger records and side effects.
pub fn apply_transitions(
    execution: &ActiveExecution,
    step: SchedulerStep,
    commands: &mut Vec<CoreCommand>,
) {
    for transition in step.transitions {
        let terminal = transition.is_terminal();
        let key = transition.step_key().clone();

        match transition {
            Transition::Queued { step, attempt } => {
                commands.push(record(step, attempt, EventKind::StepQueued));
            }
            Transition::Starting(dispatch) => {
                commands.push(record(
                    dispatch.step.key.clone(),
                    dispatch.attempt,
                    EventKind::StepStarting,
                ));
                commands.push(CoreCommand::Dispatch(dispatch));
            }
            Transition::Running { step, attempt } => {
                commands.push(record(step, attempt, EventKind::StepRunning));
            }
            Transition::Output {
                step,
                attempt,
                output,
                mapping_key,
                handle,
            } => {
                commands.push(record(
                    step,
                    attempt,
                    EventKind::StepOutput {
                        output,
                        mapping_key,
                        handle,
                    },
                ));
            }
            Transition::Succeeded { step, attempt } => {
                commands.push(record(step, attempt, EventKind::StepSuccess));
            }
            Transition::Failed {
                step,
                attempt,
                failure,
                ..
            } => {
                commands.push(record(
                    step,
                    attempt,
                    EventKind::StepFailure {
                        kind: failure.kind,
                        message: failure.message,
                    },
                ));
            }
            Transition::Retrying {
                step,
                attempt,
                delay,
            } => {
                commands.push(record(
                    step.clone(),
                    attempt,
                    EventKind::StepRetrying {
                        delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    },
                ));
                commands.push(CoreCommand::ScheduleRetry { step, delay });
            }
            Transition::Skipped { step, reason } => {
                let attempt = execution.record(&step).map(|r| r.attempt).unwrap_or(0);
                commands.push(record(step, attempt, EventKind::StepSkipped { reason }));
            }
            Transition::Materialized {
                placeholder,
                producer,
                output,
                mapping_keys,
                steps,
            } => {
                let users = resource_users(execution, &steps);
                commands.push(record(
                    placeholder,
                    0,
                    EventKind::StepsMaterialized {
                        producer,
                        output,
                        mapping_keys,
                        steps,
                    },
                ));
                if !users.is_empty() {
                    commands.push(CoreCommand::RegisterResourceUsers(users));
                }
            }
        }

        if terminal {
            release(execution, key, commands);
        }
    }
}

/// A running step reported that compute has started.
pub fn handle_step_running(execution: &mut ActiveExecution, step: StepKey, attempt: u32) -> CoreStep {
    let mut commands = Vec::new();
    let transitions = execution.step_running(&step, attempt);
    apply_transitions(execution, transitions, &mut commands);
    CoreStep::running(commands)
}

/// Handle the outcome of one attempt.
pub fn handle_step_completion(
    execution: &mut ActiveExecution,
    step: StepKey,
    attempt: u32,
    outcome: StepOutcome,
) -> CoreStep {
    let mut commands = Vec::new();
    let transitions = execution.complete(&step, attempt, outcome);
    apply_transitions(execution, transitions, &mut commands);
    CoreStep::running(commands)
}

pub fn handle_resource_init_failure(
    step: StepKey,
    attempt: u32,
    resource: String,
    message: String,
) -> CoreStep {
    CoreStep::running(vec![record(
        step,
        attempt,
        EventKind::ResourceInitFailure { resource, message },
    )])
}

pub fn handle_retry_ready(execution: &mut ActiveExecution, step: StepKey) -> CoreStep {
    let mut commands = Vec::new();
    let transitions = execution.retry_ready(&step);
    apply_transitions(execution, transitions, &mut commands);
    CoreStep::running(commands)
}

/// Stop dispatching, skip pending work, and give running steps
/// `grace_period` to stop on their own.
pub fn handle_cancel_request(execution: &mut ActiveExecution, grace_period: Duration) -> CoreStep {
    if execution.is_cancel_requested() {
        return CoreStep::running(Vec::new());
    }

    let mut commands = vec![CoreCommand::Record {
        step: None,
        attempt: 0,
        kind: EventKind::RunCanceling,
    }];
    let transitions = execution.request_cancel();
    apply_transitions(execution, transitions, &mut commands);

    let in_flight = execution.in_flight_keys();
    if !in_flight.is_empty() {
        commands.push(CoreCommand::CancelSteps(in_flight));
        commands.push(CoreCommand::StartGracePeriod(grace_period));
    }
    CoreStep::running(commands)
}

/// Abort whatever is still running after the grace period.
pub fn handle_grace_expired(execution: &mut ActiveExecution) -> CoreStep {
    let in_flight = execution.in_flight_keys();
    if in_flight.is_empty() {
        return CoreStep::running(Vec::new());
    }

    let mut commands = vec![CoreCommand::AbortSteps(in_flight)];
    let transitions = execution.abort_in_flight();
    apply_transitions(execution, transitions, &mut commands);
    CoreStep::running(commands)
}

/// Human-readable reason for a failed run.
pub(crate) fn failure_reason(execution: &ActiveExecution) -> String {
    let failed: Vec<String> = execution
        .step_keys()
        .iter()
        .filter(|key| execution.state(key) == Some(StepState::Failure))
        .map(ToString::to_string)
        .collect();
    if failed.is_empty() {
        "run did not complete successfully".to_string()
    } else {
        format!("steps failed: {}", failed.join(", "))
    }
}

fn record(step: StepKey, attempt: u32, kind: EventKind) -> CoreCommand {
    CoreCommand::Record {
        step: Some(step),
        attempt,
        kind,
    }
}

fn release(execution: &ActiveExecution, step: StepKey, commands: &mut Vec<CoreCommand>) {
    let Some(keys) = execution
        .step(&step)
        .map(|s| s.required_resource_keys.iter().cloned().collect::<Vec<_>>())
    else {
        return;
    };
    if !keys.is_empty() {
        commands.push(CoreCommand::ReleaseResources { step, keys });
    }
}

fn resource_users(execution: &ActiveExecution, steps: &[StepKey]) -> BTreeMap<String, usize> {
    let mut users = BTreeMap::new();
    for key in steps.iter().filter(|k| !execution.is_reused(k)) {
        if let Some(step) = execution.step(key) {
            for resource in &step.required_resource_keys {
                *users.entry(resource.clone()).or_insert(0) += 1;
            }
        }
    }
    users
}
