// src/scheduler/active.rs

//! Run-time step table and readiness evaluation.
//!
//! [`ActiveExecution`] owns the mutable side of a run: step states, produced
//! output handles, and the steps materialized from dynamic placeholders. It
//! is synchronous and performs no IO; every call returns the
//! [`Transition`]s it caused so the engine can record and act on them.
//!
//! After each input the table is settled to a fixpoint: placeholders whose
//! producer finished are expanded or skipped, queued steps whose upstream
//! can no longer deliver are skipped or failed, and only then are ready
//! steps dispatched up to the concurrency limit.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tracing::{debug, info, warn};

use crate::config::ExecutionConfig;
use crate::graph::NOTHING;
use crate::ledger::RunStatus;
use crate::plan::{
    ExecutionPlan, ExecutionStep, KnownExecutionState, StepInputSource, StepKey, StepKind,
    StepOutputRef, materialize,
};
use crate::scheduler::transition::{
    InputValue, ProducedOutput, ResolvedInput, SchedulerStep, StepDispatch, StepOutcome,
    Transition,
};
use crate::scheduler::{
    FailureKind, RetryPolicy, SkipReason, StepFailure, StepRecord, StepState,
};
use crate::types::CollectStrictness;

/// Scheduling knobs taken from the run config.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    pub max_concurrent: usize,
    pub collect_strictness: CollectStrictness,
    /// Applied to steps whose node has no retry policy.
    pub default_retry: RetryPolicy,
}

impl SchedulerSettings {
    pub fn from_config(cfg: &ExecutionConfig) -> Self {
        Self {
            max_concurrent: cfg.max_concurrent.max(1),
            collect_strictness: cfg.collect_strictness,
            default_retry: cfg.retry.clone(),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from_config(&ExecutionConfig::default())
    }
}

enum Readiness {
    Ready(Vec<ResolvedInput>),
    Waiting,
    Skip(SkipReason),
    Fail(StepFailure),
}

enum InputReadiness {
    Value(InputValue),
    Waiting,
    Skip(SkipReason),
    Fail(StepFailure),
}

/// Mutable per-run scheduling state.
#[derive(Debug)]
pub struct ActiveExecution {
    /// Plan order, followed by materialized steps in creation order.
    order: Vec<StepKey>,
    steps: HashMap<StepKey, ExecutionStep>,
    records: HashMap<StepKey, StepRecord>,
    outputs: HashMap<StepKey, BTreeMap<String, ProducedOutput>>,
    /// Placeholder key -> instance keys, in mapping-key order.
    expansions: HashMap<StepKey, Vec<StepKey>>,
    /// Outputs of earlier runs, for steps this run does not execute.
    known: KnownExecutionState,
    /// Selected placeholder -> mapping keys of the instances to run.
    instance_selection: HashMap<StepKey, BTreeSet<String>>,
    /// Succeeded in an earlier run; never dispatched here.
    reused: HashSet<StepKey>,
    settings: SchedulerSettings,
    in_flight: usize,
    started: bool,
    cancel_requested: bool,
}

impl ActiveExecution {
    pub fn new(plan: &ExecutionPlan, settings: SchedulerSettings) -> Self {
        let mut execution = Self {
            order: Vec::with_capacity(plan.len()),
            steps: HashMap::with_capacity(plan.len()),
            records: HashMap::with_capacity(plan.len()),
            outputs: HashMap::new(),
            expansions: HashMap::new(),
            known: plan.known_state().clone(),
            instance_selection: HashMap::new(),
            reused: HashSet::new(),
            settings,
            in_flight: 0,
            started: false,
            cancel_requested: false,
        };

        for step in plan.steps() {
            if !plan.is_selected(&step.key) {
                execution.seed_unselected(step);
                continue;
            }
            let state = if step.is_unresolved() {
                StepState::Unresolved
            } else {
                StepState::Queued
            };
            if let Some(mapping_keys) = plan.selected_instances(&step.key) {
                execution
                    .instance_selection
                    .insert(step.key.clone(), mapping_keys.clone());
            }
            execution.order.push(step.key.clone());
            execution
                .records
                .insert(step.key.clone(), StepRecord::new(state));
            execution.steps.insert(step.key.clone(), step.clone());
        }
        execution
    }

    /// Make a step this run does not execute visible to its consumers, as
    /// far as the known state allows. Steps with nothing known stay out of
    /// the table.
    fn seed_unselected(&mut self, step: &ExecutionStep) {
        if !step.is_unresolved() {
            if self.known.succeeded(&step.key) {
                self.reuse(step.clone());
            }
            return;
        }

        let Some(mapping_keys) = self.known.mapping_keys(&step.key).map(<[String]>::to_vec) else {
            return;
        };
        let instances = materialize(&[step], &mapping_keys);
        let instance_keys: Vec<StepKey> = instances.iter().map(|s| s.key.clone()).collect();
        for instance in instances {
            if self.known.succeeded(&instance.key) {
                self.reuse(instance);
            } else {
                let mut record = StepRecord::new(StepState::Skipped);
                record.skip_reason = Some(SkipReason::NotSelected);
                self.records.insert(instance.key.clone(), record);
                self.steps.insert(instance.key.clone(), instance);
            }
        }
        self.records
            .insert(step.key.clone(), StepRecord::new(StepState::Expanded));
        self.steps.insert(step.key.clone(), step.clone());
        self.expansions.insert(step.key.clone(), instance_keys);
    }

    fn reuse(&mut self, step: ExecutionStep) {
        let outputs = self.known.outputs_of(&step.key).cloned().unwrap_or_default();
        debug!(step = %step.key, outputs = outputs.len(), "reusing outputs of an earlier run");
        self.outputs.insert(step.key.clone(), outputs);
        self.records
            .insert(step.key.clone(), StepRecord::new(StepState::Success));
        self.reused.insert(step.key.clone());
        self.steps.insert(step.key.clone(), step);
    }

    /// Queue every static step and dispatch whatever is ready.
    pub fn start(&mut self) -> SchedulerStep {
        if self.started {
            return SchedulerStep::default();
        }
        self.started = true;

        let mut out: Vec<Transition> = self
            .order
            .iter()
            .filter(|key| self.state(key) == Some(StepState::Queued))
            .map(|key| Transition::Queued {
                step: key.clone(),
                attempt: 1,
            })
            .collect();
        self.advance(&mut out);
        SchedulerStep { transitions: out }
    }

    /// The executor began running compute for `key`.
    pub fn step_running(&mut self, key: &StepKey, attempt: u32) -> SchedulerStep {
        let Some(record) = self.records.get_mut(key) else {
            return SchedulerStep::default();
        };
        if record.state != StepState::Starting || record.attempt != attempt {
            debug!(step = %key, attempt, state = %record.state, "ignoring stale running report");
            return SchedulerStep::default();
        }
        record.state = StepState::Running;
        SchedulerStep {
            transitions: vec![Transition::Running {
                step: key.clone(),
                attempt,
            }],
        }
    }

    /// Apply the outcome of one attempt. Reports for attempts that are no
    /// longer in flight are ignored.
    pub fn complete(&mut self, key: &StepKey, attempt: u32, outcome: StepOutcome) -> SchedulerStep {
        let policy = self
            .steps
            .get(key)
            .and_then(|s| s.retry_policy.clone())
            .unwrap_or_else(|| self.settings.default_retry.clone());

        let Some(record) = self.records.get_mut(key) else {
            warn!(step = %key, "completion for unknown step; ignoring");
            return SchedulerStep::default();
        };
        if !record.state.is_in_flight() || record.attempt != attempt {
            debug!(step = %key, attempt, state = %record.state, "ignoring stale completion");
            return SchedulerStep::default();
        }
        self.in_flight = self.in_flight.saturating_sub(1);

        let mut out = Vec::new();
        match outcome {
            StepOutcome::Success(produced) => {
                record.state = StepState::Success;
                record.failure = None;
                for (output, value) in &produced {
                    match value {
                        ProducedOutput::Single(handle) => out.push(Transition::Output {
                            step: key.clone(),
                            attempt,
                            output: output.clone(),
                            mapping_key: None,
                            handle: handle.clone(),
                        }),
                        ProducedOutput::Dynamic(items) => {
                            for (mapping_key, handle) in items {
                                out.push(Transition::Output {
                                    step: key.clone(),
                                    attempt,
                                    output: output.clone(),
                                    mapping_key: Some(mapping_key.clone()),
                                    handle: handle.clone(),
                                });
                            }
                        }
                    }
                }
                self.outputs.insert(key.clone(), produced);
                out.push(Transition::Succeeded {
                    step: key.clone(),
                    attempt,
                });
            }
            StepOutcome::Failure(failure) => {
                let retry =
                    failure.retryable && !self.cancel_requested && policy.should_retry(attempt);
                record.failure = Some(failure.clone());
                if retry {
                    record.state = StepState::Retrying;
                    let delay = policy.delay_for(attempt);
                    debug!(step = %key, attempt, ?delay, "step failed; retrying");
                    out.push(Transition::Failed {
                        step: key.clone(),
                        attempt,
                        failure,
                        terminal: false,
                    });
                    out.push(Transition::Retrying {
                        step: key.clone(),
                        attempt,
                        delay,
                    });
                } else {
                    record.state = StepState::Failure;
                    info!(step = %key, attempt, kind = ?failure.kind, "step failed");
                    out.push(Transition::Failed {
                        step: key.clone(),
                        attempt,
                        failure,
                        terminal: true,
                    });
                }
            }
        }

        self.advance(&mut out);
        SchedulerStep { transitions: out }
    }

    /// The backoff of a retrying step elapsed; queue its next attempt.
    pub fn retry_ready(&mut self, key: &StepKey) -> SchedulerStep {
        if self.cancel_requested {
            return SchedulerStep::default();
        }
        let Some(record) = self.records.get_mut(key) else {
            return SchedulerStep::default();
        };
        if record.state != StepState::Retrying {
            return SchedulerStep::default();
        }
        record.state = StepState::Queued;
        record.attempt += 1;

        let mut out = vec![Transition::Queued {
            step: key.clone(),
            attempt: record.attempt,
        }];
        self.advance(&mut out);
        SchedulerStep { transitions: out }
    }

    /// Stop dispatching. Queued and unresolved steps are skipped, retrying
    /// steps fail. In-flight steps are left to finish; see
    /// [`in_flight_keys`](Self::in_flight_keys).
    pub fn request_cancel(&mut self) -> SchedulerStep {
        if self.cancel_requested {
            return SchedulerStep::default();
        }
        self.cancel_requested = true;

        let mut out = Vec::new();
        for key in self.order.clone() {
            match self.state(&key) {
                Some(StepState::Queued | StepState::Unresolved) => {
                    self.skip(&key, SkipReason::Canceled, &mut out);
                }
                Some(StepState::Retrying) => {
                    self.fail(&key, StepFailure::canceled("run canceled before retry"), &mut out);
                }
                _ => {}
            }
        }
        SchedulerStep { transitions: out }
    }

    /// Fail every step still in flight. Used once the cancel grace period
    /// is over; their late completions are then ignored.
    pub fn abort_in_flight(&mut self) -> SchedulerStep {
        let mut out = Vec::new();
        for key in self.in_flight_keys() {
            self.fail(
                &key,
                StepFailure::canceled("aborted after cancel grace period"),
                &mut out,
            );
        }
        self.in_flight = 0;
        SchedulerStep { transitions: out }
    }

    pub fn in_flight_keys(&self) -> Vec<StepKey> {
        self.order
            .iter()
            .filter(|key| self.state(key).is_some_and(StepState::is_in_flight))
            .cloned()
            .collect()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    /// Every step, including materialized ones, is terminal.
    pub fn is_finished(&self) -> bool {
        self.records.values().all(|r| r.state.is_terminal())
    }

    /// Run status implied by the current step states.
    pub fn run_status(&self) -> RunStatus {
        if !self.is_finished() {
            return RunStatus::Started;
        }
        if self.cancel_requested {
            return RunStatus::Canceled;
        }
        if self.records.values().any(|r| r.state == StepState::Failure) {
            return RunStatus::Failure;
        }
        let clean = self.records.values().all(|r| match r.state {
            StepState::Success | StepState::Expanded => true,
            StepState::Skipped => matches!(
                r.skip_reason,
                Some(SkipReason::OptionalBranch | SkipReason::NotSelected)
            ),
            _ => false,
        });
        if clean {
            RunStatus::Success
        } else {
            RunStatus::Failure
        }
    }

    pub fn step(&self, key: &StepKey) -> Option<&ExecutionStep> {
        self.steps.get(key)
    }

    pub fn record(&self, key: &StepKey) -> Option<&StepRecord> {
        self.records.get(key)
    }

    pub fn state(&self, key: &StepKey) -> Option<StepState> {
        self.records.get(key).map(|r| r.state)
    }

    /// Step keys in plan order, then materialized steps.
    pub fn step_keys(&self) -> &[StepKey] {
        &self.order
    }

    pub fn states(&self) -> BTreeMap<StepKey, StepState> {
        self.records
            .iter()
            .map(|(key, record)| (key.clone(), record.state))
            .collect()
    }

    /// Instances created for a placeholder, if it was expanded.
    pub fn instances_of(&self, placeholder: &StepKey) -> Option<&[StepKey]> {
        self.expansions.get(placeholder).map(Vec::as_slice)
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Succeeded in an earlier run and is not executed by this one.
    pub fn is_reused(&self, key: &StepKey) -> bool {
        self.reused.contains(key)
    }

    fn advance(&mut self, out: &mut Vec<Transition>) {
        loop {
            let expanded = self.expand_placeholders(out);
            let settled = self.settle_queued(out);
            if !expanded && !settled {
                break;
            }
        }
        self.dispatch_ready(out);
    }

    fn expand_placeholders(&mut self, out: &mut Vec<Transition>) -> bool {
        let pending: Vec<StepKey> = self
            .order
            .iter()
            .filter(|key| self.state(key) == Some(StepState::Unresolved))
            .cloned()
            .collect();

        let mut changed = false;
        for key in pending {
            let Some(StepKind::Unresolved { resolved_by }) = self.steps.get(&key).map(|s| s.kind.clone())
            else {
                continue;
            };
            let Some((producer_state, producer_skip)) = self
                .records
                .get(&resolved_by.step_key)
                .map(|r| (r.state, r.skip_reason))
            else {
                continue;
            };

            match producer_state {
                StepState::Success => {
                    let items = match self.produced(&resolved_by) {
                        Some(ProducedOutput::Dynamic(items)) => {
                            Some(items.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>())
                        }
                        _ => None,
                    };
                    match items {
                        Some(mapping_keys) => self.expand(&key, resolved_by, mapping_keys, out),
                        None => self.skip(&key, SkipReason::OptionalBranch, out),
                    }
                }
                StepState::Failure => self.skip(&key, SkipReason::UpstreamFailure, out),
                StepState::Skipped => self.skip(&key, propagated(producer_skip), out),
                _ => continue,
            }
            changed = true;
        }
        changed
    }

    fn expand(
        &mut self,
        key: &StepKey,
        resolved_by: StepOutputRef,
        mapping_keys: Vec<String>,
        out: &mut Vec<Transition>,
    ) {
        let Some(placeholder) = self.steps.get(key) else {
            return;
        };
        let instances = materialize(&[placeholder], &mapping_keys);
        let instance_keys: Vec<StepKey> = instances.iter().map(|s| s.key.clone()).collect();

        if let Some(record) = self.records.get_mut(key) {
            record.state = StepState::Expanded;
        }
        info!(
            placeholder = %key,
            producer = %resolved_by.step_key,
            count = instance_keys.len(),
            "materialized mapped steps"
        );
        out.push(Transition::Materialized {
            placeholder: key.clone(),
            producer: resolved_by.step_key,
            output: resolved_by.output,
            mapping_keys,
            steps: instance_keys.clone(),
        });

        let selected = self.instance_selection.get(key).cloned();
        for instance in instances {
            let instance_key = instance.key.clone();
            let runs = match (&selected, instance_key.mapping_key()) {
                (Some(selected), Some(mapping_key)) => selected.contains(mapping_key),
                _ => true,
            };
            if !runs && self.known.succeeded(&instance_key) {
                self.reuse(instance);
                continue;
            }

            self.order.push(instance_key.clone());
            self.records
                .insert(instance_key.clone(), StepRecord::new(StepState::Queued));
            self.steps.insert(instance_key.clone(), instance);
            if runs {
                out.push(Transition::Queued {
                    step: instance_key,
                    attempt: 1,
                });
            } else {
                self.skip(&instance_key, SkipReason::NotSelected, out);
            }
        }
        self.expansions.insert(key.clone(), instance_keys);
    }

    /// Skip or fail queued steps that can never become ready.
    fn settle_queued(&mut self, out: &mut Vec<Transition>) -> bool {
        let mut changed = false;
        for key in self.queued_keys() {
            match self.readiness(&key) {
                Readiness::Skip(reason) => {
                    self.skip(&key, reason, out);
                    changed = true;
                }
                Readiness::Fail(failure) => {
                    self.fail(&key, failure, out);
                    changed = true;
                }
                Readiness::Ready(_) | Readiness::Waiting => {}
            }
        }
        changed
    }

    fn dispatch_ready(&mut self, out: &mut Vec<Transition>) {
        if self.cancel_requested {
            return;
        }
        for key in self.queued_keys() {
            if self.in_flight >= self.settings.max_concurrent {
                break;
            }
            let Readiness::Ready(inputs) = self.readiness(&key) else {
                continue;
            };
            let Some(step) = self.steps.get(&key).cloned() else {
                continue;
            };
            let Some(record) = self.records.get_mut(&key) else {
                continue;
            };
            record.state = StepState::Starting;
            self.in_flight += 1;
            debug!(step = %key, attempt = record.attempt, "dispatching step");
            out.push(Transition::Starting(StepDispatch {
                step,
                attempt: record.attempt,
                inputs,
            }));
        }
    }

    fn queued_keys(&self) -> Vec<StepKey> {
        self.order
            .iter()
            .filter(|key| self.state(key) == Some(StepState::Queued))
            .cloned()
            .collect()
    }

    fn skip(&mut self, key: &StepKey, reason: SkipReason, out: &mut Vec<Transition>) {
        if let Some(record) = self.records.get_mut(key) {
            record.state = StepState::Skipped;
            record.skip_reason = Some(reason);
            debug!(step = %key, ?reason, "step skipped");
            out.push(Transition::Skipped {
                step: key.clone(),
                reason,
            });
        }
    }

    fn fail(&mut self, key: &StepKey, failure: StepFailure, out: &mut Vec<Transition>) {
        if let Some(record) = self.records.get_mut(key) {
            record.state = StepState::Failure;
            record.failure = Some(failure.clone());
            out.push(Transition::Failed {
                step: key.clone(),
                attempt: record.attempt,
                failure,
                terminal: true,
            });
        }
    }

    fn readiness(&self, key: &StepKey) -> Readiness {
        let Some(step) = self.steps.get(key) else {
            return Readiness::Waiting;
        };

        let mut resolved = Vec::with_capacity(step.inputs.len());
        let mut waiting = false;
        let mut failure = None;
        let mut skip = None;

        for input in &step.inputs {
            let ordering_only = input.type_name == NOTHING;
            match self.input_readiness(&input.source, ordering_only) {
                InputReadiness::Value(value) => resolved.push(ResolvedInput {
                    name: input.name.clone(),
                    type_name: input.type_name.clone(),
                    value,
                }),
                InputReadiness::Waiting => waiting = true,
                InputReadiness::Skip(SkipReason::UpstreamFailure) => {
                    return Readiness::Skip(SkipReason::UpstreamFailure);
                }
                InputReadiness::Skip(reason) => {
                    skip.get_or_insert(reason);
                }
                InputReadiness::Fail(f) => {
                    failure.get_or_insert(f);
                }
            }
        }

        if waiting {
            Readiness::Waiting
        } else if let Some(f) = failure {
            Readiness::Fail(f)
        } else if let Some(reason) = skip {
            Readiness::Skip(reason)
        } else {
            Readiness::Ready(resolved)
        }
    }

    fn input_readiness(&self, source: &StepInputSource, ordering_only: bool) -> InputReadiness {
        match source {
            StepInputSource::FromStepOutput { upstream } => self.single_input(upstream, ordering_only),
            StepInputSource::FromMultipleSources { upstream } => {
                self.fan_in_input(upstream, ordering_only)
            }
            StepInputSource::Collect { upstream } => self.collect_input(upstream),
            StepInputSource::FromPendingDynamic { .. }
            | StepInputSource::FromUnresolvedStepOutput { .. } => InputReadiness::Waiting,
            StepInputSource::FromConfig { value } | StepInputSource::FromDefault { value } => {
                InputReadiness::Value(InputValue::Literal(value.clone()))
            }
            StepInputSource::NoValue => InputReadiness::Value(InputValue::Unit),
        }
    }

    /// `Ok` once the producer succeeded, otherwise what its state means for
    /// a consumer.
    fn producer_gate(&self, key: &StepKey) -> Result<(), InputReadiness> {
        let Some(record) = self.records.get(key) else {
            return Err(InputReadiness::Waiting);
        };
        match record.state {
            StepState::Success => Ok(()),
            StepState::Failure => Err(InputReadiness::Skip(SkipReason::UpstreamFailure)),
            StepState::Skipped => Err(InputReadiness::Skip(propagated(record.skip_reason))),
            StepState::Expanded => Err(InputReadiness::Fail(
                StepFailure::new(
                    FailureKind::UpstreamFailed,
                    format!("input reads mapped step '{key}' without collecting it"),
                )
                .non_retryable(),
            )),
            _ => Err(InputReadiness::Waiting),
        }
    }

    fn produced(&self, upstream: &StepOutputRef) -> Option<&ProducedOutput> {
        self.outputs.get(&upstream.step_key)?.get(&upstream.output)
    }

    fn single_input(&self, upstream: &StepOutputRef, ordering_only: bool) -> InputReadiness {
        if let Err(gate) = self.producer_gate(&upstream.step_key) {
            return gate;
        }
        if ordering_only {
            return InputReadiness::Value(InputValue::Unit);
        }

        let value = match (self.produced(upstream), &upstream.mapping_key) {
            (Some(produced), Some(mapping_key)) => {
                produced.item(mapping_key).cloned().map(InputValue::Single)
            }
            (Some(ProducedOutput::Single(handle)), None) => Some(InputValue::Single(handle.clone())),
            (Some(produced @ ProducedOutput::Dynamic(_)), None) => {
                Some(InputValue::Many(produced.handles()))
            }
            (None, _) => None,
        };
        match value {
            Some(value) => InputReadiness::Value(value),
            None => InputReadiness::Skip(SkipReason::OptionalBranch),
        }
    }

    /// Plain fan-in: waits for every source, drops sources that produced
    /// nothing, and passes the rest as a list.
    fn fan_in_input(&self, upstream: &[StepOutputRef], ordering_only: bool) -> InputReadiness {
        let mut handles = Vec::new();
        let mut pending = false;

        for source in upstream {
            match self.producer_gate(&source.step_key) {
                Ok(()) => {
                    if let Some(produced) = self.produced(source) {
                        handles.extend(produced.handles());
                    }
                }
                Err(InputReadiness::Waiting) => pending = true,
                Err(InputReadiness::Skip(SkipReason::UpstreamFailure)) => {
                    return InputReadiness::Skip(SkipReason::UpstreamFailure);
                }
                Err(InputReadiness::Fail(failure)) => return InputReadiness::Fail(failure),
                Err(_) => {}
            }
        }

        if pending {
            InputReadiness::Waiting
        } else if ordering_only {
            InputReadiness::Value(InputValue::Unit)
        } else if handles.is_empty() {
            InputReadiness::Skip(SkipReason::OptionalBranch)
        } else {
            InputReadiness::Value(InputValue::Many(handles))
        }
    }

    /// Barrier over every item of a dynamic output, or every instance of a
    /// placeholder.
    fn collect_input(&self, upstream: &StepOutputRef) -> InputReadiness {
        let over_placeholder = self
            .steps
            .get(&upstream.step_key)
            .is_some_and(ExecutionStep::is_unresolved);

        if !over_placeholder {
            if let Err(gate) = self.producer_gate(&upstream.step_key) {
                return gate;
            }
            return match self.produced(upstream) {
                Some(produced) => InputReadiness::Value(InputValue::Many(produced.handles())),
                None => InputReadiness::Skip(SkipReason::OptionalBranch),
            };
        }

        let Some(record) = self.records.get(&upstream.step_key) else {
            return InputReadiness::Waiting;
        };
        match record.state {
            StepState::Expanded => {}
            StepState::Skipped => return InputReadiness::Skip(propagated(record.skip_reason)),
            _ => return InputReadiness::Waiting,
        }

        let instances = self
            .instances_of(&upstream.step_key)
            .unwrap_or_default();
        let mut handles = Vec::with_capacity(instances.len());
        let mut failed = 0usize;

        for instance in instances {
            let Some(record) = self.records.get(instance) else {
                return InputReadiness::Waiting;
            };
            match record.state {
                StepState::Success => {
                    let output = StepOutputRef::new(instance.clone(), upstream.output.clone());
                    if let Some(produced) = self.produced(&output) {
                        handles.extend(produced.handles());
                    }
                }
                StepState::Failure => failed += 1,
                StepState::Skipped if record.skip_reason == Some(SkipReason::OptionalBranch) => {}
                StepState::Skipped => failed += 1,
                _ => return InputReadiness::Waiting,
            }
        }

        if failed == 0 {
            return InputReadiness::Value(InputValue::Many(handles));
        }
        match self.settings.collect_strictness {
            CollectStrictness::Partial if !handles.is_empty() => {
                InputReadiness::Value(InputValue::Many(handles))
            }
            _ => InputReadiness::Fail(
                StepFailure::new(
                    FailureKind::UpstreamFailed,
                    format!(
                        "{failed} of {} mapped instances of '{}' did not succeed",
                        instances.len(),
                        upstream.step_key.handle_str()
                    ),
                )
                .non_retryable(),
            ),
        }
    }
}

fn propagated(reason: Option<SkipReason>) -> SkipReason {
    match reason {
        Some(SkipReason::OptionalBranch) => SkipReason::OptionalBranch,
        Some(SkipReason::Canceled) => SkipReason::Canceled,
        Some(SkipReason::NotSelected) => SkipReason::NotSelected,
        _ => SkipReason::UpstreamFailure,
    }
}
