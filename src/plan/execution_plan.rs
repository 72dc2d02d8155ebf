// src/plan/execution_plan.rs

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::CompileError;
use crate::plan::known_state::KnownExecutionState;
use crate::plan::step::{ExecutionStep, StepInput, StepKey, StepKind, StepOutputRef};

/// Immutable flat step graph produced by the compiler.
///
/// Dynamic placeholders appear as single `[?]` steps; the run-time table in
/// the scheduler grows from here.
///
/// A plan built by [`subset`](Self::subset) still describes every step but
/// only runs the selected ones; the rest come from its known state.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pipeline: String,
    mode: String,
    order: Vec<StepKey>,
    steps: BTreeMap<StepKey, ExecutionStep>,
    edges: BTreeSet<(StepKey, StepKey)>,
    /// `None` runs every step.
    selection: Option<BTreeSet<StepKey>>,
    /// Selected placeholder -> mapping keys of the instances to run.
    instance_selection: BTreeMap<StepKey, BTreeSet<String>>,
    known_state: KnownExecutionState,
}

impl ExecutionPlan {
    /// `steps` must already be in topological order.
    pub(crate) fn new(pipeline: String, mode: String, steps: Vec<ExecutionStep>) -> Self {
        let order: Vec<StepKey> = steps.iter().map(|s| s.key.clone()).collect();
        let edges = steps
            .iter()
            .flat_map(|s| {
                s.upstream_keys()
                    .into_iter()
                    .map(move |up| (up, s.key.clone()))
            })
            .collect();
        let steps = steps.into_iter().map(|s| (s.key.clone(), s)).collect();

        Self {
            pipeline,
            mode,
            order,
            steps,
            edges,
            selection: None,
            instance_selection: BTreeMap::new(),
            known_state: KnownExecutionState::default(),
        }
    }

    /// Plan that runs only `step_keys`, reading everything they depend on
    /// from `known_state`.
    ///
    /// Keys may name plan steps or, when the placeholder `h[?]` is selected
    /// too, mapped instances `h[k]`; with instance keys present only those
    /// instances run once `h[?]` expands. Every unselected step a selected
    /// step reads from must be known to have succeeded.
    pub fn subset<I, S>(
        &self,
        step_keys: I,
        known_state: KnownExecutionState,
    ) -> Result<Self, CompileError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let requested: BTreeSet<StepKey> =
            step_keys.into_iter().map(|k| StepKey::new(k.as_ref())).collect();

        let mut selection = BTreeSet::new();
        let mut instance_selection: BTreeMap<StepKey, BTreeSet<String>> = BTreeMap::new();
        let mut unknown = Vec::new();

        for key in &requested {
            if self.steps.contains_key(key) {
                selection.insert(key.clone());
                continue;
            }
            let placeholder = key
                .unresolved_form()
                .filter(|p| self.steps.contains_key(p) && requested.contains(p));
            match (placeholder, key.mapping_key()) {
                (Some(placeholder), Some(mapping_key)) => {
                    instance_selection
                        .entry(placeholder)
                        .or_default()
                        .insert(mapping_key.to_string());
                }
                _ => unknown.push(key.to_string()),
            }
        }
        if !unknown.is_empty() {
            return Err(CompileError::StepNotFound { keys: unknown });
        }

        for key in &selection {
            let resolver = match self.steps.get(key).map(|s| &s.kind) {
                Some(StepKind::Unresolved { resolved_by }) => Some(resolved_by.step_key.clone()),
                _ => None,
            };
            for upstream in self.upstream_keys(key).into_iter().chain(resolver) {
                if selection.contains(&upstream) {
                    continue;
                }
                let known = if upstream.is_unresolved() {
                    known_state.mapping_keys(&upstream).is_some()
                } else {
                    known_state.succeeded(&upstream)
                };
                if !known {
                    return Err(CompileError::MissingKnownState {
                        step: key.to_string(),
                        upstream: upstream.to_string(),
                    });
                }
            }
        }

        Ok(Self {
            selection: Some(selection),
            instance_selection,
            known_state,
            ..self.clone()
        })
    }

    pub fn is_selected(&self, key: &StepKey) -> bool {
        self.selection.as_ref().is_none_or(|s| s.contains(key))
    }

    /// Steps that will run, in topological order.
    pub fn selected_steps(&self) -> impl Iterator<Item = &ExecutionStep> {
        self.steps().filter(|s| self.is_selected(&s.key))
    }

    /// Mapping keys to run for a selected placeholder; `None` runs them all.
    pub fn selected_instances(&self, placeholder: &StepKey) -> Option<&BTreeSet<String>> {
        self.instance_selection.get(placeholder)
    }

    pub fn known_state(&self) -> &KnownExecutionState {
        &self.known_state
    }

    pub fn pipeline_name(&self) -> &str {
        &self.pipeline
    }

    pub fn mode(&self) -> &str {
        &self.mode
    }

    /// Steps in topological order.
    pub fn steps(&self) -> impl Iterator<Item = &ExecutionStep> {
        self.order.iter().filter_map(|k| self.steps.get(k))
    }

    pub fn step(&self, key: &StepKey) -> Option<&ExecutionStep> {
        self.steps.get(key)
    }

    pub fn step_keys(&self) -> Vec<StepKey> {
        self.order.clone()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// `(upstream, downstream)` pairs.
    pub fn dependency_edges(&self) -> &BTreeSet<(StepKey, StepKey)> {
        &self.edges
    }

    pub fn upstream_keys(&self, key: &StepKey) -> BTreeSet<StepKey> {
        self.steps
            .get(key)
            .map(|s| s.upstream_keys())
            .unwrap_or_default()
    }

    pub fn downstream_keys(&self, key: &StepKey) -> BTreeSet<StepKey> {
        self.edges
            .iter()
            .filter(|(up, _)| up == key)
            .map(|(_, down)| down.clone())
            .collect()
    }

    /// Steps grouped by depth: level 0 has no upstream, level n depends on
    /// something at level n-1. Keys are sorted within a level.
    pub fn steps_by_level(&self) -> Vec<Vec<StepKey>> {
        let mut level_of: BTreeMap<&StepKey, usize> = BTreeMap::new();
        let mut levels: Vec<Vec<StepKey>> = Vec::new();

        for key in &self.order {
            let level = self
                .upstream_keys(key)
                .iter()
                .filter_map(|up| level_of.get(up))
                .map(|l| l + 1)
                .max()
                .unwrap_or(0);
            level_of.insert(key, level);
            if levels.len() <= level {
                levels.resize_with(level + 1, Vec::new);
            }
            levels[level].push(key.clone());
        }

        for level in &mut levels {
            level.sort();
        }
        levels
    }

    /// Number of selected steps declaring each resource key.
    pub fn resource_users(&self) -> BTreeMap<String, usize> {
        let mut users = BTreeMap::new();
        for step in self.selected_steps() {
            for key in &step.required_resource_keys {
                *users.entry(key.clone()).or_insert(0) += 1;
            }
        }
        users
    }

    /// Placeholders waiting on the given dynamic output.
    pub fn placeholders_resolved_by(&self, root: &StepOutputRef) -> Vec<&ExecutionStep> {
        self.steps()
            .filter(|s| matches!(&s.kind, StepKind::Unresolved { resolved_by } if resolved_by == root))
            .collect()
    }

    pub fn snapshot(&self) -> PlanSnapshot {
        PlanSnapshot {
            pipeline: self.pipeline.clone(),
            mode: self.mode.clone(),
            steps: self.steps().map(StepSnapshot::from).collect(),
            edges: self.edges.iter().cloned().collect(),
            selection: self.selection.as_ref().map(|s| {
                let mut keys: Vec<StepKey> = s.iter().cloned().collect();
                keys.extend(self.instance_selection.iter().flat_map(|(placeholder, mapping_keys)| {
                    mapping_keys.iter().map(move |k| placeholder.with_mapping_key(k))
                }));
                keys
            }),
        }
    }
}

/// Serializable description of a plan, for presentation layers and for
/// comparing plans across runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSnapshot {
    pub pipeline: String,
    pub mode: String,
    pub steps: Vec<StepSnapshot>,
    pub edges: Vec<(StepKey, StepKey)>,
    /// Keys requested for a subset run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Vec<StepKey>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSnapshot {
    pub key: StepKey,
    pub handle: String,
    pub kind: StepKind,
    pub inputs: Vec<StepInput>,
    pub outputs: Vec<OutputSnapshot>,
    pub required_resource_keys: Vec<String>,
    pub config: Value,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSnapshot {
    pub name: String,
    pub type_name: String,
    pub is_dynamic: bool,
    pub is_required: bool,
}

impl From<&ExecutionStep> for StepSnapshot {
    fn from(step: &ExecutionStep) -> Self {
        Self {
            key: step.key.clone(),
            handle: step.handle.to_string(),
            kind: step.kind.clone(),
            inputs: step.inputs.clone(),
            outputs: step
                .outputs
                .iter()
                .map(|o| OutputSnapshot {
                    name: o.name.clone(),
                    type_name: o.type_name.clone(),
                    is_dynamic: o.is_dynamic,
                    is_required: o.is_required,
                })
                .collect(),
            required_resource_keys: step.required_resource_keys.iter().cloned().collect(),
            config: step.config.clone(),
            tags: step.tags.clone(),
        }
    }
}
