// src/plan/known_state.rs

//! What earlier runs already produced, so a re-execution can run only part
//! of a plan and read everything else through the IO manager.

use std::collections::{BTreeMap, BTreeSet};

use uuid::Uuid;

use crate::io::OutputHandle;
use crate::ledger::{Event, EventKind, LedgerError, LedgerStore};
use crate::plan::StepKey;
use crate::scheduler::ProducedOutput;

/// Outputs and dynamic mappings of steps that succeeded before.
///
/// Usually rebuilt from the ledger of one or more earlier runs, oldest
/// first; a later success of the same step replaces the earlier one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KnownExecutionState {
    succeeded: BTreeSet<StepKey>,
    outputs: BTreeMap<StepKey, BTreeMap<String, ProducedOutput>>,
    /// Placeholder key -> mapping keys it was expanded with.
    mappings: BTreeMap<StepKey, Vec<String>>,
}

impl KnownExecutionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a Event>) -> Self {
        let mut state = Self::new();
        state.absorb(events);
        state
    }

    /// State left behind by run `run_id` in `ledger`.
    pub async fn from_run(ledger: &dyn LedgerStore, run_id: Uuid) -> Result<Self, LedgerError> {
        let records = ledger.read(run_id, 0).await?;
        Ok(Self::from_events(records.iter().map(|r| &r.event)))
    }

    /// Fold in the events of a later run.
    pub fn absorb<'a>(&mut self, events: impl IntoIterator<Item = &'a Event>) {
        let mut attempt_outputs: BTreeMap<StepKey, BTreeMap<String, ProducedOutput>> =
            BTreeMap::new();

        for event in events {
            let Some(key) = &event.step_key else {
                continue;
            };
            match &event.kind {
                EventKind::StepStarting => {
                    attempt_outputs.remove(key);
                }
                EventKind::StepOutput {
                    output,
                    mapping_key,
                    handle,
                } => {
                    let outputs = attempt_outputs.entry(key.clone()).or_default();
                    match mapping_key {
                        None => {
                            outputs.insert(output.clone(), ProducedOutput::Single(handle.clone()));
                        }
                        Some(mapping_key) => push_item(outputs, output, mapping_key, handle),
                    }
                }
                EventKind::StepSuccess => {
                    let outputs = attempt_outputs.remove(key).unwrap_or_default();
                    self.succeeded.insert(key.clone());
                    self.outputs.insert(key.clone(), outputs);
                }
                EventKind::StepsMaterialized {
                    producer,
                    output,
                    mapping_keys,
                    ..
                } => {
                    self.mappings.insert(key.clone(), mapping_keys.clone());
                    // A dynamic output with no items leaves no output events.
                    if let Some(outputs) = self.outputs.get_mut(producer) {
                        outputs
                            .entry(output.clone())
                            .or_insert_with(|| ProducedOutput::Dynamic(Vec::new()));
                    }
                }
                _ => {}
            }
        }
    }

    pub fn with_output(mut self, step: StepKey, output: impl Into<String>, handle: OutputHandle) -> Self {
        self.succeeded.insert(step.clone());
        self.outputs
            .entry(step)
            .or_default()
            .insert(output.into(), ProducedOutput::Single(handle));
        self
    }

    pub fn with_mapping(mut self, placeholder: StepKey, mapping_keys: Vec<String>) -> Self {
        self.mappings.insert(placeholder, mapping_keys);
        self
    }

    pub fn succeeded(&self, step: &StepKey) -> bool {
        self.succeeded.contains(step)
    }

    pub fn outputs_of(&self, step: &StepKey) -> Option<&BTreeMap<String, ProducedOutput>> {
        if !self.succeeded(step) {
            return None;
        }
        self.outputs.get(step)
    }

    pub fn mapping_keys(&self, placeholder: &StepKey) -> Option<&[String]> {
        self.mappings.get(placeholder).map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.succeeded.is_empty() && self.mappings.is_empty()
    }
}

fn push_item(
    outputs: &mut BTreeMap<String, ProducedOutput>,
    output: &str,
    mapping_key: &str,
    handle: &OutputHandle,
) {
    let entry = outputs
        .entry(output.to_string())
        .or_insert_with(|| ProducedOutput::Dynamic(Vec::new()));
    if let ProducedOutput::Dynamic(items) = entry {
        items.push((mapping_key.to_string(), handle.clone()));
    }
}
