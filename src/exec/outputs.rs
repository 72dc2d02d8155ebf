// src/exec/outputs.rs

//! Validation of what a compute yielded against the step's declared outputs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::exec::ComputeOutput;
use crate::plan::ExecutionStep;
use crate::scheduler::{FailureKind, StepFailure};

static MAPPING_KEY: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]+$").ok());

/// Whether `key` may be used as a mapping key of a dynamic output.
pub fn is_valid_mapping_key(key: &str) -> bool {
    MAPPING_KEY.as_ref().is_some_and(|re| re.is_match(key))
}

/// Yielded values grouped per declared output.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CheckedOutput {
    Single(Value),
    Dynamic(Vec<(String, Value)>),
}

fn invalid(step: &ExecutionStep, message: String) -> StepFailure {
    StepFailure::new(FailureKind::InvalidOutput, format!("step '{}': {message}", step.key))
        .non_retryable()
}

/// Check yielded values and group them by output.
///
/// Rejects unknown outputs, mapping keys on plain outputs (and their absence
/// on dynamic ones), malformed or repeated mapping keys, outputs yielded
/// twice, and missing required outputs. A dynamic output declared empty
/// counts as produced.
pub(crate) fn check_outputs(
    step: &ExecutionStep,
    produced: ComputeOutput,
) -> Result<BTreeMap<String, CheckedOutput>, StepFailure> {
    let (values, empty_dynamic) = produced.into_parts();
    let mut checked: BTreeMap<String, CheckedOutput> = BTreeMap::new();
    let mut seen_keys: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    for yielded in values {
        let Some(def) = step.output(&yielded.output) else {
            return Err(invalid(step, format!("unknown output '{}'", yielded.output)));
        };

        match (def.is_dynamic, yielded.mapping_key) {
            (false, Some(key)) => {
                return Err(invalid(
                    step,
                    format!("output '{}' is not dynamic but got mapping key '{key}'", def.name),
                ));
            }
            (true, None) => {
                return Err(invalid(
                    step,
                    format!("dynamic output '{}' yielded a value without a mapping key", def.name),
                ));
            }
            (false, None) => {
                if checked.contains_key(&def.name) {
                    return Err(invalid(step, format!("output '{}' yielded more than once", def.name)));
                }
                checked.insert(def.name.clone(), CheckedOutput::Single(yielded.value));
            }
            (true, Some(key)) => {
                if !is_valid_mapping_key(&key) {
                    return Err(invalid(
                        step,
                        format!("mapping key '{key}' of output '{}' must match [A-Za-z0-9_]+", def.name),
                    ));
                }
                if !seen_keys.entry(def.name.clone()).or_default().insert(key.clone()) {
                    return Err(invalid(
                        step,
                        format!("mapping key '{key}' repeated on output '{}'", def.name),
                    ));
                }
                let entry = checked
                    .entry(def.name.clone())
                    .or_insert_with(|| CheckedOutput::Dynamic(Vec::new()));
                if let CheckedOutput::Dynamic(items) = entry {
                    items.push((key, yielded.value));
                }
            }
        }
    }

    for name in empty_dynamic {
        match step.output(&name) {
            Some(def) if def.is_dynamic => {
                checked
                    .entry(name)
                    .or_insert_with(|| CheckedOutput::Dynamic(Vec::new()));
            }
            _ => {
                return Err(invalid(step, format!("'{name}' is not a dynamic output")));
            }
        }
    }

    if let Some(missing) = step
        .outputs
        .iter()
        .find(|o| o.is_required && !checked.contains_key(&o.name))
    {
        return Err(invalid(step, format!("required output '{}' was not produced", missing.name)));
    }

    Ok(checked)
}
