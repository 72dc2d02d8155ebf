// src/plan/dynamic.rs

//! Run-time materialization of dynamic placeholders.

use crate::plan::step::{ExecutionStep, StepInputSource, StepKey, StepKind, StepOutputRef};

/// Create one concrete step per mapping key for each placeholder.
///
/// Inputs fed by the dynamic output pick up their item; inputs fed by a
/// sibling placeholder are rewired to the sibling instance with the same
/// key. Output is placeholder-major, in the order given.
pub fn materialize(placeholders: &[&ExecutionStep], mapping_keys: &[String]) -> Vec<ExecutionStep> {
    let mut steps = Vec::with_capacity(placeholders.len() * mapping_keys.len());
    for placeholder in placeholders {
        let StepKind::Unresolved { resolved_by } = &placeholder.kind else {
            continue;
        };
        for mapping_key in mapping_keys {
            steps.push(instance_of(placeholder, resolved_by, mapping_key));
        }
    }
    steps
}

fn instance_of(placeholder: &ExecutionStep, resolved_by: &StepOutputRef, mapping_key: &str) -> ExecutionStep {
    let inputs = placeholder
        .inputs
        .iter()
        .map(|input| {
            let source = match &input.source {
                StepInputSource::FromPendingDynamic { upstream } => StepInputSource::FromStepOutput {
                    upstream: upstream.clone().with_mapping_key(mapping_key),
                },
                StepInputSource::FromUnresolvedStepOutput { upstream } => {
                    StepInputSource::FromStepOutput {
                        upstream: StepOutputRef::new(
                            upstream.step_key.with_mapping_key(mapping_key),
                            upstream.output.clone(),
                        ),
                    }
                }
                other => other.clone(),
            };
            let mut input = input.clone();
            input.source = source;
            input
        })
        .collect();

    ExecutionStep {
        key: StepKey::mapped(&placeholder.handle, mapping_key),
        handle: placeholder.handle.clone(),
        kind: StepKind::Mapped {
            mapping_key: mapping_key.to_string(),
            resolved_by: resolved_by.clone(),
        },
        inputs,
        outputs: placeholder.outputs.clone(),
        required_resource_keys: placeholder.required_resource_keys.clone(),
        retry_policy: placeholder.retry_policy.clone(),
        config: placeholder.config.clone(),
        tags: placeholder.tags.clone(),
        definition: placeholder.definition.clone(),
    }
}
