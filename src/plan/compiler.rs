// src/plan/compiler.rs

//! Graph + run config -> flat execution plan.
//!
//! Compilation is deterministic and side-effect free: the same inputs always
//! produce the same step keys and edges.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::config::RunConfig;
use crate::errors::CompileError;
use crate::graph::{NodeHandle, OutputDefinition, Pipeline};
use crate::plan::execution_plan::ExecutionPlan;
use crate::plan::flatten::{FlatGraph, FlatInput, FlatNode, FlatOutput, FlatSource, LiteralOrigin, flatten};
use crate::plan::step::{ExecutionStep, StepInput, StepInputSource, StepKey, StepKind, StepOutputRef};
use crate::plan::validate::{check_types, topological_order};

/// Compile `pipeline` under `config` into an [`ExecutionPlan`].
pub fn compile(pipeline: &Pipeline, config: &RunConfig) -> Result<ExecutionPlan, CompileError> {
    let mode = pipeline
        .mode(&config.mode)
        .ok_or_else(|| CompileError::UnknownMode(config.mode.clone()))?;

    let flat = flatten(pipeline.graph(), config)?;
    check_node_config_targets(&flat, config)?;
    check_types(&flat, pipeline.type_compatibility())?;
    let order = topological_order(&flat)?;

    let by_handle: BTreeMap<String, &FlatNode> =
        flat.nodes.iter().map(|n| (n.handle.to_string(), n)).collect();
    let mapped = resolve_mapping_roots(&order, &by_handle)?;

    let mut steps = Vec::with_capacity(order.len());
    for handle in &order {
        if let Some(node) = by_handle.get(handle) {
            steps.push(build_step(node, &by_handle, &mapped, config)?);
        }
    }

    let missing: Vec<String> = steps
        .iter()
        .flat_map(|s| s.required_resource_keys.iter())
        .filter(|key| !mode.has_resource(key))
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    if !missing.is_empty() {
        return Err(CompileError::MissingResources { missing });
    }

    debug!(
        pipeline = pipeline.name(),
        mode = mode.name(),
        steps = steps.len(),
        "compiled execution plan"
    );

    Ok(ExecutionPlan::new(
        pipeline.name().to_string(),
        mode.name().to_string(),
        steps,
    ))
}

fn check_node_config_targets(flat: &FlatGraph, config: &RunConfig) -> Result<(), CompileError> {
    for (handle, node_cfg) in &config.nodes {
        let known_inputs: Vec<&str> =
            if let Some(node) = flat.nodes.iter().find(|n| n.handle.to_string() == *handle) {
                node.definition.inputs().iter().map(|i| i.name.as_str()).collect()
            } else if let Some(inputs) = flat.composites.get(handle) {
                if node_cfg.config.is_some() {
                    return Err(CompileError::InvalidNodeConfig {
                        handle: handle.clone(),
                        message: "composites do not take config".to_string(),
                    });
                }
                inputs.iter().map(|s| s.as_str()).collect()
            } else {
                return Err(CompileError::UnknownNodeConfig(handle.clone()));
            };

        if let Some(unknown) = node_cfg
            .inputs
            .keys()
            .find(|name| !known_inputs.contains(&name.as_str()))
        {
            return Err(CompileError::InvalidNodeConfig {
                handle: handle.clone(),
                message: format!("unknown input '{unknown}'"),
            });
        }
    }
    Ok(())
}

fn output_def<'a>(
    by_handle: &BTreeMap<String, &'a FlatNode>,
    r: &FlatOutput,
) -> Option<&'a OutputDefinition> {
    by_handle
        .get(&r.handle.to_string())
        .and_then(|n| n.definition.output(&r.output))
}

fn root_ref(r: &FlatOutput) -> StepOutputRef {
    StepOutputRef::new(StepKey::for_handle(&r.handle), r.output.clone())
}

/// Decide which nodes become dynamic placeholders and which dynamic output
/// each one is mapped over. Walks in topological order so chained
/// placeholders inherit their producer's root.
fn resolve_mapping_roots(
    order: &[String],
    by_handle: &BTreeMap<String, &FlatNode>,
) -> Result<BTreeMap<String, StepOutputRef>, CompileError> {
    let mut mapped: BTreeMap<String, StepOutputRef> = BTreeMap::new();

    for handle in order {
        let Some(node) = by_handle.get(handle) else {
            continue;
        };
        let invalid = |message: String| CompileError::InvalidDynamic {
            handle: handle.clone(),
            message,
        };

        let mut root: Option<StepOutputRef> = None;
        let mut collects = false;

        for input in &node.inputs {
            let FlatSource::Upstream(refs) = &input.source else {
                continue;
            };

            if input.def.is_dynamic_collect {
                collects = true;
                let [r] = refs.as_slice() else {
                    return Err(invalid(format!(
                        "collect input '{}' must reference exactly one output",
                        input.def.name
                    )));
                };
                let dynamic = output_def(by_handle, r).is_some_and(|o| o.is_dynamic);
                if !dynamic && !mapped.contains_key(&r.handle.to_string()) {
                    return Err(invalid(format!(
                        "collect input '{}' does not reach a dynamic output",
                        input.def.name
                    )));
                }
                continue;
            }

            for r in refs {
                let producer_root = mapped.get(&r.handle.to_string());
                let candidate = if output_def(by_handle, r).is_some_and(|o| o.is_dynamic) {
                    if producer_root.is_some() {
                        return Err(invalid(format!(
                            "dynamic output '{}.{}' is declared inside a mapped step",
                            r.handle, r.output
                        )));
                    }
                    Some(root_ref(r))
                } else {
                    producer_root.cloned()
                };

                let Some(candidate) = candidate else {
                    continue;
                };
                if refs.len() > 1 {
                    return Err(invalid(format!(
                        "input '{}' fans in the dynamic or mapped output '{}.{}'",
                        input.def.name, r.handle, r.output
                    )));
                }
                if let Some(existing) = &root {
                    if *existing != candidate {
                        return Err(invalid(format!(
                            "mapped over two different dynamic outputs ({existing} and {candidate})"
                        )));
                    }
                }
                root = Some(candidate);
            }
        }

        if let Some(root) = root {
            if collects {
                return Err(invalid(
                    "a step cannot be both mapped over and collecting a dynamic output".to_string(),
                ));
            }
            if let Some(out) = node.definition.outputs().iter().find(|o| o.is_dynamic) {
                return Err(invalid(format!(
                    "dynamic output '{}' is declared inside a mapped step",
                    out.name
                )));
            }
            mapped.insert(handle.clone(), root);
        }
    }

    Ok(mapped)
}

fn step_key_of(handle: &NodeHandle, mapped: &BTreeMap<String, StepOutputRef>) -> StepKey {
    if mapped.contains_key(&handle.to_string()) {
        StepKey::unresolved(handle)
    } else {
        StepKey::for_handle(handle)
    }
}

fn build_step(
    node: &FlatNode,
    by_handle: &BTreeMap<String, &FlatNode>,
    mapped: &BTreeMap<String, StepOutputRef>,
    config: &RunConfig,
) -> Result<ExecutionStep, CompileError> {
    let handle_str = node.handle.to_string();
    let node_cfg = config.node(&handle_str);

    let inputs = node
        .inputs
        .iter()
        .map(|input| {
            Ok(StepInput {
                name: input.def.name.clone(),
                type_name: input.def.type_name.clone(),
                source: input_source(node, input, by_handle, mapped, config)?,
            })
        })
        .collect::<Result<Vec<_>, CompileError>>()?;

    let step_config = node
        .definition
        .config_schema()
        .validate(node_cfg.and_then(|c| c.config.as_ref()))
        .map_err(|message| CompileError::InvalidNodeConfig {
            handle: handle_str.clone(),
            message,
        })?;

    let kind = match mapped.get(&handle_str) {
        Some(root) => StepKind::Unresolved {
            resolved_by: root.clone(),
        },
        None => StepKind::Compute,
    };

    Ok(ExecutionStep {
        key: step_key_of(&node.handle, mapped),
        handle: node.handle.clone(),
        kind,
        inputs,
        outputs: node.definition.outputs().to_vec(),
        required_resource_keys: node.definition.required_resource_keys().clone(),
        retry_policy: node.definition.retry_policy().cloned(),
        config: step_config,
        tags: node.definition.tags().clone(),
        definition: node.definition.clone(),
    })
}

/// Resolution order: wired edges, composite boundary, run config inputs,
/// input default, `Nothing`.
fn input_source(
    node: &FlatNode,
    input: &FlatInput,
    by_handle: &BTreeMap<String, &FlatNode>,
    mapped: &BTreeMap<String, StepOutputRef>,
    config: &RunConfig,
) -> Result<StepInputSource, CompileError> {
    let to_ref = |r: &FlatOutput| StepOutputRef::new(step_key_of(&r.handle, mapped), r.output.clone());

    if let FlatSource::Upstream(refs) = &input.source {
        if let [r] = refs.as_slice() {
            if input.def.is_dynamic_collect {
                return Ok(StepInputSource::Collect { upstream: to_ref(r) });
            }
            if output_def(by_handle, r).is_some_and(|o| o.is_dynamic) {
                return Ok(StepInputSource::FromPendingDynamic { upstream: to_ref(r) });
            }
            if mapped.contains_key(&r.handle.to_string()) {
                return Ok(StepInputSource::FromUnresolvedStepOutput { upstream: to_ref(r) });
            }
            return Ok(StepInputSource::FromStepOutput { upstream: to_ref(r) });
        }
        return Ok(StepInputSource::FromMultipleSources {
            upstream: refs.iter().map(to_ref).collect(),
        });
    }

    if let Some(value) = config
        .node(&node.handle.to_string())
        .and_then(|c| c.inputs.get(&input.def.name))
    {
        return Ok(StepInputSource::FromConfig {
            value: value.clone(),
        });
    }

    match &input.source {
        FlatSource::Inherited(value, LiteralOrigin::Config) => {
            return Ok(StepInputSource::FromConfig {
                value: value.clone(),
            });
        }
        FlatSource::Inherited(value, LiteralOrigin::Default) => {
            return Ok(StepInputSource::FromDefault {
                value: value.clone(),
            });
        }
        _ => {}
    }

    if let Some(value) = &input.def.default {
        return Ok(StepInputSource::FromDefault {
            value: value.clone(),
        });
    }
    if input.def.is_nothing() {
        return Ok(StepInputSource::NoValue);
    }

    Err(CompileError::UnsatisfiedInput {
        handle: node.handle.to_string(),
        input: input.def.name.clone(),
    })
}
