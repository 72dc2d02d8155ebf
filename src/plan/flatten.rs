// src/plan/flatten.rs

//! Inline composites into one flat list of plain nodes, resolving every
//! boundary reference to the real interior producer.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::Value;

use crate::config::RunConfig;
use crate::errors::CompileError;
use crate::graph::{Definition, GraphDefinition, InputDefinition, NodeDefinition, NodeHandle};

/// A plain output after flattening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FlatOutput {
    pub handle: NodeHandle,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum LiteralOrigin {
    Config,
    Default,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FlatSource {
    Upstream(Vec<FlatOutput>),
    /// Value handed down through a composite input.
    Inherited(Value, LiteralOrigin),
    Unconnected,
}

#[derive(Debug, Clone)]
pub(crate) struct FlatInput {
    pub def: InputDefinition,
    pub source: FlatSource,
}

#[derive(Debug, Clone)]
pub(crate) struct FlatNode {
    pub handle: NodeHandle,
    pub definition: Arc<NodeDefinition>,
    pub inputs: Vec<FlatInput>,
}

#[derive(Debug, Default)]
pub(crate) struct FlatGraph {
    pub nodes: Vec<FlatNode>,
    /// Handles of every composite instance (valid targets for run config).
    pub composites: BTreeMap<String, Vec<String>>,
}

impl FlatGraph {
    pub fn node(&self, handle: &NodeHandle) -> Option<&FlatNode> {
        self.nodes.iter().find(|n| &n.handle == handle)
    }

    pub fn handles(&self) -> BTreeSet<String> {
        self.nodes.iter().map(|n| n.handle.to_string()).collect()
    }
}

type Boundary = BTreeMap<(String, String), FlatSource>;

pub(crate) fn flatten(graph: &GraphDefinition, config: &RunConfig) -> Result<FlatGraph, CompileError> {
    let mut flat = FlatGraph::default();
    flatten_scope(graph, None, &Boundary::new(), config, &mut flat)?;
    Ok(flat)
}

fn flatten_scope(
    graph: &GraphDefinition,
    parent: Option<&NodeHandle>,
    boundary: &Boundary,
    config: &RunConfig,
    flat: &mut FlatGraph,
) -> Result<(), CompileError> {
    for invocation in graph.nodes() {
        let handle = NodeHandle::new(&invocation.name, parent);

        match &invocation.definition {
            Definition::Node(def) => {
                let inputs = def
                    .inputs()
                    .iter()
                    .map(|input| {
                        let source = scope_source(graph, parent, &invocation.name, input, boundary)?;
                        Ok(FlatInput {
                            def: input.clone(),
                            source,
                        })
                    })
                    .collect::<Result<Vec<_>, CompileError>>()?;

                flat.nodes.push(FlatNode {
                    handle,
                    definition: Arc::clone(def),
                    inputs,
                });
            }
            Definition::Composite(composite) => {
                let mut resolved_inputs = BTreeMap::new();
                for input in composite.inputs() {
                    let mut source = scope_source(graph, parent, &invocation.name, input, boundary)?;
                    if source == FlatSource::Unconnected {
                        source = inherited_literal(config, &handle, input);
                    }
                    resolved_inputs.insert(input.name.clone(), source);
                }

                let mut interior_boundary = Boundary::new();
                for mapping in composite.input_mappings() {
                    if let Some(source) = resolved_inputs.get(&mapping.composite_input) {
                        interior_boundary
                            .insert((mapping.node.clone(), mapping.input.clone()), source.clone());
                    }
                }

                flat.composites.insert(
                    handle.to_string(),
                    composite.inputs().iter().map(|i| i.name.clone()).collect(),
                );
                flatten_scope(composite.graph(), Some(&handle), &interior_boundary, config, flat)?;
            }
        }
    }
    Ok(())
}

/// Source of `node.input` as seen from inside one scope: wired edges first,
/// then whatever the enclosing composite passes through.
fn scope_source(
    graph: &GraphDefinition,
    parent: Option<&NodeHandle>,
    node: &str,
    input: &InputDefinition,
    boundary: &Boundary,
) -> Result<FlatSource, CompileError> {
    let upstream = graph.upstream_of(node, &input.name);
    if !upstream.is_empty() {
        let resolved = upstream
            .iter()
            .map(|u| {
                resolve_output(graph, parent, &u.node, &u.output).ok_or_else(|| {
                    CompileError::UnsatisfiedInput {
                        handle: NodeHandle::new(node, parent).to_string(),
                        input: input.name.clone(),
                    }
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(FlatSource::Upstream(resolved));
    }

    Ok(boundary
        .get(&(node.to_string(), input.name.clone()))
        .cloned()
        .unwrap_or(FlatSource::Unconnected))
}

fn inherited_literal(config: &RunConfig, handle: &NodeHandle, input: &InputDefinition) -> FlatSource {
    if let Some(value) = config
        .node(&handle.to_string())
        .and_then(|n| n.inputs.get(&input.name))
    {
        return FlatSource::Inherited(value.clone(), LiteralOrigin::Config);
    }
    match &input.default {
        Some(value) => FlatSource::Inherited(value.clone(), LiteralOrigin::Default),
        None => FlatSource::Unconnected,
    }
}

/// Follow composite output mappings down to the plain node that actually
/// produces `node.output`.
fn resolve_output(
    graph: &GraphDefinition,
    parent: Option<&NodeHandle>,
    node: &str,
    output: &str,
) -> Option<FlatOutput> {
    let handle = NodeHandle::new(node, parent);
    match graph.definition_of(node)? {
        Definition::Node(_) => Some(FlatOutput {
            handle,
            output: output.to_string(),
        }),
        Definition::Composite(composite) => {
            let mapping = composite.output_mapping(output)?;
            resolve_output(composite.graph(), Some(&handle), &mapping.node, &mapping.output)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::ComputeOutput;
    use crate::graph::{CompositeDefinition, OutputDefinition};
    use serde_json::json;

    fn node(name: &str, inputs: &[&str], outputs: &[&str]) -> Arc<NodeDefinition> {
        let mut b = NodeDefinition::builder(name)
            .compute_fn(|_ctx| async { Ok(ComputeOutput::new()) });
        for i in inputs {
            b = b.input(InputDefinition::any(*i));
        }
        for o in outputs {
            b = b.output(OutputDefinition::any(*o));
        }
        b.build().unwrap()
    }

    #[test]
    fn composite_boundaries_resolve_to_interior_ports() {
        let interior = GraphDefinition::builder("inner")
            .node(node("first", &["x"], &["out"]))
            .node(node("second", &["x"], &["out"]))
            .edge(("first", "out"), ("second", "x"))
            .build()
            .unwrap();
        let composite = CompositeDefinition::builder("wrap", interior)
            .input(InputDefinition::any("in"))
            .output(OutputDefinition::any("result"))
            .map_input("in", ("first", "x"))
            .map_output("result", ("second", "out"))
            .build()
            .unwrap();

        let top = GraphDefinition::builder("top")
            .node(node("src", &[], &["out"]))
            .node(composite)
            .node(node("sink", &["x"], &[]))
            .edge(("src", "out"), ("wrap", "in"))
            .edge(("wrap", "result"), ("sink", "x"))
            .build()
            .unwrap();

        let flat = flatten(&top, &RunConfig::default()).unwrap();
        let handles: Vec<String> = flat.nodes.iter().map(|n| n.handle.to_string()).collect();
        assert_eq!(handles, vec!["src", "wrap.first", "wrap.second", "sink"]);

        let first = flat.node(&NodeHandle::root("wrap").child("first")).unwrap();
        assert_eq!(
            first.inputs[0].source,
            FlatSource::Upstream(vec![FlatOutput {
                handle: NodeHandle::root("src"),
                output: "out".to_string()
            }])
        );

        let sink = flat.node(&NodeHandle::root("sink")).unwrap();
        assert_eq!(
            sink.inputs[0].source,
            FlatSource::Upstream(vec![FlatOutput {
                handle: NodeHandle::root("wrap").child("second"),
                output: "out".to_string()
            }])
        );
        assert!(flat.composites.contains_key("wrap"));
    }

    #[test]
    fn unconnected_composite_input_takes_config_then_default() {
        let interior = GraphDefinition::builder("inner")
            .node(node("leaf", &["x"], &[]))
            .build()
            .unwrap();
        let composite = CompositeDefinition::builder("wrap", interior)
            .input(InputDefinition::any("in").with_default(json!(1)))
            .map_input("in", ("leaf", "x"))
            .build()
            .unwrap();
        let top = GraphDefinition::builder("top").node(composite).build().unwrap();

        let flat = flatten(&top, &RunConfig::default()).unwrap();
        assert_eq!(
            flat.nodes[0].inputs[0].source,
            FlatSource::Inherited(json!(1), LiteralOrigin::Default)
        );

        let cfg = RunConfig::default().with_node_input("wrap", "in", json!(7));
        let flat = flatten(&top, &cfg).unwrap();
        assert_eq!(
            flat.nodes[0].inputs[0].source,
            FlatSource::Inherited(json!(7), LiteralOrigin::Config)
        );
    }
}
