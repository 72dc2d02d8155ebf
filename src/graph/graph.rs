// src/graph/graph.rs

use std::collections::BTreeMap;

use crate::errors::DefinitionError;
use crate::graph::definition::{Definition, ensure_unique};
use crate::graph::dependency::{DependencyStructure, NodeInput, NodeOutput};

/// One use of a definition inside a graph, under a scope-unique name.
#[derive(Debug, Clone)]
pub struct NodeInvocation {
    pub name: String,
    pub definition: Definition,
}

/// A validated scope: node invocations plus the edges between them.
///
/// Immutable after [`GraphBuilder::build`]; shared read-only by every run.
#[derive(Debug, Clone)]
pub struct GraphDefinition {
    name: String,
    nodes: BTreeMap<String, NodeInvocation>,
    order: Vec<String>,
    dependencies: DependencyStructure,
}

impl GraphDefinition {
    pub fn builder(name: impl Into<String>) -> GraphBuilder {
        GraphBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Node invocations in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeInvocation> {
        self.order.iter().filter_map(|n| self.nodes.get(n))
    }

    pub fn node(&self, name: &str) -> Option<&NodeInvocation> {
        self.nodes.get(name)
    }

    pub fn definition_of(&self, name: &str) -> Option<&Definition> {
        self.nodes.get(name).map(|n| &n.definition)
    }

    /// Interior graph of a composite invocation.
    pub fn composite_interior(&self, name: &str) -> Option<&GraphDefinition> {
        self.definition_of(name)
            .and_then(|d| d.as_composite())
            .map(|c| c.graph())
    }

    pub fn dependencies(&self) -> &DependencyStructure {
        &self.dependencies
    }

    pub fn upstream_of(&self, node: &str, input: &str) -> &[NodeOutput] {
        self.dependencies.upstream_of(node, input)
    }

    pub fn downstream_of(&self, node: &str, output: &str) -> Vec<NodeInput> {
        self.dependencies.downstream_of(node, output)
    }

    /// Number of plain (non-composite) nodes once every composite is inlined.
    pub fn flattened_node_count(&self) -> usize {
        self.nodes()
            .map(|n| match &n.definition {
                Definition::Node(_) => 1,
                Definition::Composite(c) => c.graph().flattened_node_count(),
            })
            .sum()
    }
}

pub struct GraphBuilder {
    name: String,
    nodes: Vec<NodeInvocation>,
    edges: Vec<(NodeOutput, NodeInput)>,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    /// Invoke a definition under its own name.
    pub fn node(self, definition: impl Into<Definition>) -> Self {
        let definition = definition.into();
        let name = definition.name().to_string();
        self.node_as(name, definition)
    }

    /// Invoke a definition under an alias, so one definition can appear
    /// several times in a scope.
    pub fn node_as(mut self, alias: impl Into<String>, definition: impl Into<Definition>) -> Self {
        self.nodes.push(NodeInvocation {
            name: alias.into(),
            definition: definition.into(),
        });
        self
    }

    /// Wire `(node, output)` into `(node, input)`.
    pub fn edge(mut self, from: (&str, &str), to: (&str, &str)) -> Self {
        self.edges
            .push((NodeOutput::new(from.0, from.1), NodeInput::new(to.0, to.1)));
        self
    }

    pub fn build(self) -> Result<GraphDefinition, DefinitionError> {
        let scope = format!("graph '{}'", self.name);
        ensure_unique(self.nodes.iter().map(|n| n.name.as_str()), "node", &scope)?;

        let order: Vec<String> = self.nodes.iter().map(|n| n.name.clone()).collect();
        let nodes: BTreeMap<String, NodeInvocation> = self
            .nodes
            .into_iter()
            .map(|n| (n.name.clone(), n))
            .collect();

        let mut dependencies = DependencyStructure::default();
        for (from, to) in self.edges {
            check_edge(&scope, &nodes, &from, &to)?;
            dependencies.add(from, to);
        }

        check_fan_ins(&scope, &nodes, &dependencies)?;

        Ok(GraphDefinition {
            name: self.name,
            nodes,
            order,
            dependencies,
        })
    }
}

fn check_edge(
    scope: &str,
    nodes: &BTreeMap<String, NodeInvocation>,
    from: &NodeOutput,
    to: &NodeInput,
) -> Result<(), DefinitionError> {
    let producer = nodes.get(&from.node).ok_or_else(|| DefinitionError::UnknownNode {
        scope: scope.to_string(),
        node: from.node.clone(),
    })?;
    let consumer = nodes.get(&to.node).ok_or_else(|| DefinitionError::UnknownNode {
        scope: scope.to_string(),
        node: to.node.clone(),
    })?;

    if producer.definition.output(&from.output).is_none() {
        return Err(DefinitionError::UnknownPort {
            scope: scope.to_string(),
            node: from.node.clone(),
            kind: "output",
            port: from.output.clone(),
        });
    }
    if consumer.definition.input(&to.input).is_none() {
        return Err(DefinitionError::UnknownPort {
            scope: scope.to_string(),
            node: to.node.clone(),
            kind: "input",
            port: to.input.clone(),
        });
    }
    if from.node == to.node {
        return Err(DefinitionError::SelfLoop {
            scope: scope.to_string(),
            node: to.node.clone(),
        });
    }
    Ok(())
}

fn check_fan_ins(
    scope: &str,
    nodes: &BTreeMap<String, NodeInvocation>,
    dependencies: &DependencyStructure,
) -> Result<(), DefinitionError> {
    for (input, upstream) in dependencies.iter() {
        let Some(def) = nodes
            .get(&input.node)
            .and_then(|n| n.definition.input(&input.input))
        else {
            continue;
        };

        if def.is_dynamic_collect {
            if upstream.len() != 1 {
                return Err(DefinitionError::InvalidCollect {
                    scope: scope.to_string(),
                    node: input.node.clone(),
                    input: input.input.clone(),
                    count: upstream.len(),
                });
            }
            continue;
        }

        if upstream.len() > 1 {
            let dynamic = upstream.iter().find(|u| {
                nodes
                    .get(&u.node)
                    .and_then(|n| n.definition.output(&u.output))
                    .is_some_and(|o| o.is_dynamic)
            });
            if let Some(dynamic) = dynamic {
                return Err(DefinitionError::DynamicInFanIn {
                    scope: scope.to_string(),
                    node: input.node.clone(),
                    input: input.input.clone(),
                    upstream: dynamic.to_string(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::ComputeOutput;
    use crate::graph::definition::{InputDefinition, NodeDefinition, OutputDefinition};
    use std::sync::Arc;

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
    fn builds_and_traverses_a_linear_graph() {
        let graph = GraphDefinition::builder("g")
            .node(node("a", &[], &["out"]))
            .node(node("b", &["x"], &["out"]))
            .edge(("a", "out"), ("b", "x"))
            .build()
            .unwrap();

        let names: Vec<_> = graph.nodes().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(graph.upstream_of("b", "x"), &[NodeOutput::new("a", "out")]);
        assert_eq!(graph.downstream_of("a", "out"), vec![NodeInput::new("b", "x")]);
        assert!(graph.composite_interior("a").is_none());
        assert_eq!(graph.flattened_node_count(), 2);
    }

    #[test]
    fn rejects_duplicate_names_dangling_refs_and_self_loops() {
        let dup = GraphDefinition::builder("g")
            .node(node("a", &[], &["out"]))
            .node(node("a", &[], &["out"]))
            .build()
            .unwrap_err();
        assert!(matches!(dup, DefinitionError::DuplicateName { kind: "node", .. }));

        let dangling = GraphDefinition::builder("g")
            .node(node("b", &["x"], &[]))
            .edge(("ghost", "out"), ("b", "x"))
            .build()
            .unwrap_err();
        assert!(matches!(dangling, DefinitionError::UnknownNode { ref node, .. } if node == "ghost"));

        let bad_port = GraphDefinition::builder("g")
            .node(node("a", &[], &["out"]))
            .node(node("b", &["x"], &[]))
            .edge(("a", "nope"), ("b", "x"))
            .build()
            .unwrap_err();
        assert!(matches!(bad_port, DefinitionError::UnknownPort { kind: "output", .. }));

        let self_loop = GraphDefinition::builder("g")
            .node(node("a", &["x"], &["out"]))
            .edge(("a", "out"), ("a", "x"))
            .build()
            .unwrap_err();
        assert!(matches!(self_loop, DefinitionError::SelfLoop { .. }));
    }

    #[test]
    fn collect_inputs_need_exactly_one_upstream() {
        let source = NodeDefinition::builder("src")
            .output(OutputDefinition::any("items").dynamic())
            .compute_fn(|_ctx| async { Ok(ComputeOutput::new()) })
            .build()
            .unwrap();
        let sink = NodeDefinition::builder("sink")
            .input(InputDefinition::new("all", "List[Any]").collect())
            .compute_fn(|_ctx| async { Ok(ComputeOutput::new()) })
            .build()
            .unwrap();

        let err = GraphDefinition::builder("g")
            .node_as("s1", source.clone())
            .node_as("s2", source)
            .node(sink)
            .edge(("s1", "items"), ("sink", "all"))
            .edge(("s2", "items"), ("sink", "all"))
            .build()
            .unwrap_err();
        assert!(matches!(err, DefinitionError::InvalidCollect { count: 2, .. }));
    }

    #[test]
    fn plain_fan_in_of_a_dynamic_output_is_rejected() {
        let source = NodeDefinition::builder("src")
            .output(OutputDefinition::any("items").dynamic())
            .compute_fn(|_ctx| async { Ok(ComputeOutput::new()) })
            .build()
            .unwrap();

        let err = GraphDefinition::builder("g")
            .node(source)
            .node(node("plain", &[], &["out"]))
            .node(node("sink", &["x"], &[]))
            .edge(("src", "items"), ("sink", "x"))
            .edge(("plain", "out"), ("sink", "x"))
            .build()
            .unwrap_err();
        assert!(matches!(err, DefinitionError::DynamicInFanIn { .. }));
    }
}
