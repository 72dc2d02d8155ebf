// src/graph/dependency.rs

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// `(node, input)` port reference within one scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeInput {
    pub node: String,
    pub input: String,
}

impl NodeInput {
    pub fn new(node: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            input: input.into(),
        }
    }
}

impl fmt::Display for NodeInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node, self.input)
    }
}

/// `(node, output)` port reference within one scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeOutput {
    pub node: String,
    pub output: String,
}

impl NodeOutput {
    pub fn new(node: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            output: output.into(),
        }
    }
}

impl fmt::Display for NodeOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node, self.output)
    }
}

/// Edges of a single scope: every wired input and the upstream outputs that
/// feed it. More than one upstream output on an input is a fan-in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyStructure {
    deps: BTreeMap<NodeInput, Vec<NodeOutput>>,
}

impl DependencyStructure {
    pub(crate) fn add(&mut self, from: NodeOutput, to: NodeInput) {
        let upstream = self.deps.entry(to).or_default();
        if !upstream.contains(&from) {
            upstream.push(from);
        }
    }

    /// Upstream outputs wired into `node.input`, in declaration order.
    pub fn upstream_of(&self, node: &str, input: &str) -> &[NodeOutput] {
        self.deps
            .get(&NodeInput::new(node, input))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Inputs fed by `node.output`.
    pub fn downstream_of(&self, node: &str, output: &str) -> Vec<NodeInput> {
        self.deps
            .iter()
            .filter(|(_, ups)| ups.iter().any(|u| u.node == node && u.output == output))
            .map(|(input, _)| input.clone())
            .collect()
    }

    /// Names of all nodes directly upstream of `node`.
    pub fn upstream_nodes(&self, node: &str) -> BTreeSet<&str> {
        self.deps
            .iter()
            .filter(|(input, _)| input.node == node)
            .flat_map(|(_, ups)| ups.iter().map(|u| u.node.as_str()))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeInput, &[NodeOutput])> {
        self.deps.iter().map(|(k, v)| (k, v.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }
}
