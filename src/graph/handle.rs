// src/graph/handle.rs

use std::fmt;

use serde::{Deserialize, Serialize};

/// Path-qualified identifier of a node instance after composites are
/// flattened, e.g. `etl.load.write` for node `write` inside composite `load`
/// inside composite `etl`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeHandle {
    path: Vec<String>,
}

impl NodeHandle {
    pub fn new(name: impl Into<String>, parent: Option<&NodeHandle>) -> Self {
        let mut path = parent.map(|p| p.path.clone()).unwrap_or_default();
        path.push(name.into());
        Self { path }
    }

    pub fn root(name: impl Into<String>) -> Self {
        Self::new(name, None)
    }

    /// Handle of a node nested directly inside this one.
    pub fn child(&self, name: impl Into<String>) -> Self {
        Self::new(name, Some(self))
    }

    /// Name of the node itself (last path segment).
    pub fn name(&self) -> &str {
        self.path.last().map(|s| s.as_str()).unwrap_or("")
    }

    pub fn parent(&self) -> Option<NodeHandle> {
        if self.path.len() <= 1 {
            return None;
        }
        Some(Self {
            path: self.path[..self.path.len() - 1].to_vec(),
        })
    }

    pub fn depth(&self) -> usize {
        self.path.len()
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.path.iter().map(|s| s.as_str())
    }

    /// Parse a dotted handle string. Returns `None` for empty segments.
    pub fn parse(s: &str) -> Option<Self> {
        let path: Vec<String> = s.split('.').map(|p| p.to_string()).collect();
        if path.iter().any(|p| p.is_empty()) {
            return None;
        }
        Some(Self { path })
    }
}

impl fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.join("."))
    }
}
