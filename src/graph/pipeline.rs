// src/graph/pipeline.rs

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::graph::graph::GraphDefinition;
use crate::graph::types::{TypeCompatibility, TypeRegistry};
use crate::resources::ModeDefinition;

pub const DEFAULT_MODE: &str = "default";

/// A top-level graph plus the modes (resource bundles) it can run under.
#[derive(Debug, Clone)]
pub struct Pipeline {
    graph: GraphDefinition,
    modes: BTreeMap<String, ModeDefinition>,
    types: Arc<dyn TypeCompatibility>,
}

impl Pipeline {
    /// Pipeline with an empty `default` mode and the default type registry.
    pub fn new(graph: GraphDefinition) -> Self {
        let mut modes = BTreeMap::new();
        modes.insert(DEFAULT_MODE.to_string(), ModeDefinition::new(DEFAULT_MODE));
        Self {
            graph,
            modes,
            types: Arc::new(TypeRegistry::default()),
        }
    }

    /// Add or replace a mode.
    pub fn with_mode(mut self, mode: ModeDefinition) -> Self {
        self.modes.insert(mode.name().to_string(), mode);
        self
    }

    pub fn with_type_compatibility(mut self, types: impl TypeCompatibility + 'static) -> Self {
        self.types = Arc::new(types);
        self
    }

    pub fn name(&self) -> &str {
        self.graph.name()
    }

    pub fn graph(&self) -> &GraphDefinition {
        &self.graph
    }

    pub fn mode(&self, name: &str) -> Option<&ModeDefinition> {
        self.modes.get(name)
    }

    pub fn modes(&self) -> impl Iterator<Item = &ModeDefinition> {
        self.modes.values()
    }

    pub fn type_compatibility(&self) -> &dyn TypeCompatibility {
        self.types.as_ref()
    }
}
