// src/graph/composite.rs

//! Composite definitions: a nested graph exposed through its own ports.

use std::sync::Arc;

use crate::errors::DefinitionError;
use crate::graph::definition::{InputDefinition, OutputDefinition, ensure_unique};
use crate::graph::graph::GraphDefinition;

/// Routes a composite input to one interior input. A composite input may
/// have several of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputMapping {
    pub composite_input: String,
    pub node: String,
    pub input: String,
}

/// Routes one interior output out through a composite output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputMapping {
    pub composite_output: String,
    pub node: String,
    pub output: String,
}

#[derive(Debug, Clone)]
pub struct CompositeDefinition {
    name: String,
    inputs: Vec<InputDefinition>,
    outputs: Vec<OutputDefinition>,
    graph: GraphDefinition,
    input_mappings: Vec<InputMapping>,
    output_mappings: Vec<OutputMapping>,
}

impl CompositeDefinition {
    pub fn builder(name: impl Into<String>, graph: GraphDefinition) -> CompositeBuilder {
        CompositeBuilder {
            name: name.into(),
            graph,
            inputs: Vec::new(),
            outputs: Vec::new(),
            input_mappings: Vec::new(),
            output_mappings: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inputs(&self) -> &[InputDefinition] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[OutputDefinition] {
        &self.outputs
    }

    pub fn graph(&self) -> &GraphDefinition {
        &self.graph
    }

    pub fn input_mappings(&self) -> &[InputMapping] {
        &self.input_mappings
    }

    pub fn output_mappings(&self) -> &[OutputMapping] {
        &self.output_mappings
    }

    /// The composite input feeding interior `node.input`, if any.
    pub fn input_mapping_for(&self, node: &str, input: &str) -> Option<&InputMapping> {
        self.input_mappings
            .iter()
            .find(|m| m.node == node && m.input == input)
    }

    pub fn output_mapping(&self, composite_output: &str) -> Option<&OutputMapping> {
        self.output_mappings
            .iter()
            .find(|m| m.composite_output == composite_output)
    }
}

pub struct CompositeBuilder {
    name: String,
    graph: GraphDefinition,
    inputs: Vec<InputDefinition>,
    outputs: Vec<OutputDefinition>,
    input_mappings: Vec<InputMapping>,
    output_mappings: Vec<OutputMapping>,
}

impl CompositeBuilder {
    pub fn input(mut self, input: InputDefinition) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn output(mut self, output: OutputDefinition) -> Self {
        self.outputs.push(output);
        self
    }

    /// Route composite input `composite_input` to interior `(node, input)`.
    pub fn map_input(mut self, composite_input: &str, to: (&str, &str)) -> Self {
        self.input_mappings.push(InputMapping {
            composite_input: composite_input.to_string(),
            node: to.0.to_string(),
            input: to.1.to_string(),
        });
        self
    }

    /// Expose interior `(node, output)` as composite output `composite_output`.
    pub fn map_output(mut self, composite_output: &str, from: (&str, &str)) -> Self {
        self.output_mappings.push(OutputMapping {
            composite_output: composite_output.to_string(),
            node: from.0.to_string(),
            output: from.1.to_string(),
        });
        self
    }

    pub fn build(self) -> Result<Arc<CompositeDefinition>, DefinitionError> {
        let scope = format!("composite '{}'", self.name);
        ensure_unique(self.inputs.iter().map(|i| i.name.as_str()), "input", &scope)?;
        ensure_unique(self.outputs.iter().map(|o| o.name.as_str()), "output", &scope)?;

        let invalid = |message: String| DefinitionError::InvalidMapping {
            composite: self.name.clone(),
            message,
        };

        for m in &self.input_mappings {
            if !self.inputs.iter().any(|i| i.name == m.composite_input) {
                return Err(invalid(format!("unknown composite input '{}'", m.composite_input)));
            }
            let interior = self
                .graph
                .definition_of(&m.node)
                .ok_or_else(|| invalid(format!("unknown interior node '{}'", m.node)))?;
            if interior.input(&m.input).is_none() {
                return Err(invalid(format!("interior node '{}' has no input '{}'", m.node, m.input)));
            }
            if !self.graph.upstream_of(&m.node, &m.input).is_empty() {
                return Err(invalid(format!(
                    "interior input '{}.{}' is both mapped and wired inside the composite",
                    m.node, m.input
                )));
            }
            let duplicates = self
                .input_mappings
                .iter()
                .filter(|o| o.node == m.node && o.input == m.input)
                .count();
            if duplicates > 1 {
                return Err(invalid(format!(
                    "interior input '{}.{}' is mapped more than once",
                    m.node, m.input
                )));
            }
        }

        for output in &self.outputs {
            let mappings: Vec<_> = self
                .output_mappings
                .iter()
                .filter(|m| m.composite_output == output.name)
                .collect();
            let [mapping] = mappings.as_slice() else {
                return Err(invalid(format!(
                    "composite output '{}' must map exactly one interior output (got {})",
                    output.name,
                    mappings.len()
                )));
            };
            let interior = self
                .graph
                .definition_of(&mapping.node)
                .ok_or_else(|| invalid(format!("unknown interior node '{}'", mapping.node)))?;
            let interior_output = interior.output(&mapping.output).ok_or_else(|| {
                invalid(format!(
                    "interior node '{}' has no output '{}'",
                    mapping.node, mapping.output
                ))
            })?;
            if interior_output.is_dynamic != output.is_dynamic {
                return Err(invalid(format!(
                    "composite output '{}' and interior output '{}.{}' disagree on being dynamic",
                    output.name, mapping.node, mapping.output
                )));
            }
        }

        if let Some(m) = self
            .output_mappings
            .iter()
            .find(|m| !self.outputs.iter().any(|o| o.name == m.composite_output))
        {
            return Err(invalid(format!("unknown composite output '{}'", m.composite_output)));
        }

        Ok(Arc::new(CompositeDefinition {
            name: self.name,
            inputs: self.inputs,
            outputs: self.outputs,
            graph: self.graph,
            input_mappings: self.input_mappings,
            output_mappings: self.output_mappings,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::ComputeOutput;
    use crate::graph::definition::NodeDefinition;

    fn interior() -> GraphDefinition {
        let inner = NodeDefinition::builder("inner")
            .input(InputDefinition::any("x"))
            .output(OutputDefinition::any("out"))
            .compute_fn(|_ctx| async { Ok(ComputeOutput::new()) })
            .build()
            .unwrap();
        GraphDefinition::builder("interior").node(inner).build().unwrap()
    }

    #[test]
    fn valid_mappings_build() {
        let composite = CompositeDefinition::builder("wrap", interior())
            .input(InputDefinition::any("in"))
            .output(OutputDefinition::any("result"))
            .map_input("in", ("inner", "x"))
            .map_output("result", ("inner", "out"))
            .build()
            .unwrap();

        assert_eq!(
            composite.input_mapping_for("inner", "x").map(|m| m.composite_input.as_str()),
            Some("in")
        );
        assert_eq!(
            composite.output_mapping("result").map(|m| m.node.as_str()),
            Some("inner")
        );
    }

    #[test]
    fn unmapped_output_is_rejected() {
        let err = CompositeDefinition::builder("wrap", interior())
            .output(OutputDefinition::any("result"))
            .build()
            .unwrap_err();
        assert!(matches!(err, DefinitionError::InvalidMapping { .. }));
    }

    #[test]
    fn mapping_to_unknown_interior_port_is_rejected() {
        let err = CompositeDefinition::builder("wrap", interior())
            .input(InputDefinition::any("in"))
            .map_input("in", ("inner", "nope"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("no input 'nope'"));
    }
}
