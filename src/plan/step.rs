// src/plan/step.rs

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::graph::{NodeDefinition, NodeHandle, OutputDefinition};
use crate::scheduler::RetryPolicy;

const UNRESOLVED_SUFFIX: &str = "[?]";

/// Identifier of a step within a run: the handle string, optionally with a
/// `[mapping_key]` suffix for dynamic instances or `[?]` for placeholders.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepKey(String);

impl StepKey {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn for_handle(handle: &NodeHandle) -> Self {
        Self(handle.to_string())
    }

    pub fn unresolved(handle: &NodeHandle) -> Self {
        Self(format!("{handle}{UNRESOLVED_SUFFIX}"))
    }

    pub fn mapped(handle: &NodeHandle, mapping_key: &str) -> Self {
        Self(format!("{handle}[{mapping_key}]"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The handle part, without any bracketed suffix.
    pub fn handle_str(&self) -> &str {
        match self.0.find('[') {
            Some(idx) => &self.0[..idx],
            None => &self.0,
        }
    }

    pub fn is_unresolved(&self) -> bool {
        self.0.ends_with(UNRESOLVED_SUFFIX)
    }

    pub fn mapping_key(&self) -> Option<&str> {
        if self.is_unresolved() {
            return None;
        }
        let start = self.0.find('[')?;
        self.0[start + 1..].strip_suffix(']')
    }

    /// `h[?]` for a mapped instance key `h[k]`.
    pub fn unresolved_form(&self) -> Option<Self> {
        self.mapping_key()
            .map(|_| Self(format!("{}{UNRESOLVED_SUFFIX}", self.handle_str())))
    }

    /// Same handle with a concrete mapping key.
    pub fn with_mapping_key(&self, mapping_key: &str) -> Self {
        Self(format!("{}[{mapping_key}]", self.handle_str()))
    }
}

impl fmt::Display for StepKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StepKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Reference to one output of one step, optionally narrowed to a single
/// dynamic item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepOutputRef {
    pub step_key: StepKey,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping_key: Option<String>,
}

impl StepOutputRef {
    pub fn new(step_key: StepKey, output: impl Into<String>) -> Self {
        Self {
            step_key,
            output: output.into(),
            mapping_key: None,
        }
    }

    pub fn with_mapping_key(mut self, mapping_key: impl Into<String>) -> Self {
        self.mapping_key = Some(mapping_key.into());
        self
    }
}

impl fmt::Display for StepOutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.step_key, self.output)?;
        if let Some(key) = &self.mapping_key {
            write!(f, "[{key}]")?;
        }
        Ok(())
    }
}

/// Where a step input gets its value from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepInputSource {
    FromStepOutput { upstream: StepOutputRef },
    /// Plain fan-in; the input receives a list.
    FromMultipleSources { upstream: Vec<StepOutputRef> },
    /// Placeholder input fed one item at a time by a dynamic output.
    FromPendingDynamic { upstream: StepOutputRef },
    /// Placeholder input fed by another placeholder's output.
    FromUnresolvedStepOutput { upstream: StepOutputRef },
    /// Barrier over every item of a dynamic output (or every instance of a
    /// placeholder); the input receives a list.
    Collect { upstream: StepOutputRef },
    FromConfig { value: Value },
    FromDefault { value: Value },
    /// Ordering-only input with nothing wired in.
    NoValue,
}

impl StepInputSource {
    pub fn upstream_refs(&self) -> Vec<&StepOutputRef> {
        match self {
            StepInputSource::FromStepOutput { upstream }
            | StepInputSource::FromPendingDynamic { upstream }
            | StepInputSource::FromUnresolvedStepOutput { upstream }
            | StepInputSource::Collect { upstream } => vec![upstream],
            StepInputSource::FromMultipleSources { upstream } => upstream.iter().collect(),
            StepInputSource::FromConfig { .. }
            | StepInputSource::FromDefault { .. }
            | StepInputSource::NoValue => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepInput {
    pub name: String,
    pub type_name: String,
    pub source: StepInputSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    Compute,
    /// Placeholder waiting for `resolved_by` to report its items.
    Unresolved { resolved_by: StepOutputRef },
    /// One instance materialized from a placeholder.
    Mapped {
        mapping_key: String,
        resolved_by: StepOutputRef,
    },
}

/// A compiled, schedulable unit.
#[derive(Debug, Clone)]
pub struct ExecutionStep {
    pub key: StepKey,
    pub handle: NodeHandle,
    pub kind: StepKind,
    pub inputs: Vec<StepInput>,
    pub outputs: Vec<OutputDefinition>,
    pub required_resource_keys: BTreeSet<String>,
    pub retry_policy: Option<RetryPolicy>,
    /// Node config after schema validation.
    pub config: Value,
    pub tags: BTreeMap<String, String>,
    pub definition: Arc<NodeDefinition>,
}

impl ExecutionStep {
    pub fn upstream_keys(&self) -> BTreeSet<StepKey> {
        self.inputs
            .iter()
            .flat_map(|i| i.source.upstream_refs())
            .map(|r| r.step_key.clone())
            .collect()
    }

    pub fn is_unresolved(&self) -> bool {
        matches!(self.kind, StepKind::Unresolved { .. })
    }

    pub fn mapping_key(&self) -> Option<&str> {
        match &self.kind {
            StepKind::Mapped { mapping_key, .. } => Some(mapping_key),
            _ => None,
        }
    }

    pub fn input(&self, name: &str) -> Option<&StepInput> {
        self.inputs.iter().find(|i| i.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&OutputDefinition> {
        self.outputs.iter().find(|o| o.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_key_suffixes() {
        let handle = NodeHandle::root("etl").child("per_item");
        let placeholder = StepKey::unresolved(&handle);
        assert_eq!(placeholder.as_str(), "etl.per_item[?]");
        assert!(placeholder.is_unresolved());
        assert_eq!(placeholder.mapping_key(), None);

        let instance = placeholder.with_mapping_key("x_1");
        assert_eq!(instance, StepKey::mapped(&handle, "x_1"));
        assert_eq!(instance.mapping_key(), Some("x_1"));
        assert_eq!(instance.handle_str(), "etl.per_item");

        let plain = StepKey::for_handle(&handle);
        assert_eq!(plain.mapping_key(), None);
        assert_eq!(plain.handle_str(), "etl.per_item");
    }

    #[test]
    fn output_refs_render_with_optional_item() {
        let r = StepOutputRef::new(StepKey::new("a"), "items");
        assert_eq!(r.to_string(), "a.items");
        assert_eq!(r.with_mapping_key("x").to_string(), "a.items[x]");
    }
}
