// src/graph/definition.rs

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::errors::DefinitionError;
use crate::exec::{Compute, ComputeContext, ComputeOutput, compute_fn};
use crate::graph::composite::CompositeDefinition;
use crate::graph::types::{ANY, NOTHING};
use crate::scheduler::{RetryPolicy, StepFailure};

/// A named, typed input port.
#[derive(Debug, Clone, PartialEq)]
pub struct InputDefinition {
    pub name: String,
    pub type_name: String,
    /// Value used when nothing upstream (or in the run config) feeds the input.
    pub default: Option<Value>,
    /// Fan-in barrier over every item of a dynamic output.
    pub is_dynamic_collect: bool,
}

impl InputDefinition {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            default: None,
            is_dynamic_collect: false,
        }
    }

    /// Untyped input.
    pub fn any(name: impl Into<String>) -> Self {
        Self::new(name, ANY)
    }

    /// Ordering-only input: waits for its upstream, receives no value.
    pub fn nothing(name: impl Into<String>) -> Self {
        Self::new(name, NOTHING)
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn collect(mut self) -> Self {
        self.is_dynamic_collect = true;
        self
    }

    pub fn is_nothing(&self) -> bool {
        self.type_name == NOTHING
    }
}

/// A named, typed output port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputDefinition {
    pub name: String,
    pub type_name: String,
    /// Cardinality known only at run time; each item carries a mapping key.
    pub is_dynamic: bool,
    /// A successful compute must yield this output.
    pub is_required: bool,
}

impl OutputDefinition {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            is_dynamic: false,
            is_required: true,
        }
    }

    pub fn any(name: impl Into<String>) -> Self {
        Self::new(name, ANY)
    }

    pub fn dynamic(mut self) -> Self {
        self.is_dynamic = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.is_required = false;
        self
    }
}

/// Primitive types accepted in node configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigType {
    Any,
    Bool,
    Int,
    Float,
    String,
}

impl ConfigType {
    fn accepts(self, value: &Value) -> bool {
        match self {
            ConfigType::Any => true,
            ConfigType::Bool => value.is_boolean(),
            ConfigType::Int => value.is_i64() || value.is_u64(),
            ConfigType::Float => value.is_number(),
            ConfigType::String => value.is_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigField {
    pub config_type: ConfigType,
    pub required: bool,
    pub default: Option<Value>,
}

impl ConfigField {
    pub fn required(config_type: ConfigType) -> Self {
        Self {
            config_type,
            required: true,
            default: None,
        }
    }

    pub fn optional(config_type: ConfigType) -> Self {
        Self {
            config_type,
            required: false,
            default: None,
        }
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self.required = false;
        self
    }
}

/// Shape of the per-node config accepted from the run configuration.
///
/// An empty schema is permissive: whatever the run config carries is passed
/// through unchecked.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigSchema {
    fields: BTreeMap<String, ConfigField>,
}

impl ConfigSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, field: ConfigField) -> Self {
        self.fields.insert(name.into(), field);
        self
    }

    pub fn is_permissive(&self) -> bool {
        self.fields.is_empty()
    }

    /// Check a config value against the schema and fill in defaults.
    pub fn validate(&self, value: Option<&Value>) -> Result<Value, String> {
        if self.is_permissive() {
            return Ok(value.cloned().unwrap_or(Value::Null));
        }

        let provided = match value {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(other) => return Err(format!("expected a table of fields, got {other}")),
        };

        if let Some(unknown) = provided.keys().find(|k| !self.fields.contains_key(*k)) {
            return Err(format!("unknown config field '{unknown}'"));
        }

        let mut resolved = Map::new();
        for (name, field) in &self.fields {
            match provided.get(name) {
                Some(v) if !field.config_type.accepts(v) => {
                    return Err(format!(
                        "field '{name}' expects {:?}, got {v}",
                        field.config_type
                    ));
                }
                Some(v) => {
                    resolved.insert(name.clone(), v.clone());
                }
                None => match (&field.default, field.required) {
                    (Some(default), _) => {
                        resolved.insert(name.clone(), default.clone());
                    }
                    (None, true) => return Err(format!("missing required field '{name}'")),
                    (None, false) => {}
                },
            }
        }
        Ok(Value::Object(resolved))
    }
}

/// A unit of computation: typed ports plus the compute contract invoked by
/// the executor. Built once and shared read-only across runs.
pub struct NodeDefinition {
    name: String,
    inputs: Vec<InputDefinition>,
    outputs: Vec<OutputDefinition>,
    compute: Arc<dyn Compute>,
    required_resource_keys: BTreeSet<String>,
    config_schema: ConfigSchema,
    tags: BTreeMap<String, String>,
    retry_policy: Option<RetryPolicy>,
}

impl fmt::Debug for NodeDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeDefinition")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("required_resource_keys", &self.required_resource_keys)
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}

impl NodeDefinition {
    pub fn builder(name: impl Into<String>) -> NodeDefinitionBuilder {
        NodeDefinitionBuilder::new(name)
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

    pub fn input(&self, name: &str) -> Option<&InputDefinition> {
        self.inputs.iter().find(|i| i.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&OutputDefinition> {
        self.outputs.iter().find(|o| o.name == name)
    }

    pub fn compute(&self) -> Arc<dyn Compute> {
        Arc::clone(&self.compute)
    }

    pub fn required_resource_keys(&self) -> &BTreeSet<String> {
        &self.required_resource_keys
    }

    pub fn config_schema(&self) -> &ConfigSchema {
        &self.config_schema
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.retry_policy.as_ref()
    }
}

pub struct NodeDefinitionBuilder {
    name: String,
    inputs: Vec<InputDefinition>,
    outputs: Vec<OutputDefinition>,
    compute: Option<Arc<dyn Compute>>,
    required_resource_keys: BTreeSet<String>,
    config_schema: ConfigSchema,
    tags: BTreeMap<String, String>,
    retry_policy: Option<RetryPolicy>,
}

impl NodeDefinitionBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            compute: None,
            required_resource_keys: BTreeSet::new(),
            config_schema: ConfigSchema::default(),
            tags: BTreeMap::new(),
            retry_policy: None,
        }
    }

    pub fn input(mut self, input: InputDefinition) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn output(mut self, output: OutputDefinition) -> Self {
        self.outputs.push(output);
        self
    }

    pub fn compute(mut self, compute: impl Compute + 'static) -> Self {
        self.compute = Some(Arc::new(compute));
        self
    }

    /// Use an async closure as the compute function.
    pub fn compute_fn<F, Fut>(self, f: F) -> Self
    where
        F: Fn(ComputeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ComputeOutput, StepFailure>> + Send + 'static,
    {
        self.compute(compute_fn(f))
    }

    pub fn required_resource(mut self, key: impl Into<String>) -> Self {
        self.required_resource_keys.insert(key.into());
        self
    }

    pub fn config_schema(mut self, schema: ConfigSchema) -> Self {
        self.config_schema = schema;
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn build(self) -> Result<Arc<NodeDefinition>, DefinitionError> {
        let scope = format!("node '{}'", self.name);
        ensure_unique(self.inputs.iter().map(|i| i.name.as_str()), "input", &scope)?;
        ensure_unique(self.outputs.iter().map(|o| o.name.as_str()), "output", &scope)?;

        let compute = self.compute.ok_or_else(|| DefinitionError::MissingCompute {
            node: self.name.clone(),
        })?;

        Ok(Arc::new(NodeDefinition {
            name: self.name,
            inputs: self.inputs,
            outputs: self.outputs,
            compute,
            required_resource_keys: self.required_resource_keys,
            config_schema: self.config_schema,
            tags: self.tags,
            retry_policy: self.retry_policy,
        }))
    }
}

pub(crate) fn ensure_unique<'a>(
    names: impl Iterator<Item = &'a str>,
    kind: &'static str,
    scope: &str,
) -> Result<(), DefinitionError> {
    let mut seen = BTreeSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(DefinitionError::DuplicateName {
                kind,
                name: name.to_string(),
                scope: scope.to_string(),
            });
        }
    }
    Ok(())
}

/// Anything that can be invoked inside a graph: a plain node or a composite.
#[derive(Debug, Clone)]
pub enum Definition {
    Node(Arc<NodeDefinition>),
    Composite(Arc<CompositeDefinition>),
}

impl Definition {
    pub fn name(&self) -> &str {
        match self {
            Definition::Node(n) => n.name(),
            Definition::Composite(c) => c.name(),
        }
    }

    pub fn inputs(&self) -> &[InputDefinition] {
        match self {
            Definition::Node(n) => n.inputs(),
            Definition::Composite(c) => c.inputs(),
        }
    }

    pub fn outputs(&self) -> &[OutputDefinition] {
        match self {
            Definition::Node(n) => n.outputs(),
            Definition::Composite(c) => c.outputs(),
        }
    }

    pub fn input(&self, name: &str) -> Option<&InputDefinition> {
        self.inputs().iter().find(|i| i.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&OutputDefinition> {
        self.outputs().iter().find(|o| o.name == name)
    }

    pub fn as_composite(&self) -> Option<&Arc<CompositeDefinition>> {
        match self {
            Definition::Composite(c) => Some(c),
            Definition::Node(_) => None,
        }
    }
}

impl From<Arc<NodeDefinition>> for Definition {
    fn from(node: Arc<NodeDefinition>) -> Self {
        Definition::Node(node)
    }
}

impl From<Arc<CompositeDefinition>> for Definition {
    fn from(composite: Arc<CompositeDefinition>) -> Self {
        Definition::Composite(composite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop() -> NodeDefinitionBuilder {
        NodeDefinition::builder("n").compute_fn(|_ctx| async { Ok(ComputeOutput::new()) })
    }

    #[test]
    fn duplicate_port_names_are_rejected() {
        let err = noop()
            .input(InputDefinition::any("x"))
            .input(InputDefinition::any("x"))
            .build()
            .unwrap_err();
        assert!(matches!(err, DefinitionError::DuplicateName { kind: "input", .. }));
    }

    #[test]
    fn missing_compute_is_rejected() {
        let err = NodeDefinition::builder("n").build().unwrap_err();
        assert_eq!(
            err,
            DefinitionError::MissingCompute {
                node: "n".to_string()
            }
        );
    }

    #[test]
    fn schema_fills_defaults_and_checks_types() {
        let schema = ConfigSchema::new()
            .field("path", ConfigField::required(ConfigType::String))
            .field("limit", ConfigField::optional(ConfigType::Int).with_default(json!(10)));

        let resolved = schema.validate(Some(&json!({"path": "/tmp"}))).unwrap();
        assert_eq!(resolved, json!({"path": "/tmp", "limit": 10}));

        assert!(schema.validate(None).unwrap_err().contains("path"));
        assert!(schema.validate(Some(&json!({"path": 3}))).is_err());
        assert!(schema
            .validate(Some(&json!({"path": "x", "extra": true})))
            .unwrap_err()
            .contains("extra"));
    }

    #[test]
    fn empty_schema_passes_config_through() {
        let schema = ConfigSchema::new();
        assert_eq!(schema.validate(Some(&json!({"a": 1}))).unwrap(), json!({"a": 1}));
        assert_eq!(schema.validate(None).unwrap(), Value::Null);
    }
}
