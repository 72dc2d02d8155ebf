// src/exec/compute.rs

//! Compute contract: what a node's user logic receives and returns.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::graph::NodeHandle;
use crate::plan::StepKey;
use crate::resources::Resources;
use crate::scheduler::StepFailure;

pub type ComputeFuture = Pin<Box<dyn Future<Output = Result<ComputeOutput, StepFailure>> + Send>>;

/// User logic attached to a node definition. May run in-process or forward
/// to a remote worker; the scheduler does not care which.
pub trait Compute: Send + Sync {
    fn compute(&self, ctx: ComputeContext) -> ComputeFuture;
}

/// Everything one step attempt gets to see.
#[derive(Debug, Clone)]
pub struct ComputeContext {
    pub run_id: Uuid,
    pub step_key: StepKey,
    pub handle: NodeHandle,
    pub mapping_key: Option<String>,
    pub attempt: u32,
    pub inputs: BTreeMap<String, Value>,
    pub config: Value,
    pub resources: Resources,
    /// Fires when the run is canceled; long computations should poll it.
    pub cancel: CancellationToken,
}

impl ComputeContext {
    pub fn input(&self, name: &str) -> Option<&Value> {
        self.inputs.get(name)
    }

    /// Deserialize an input into a concrete type.
    pub fn input_as<T: DeserializeOwned>(&self, name: &str) -> Result<T, StepFailure> {
        let value = self
            .inputs
            .get(name)
            .ok_or_else(|| StepFailure::fatal(format!("input '{name}' was not provided")))?;
        serde_json::from_value(value.clone())
            .map_err(|e| StepFailure::fatal(format!("input '{name}' has unexpected shape: {e}")))
    }

    pub fn config_value(&self, field: &str) -> Option<&Value> {
        self.config.get(field)
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// One yielded value.
#[derive(Debug, Clone, PartialEq)]
pub struct YieldedValue {
    pub output: String,
    pub mapping_key: Option<String>,
    pub value: Value,
}

/// Values produced by one successful compute.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComputeOutput {
    values: Vec<YieldedValue>,
    empty_dynamic: Vec<String>,
}

impl ComputeOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorthand for a compute with one plain output.
    pub fn single(output: impl Into<String>, value: Value) -> Self {
        Self::new().value(output, value)
    }

    pub fn value(mut self, output: impl Into<String>, value: Value) -> Self {
        self.values.push(YieldedValue {
            output: output.into(),
            mapping_key: None,
            value,
        });
        self
    }

    /// One item of a dynamic output.
    pub fn dynamic(mut self, output: impl Into<String>, mapping_key: impl Into<String>, value: Value) -> Self {
        self.values.push(YieldedValue {
            output: output.into(),
            mapping_key: Some(mapping_key.into()),
            value,
        });
        self
    }

    /// Declare that a dynamic output was produced with zero items.
    pub fn empty_dynamic(mut self, output: impl Into<String>) -> Self {
        self.empty_dynamic.push(output.into());
        self
    }

    pub fn values(&self) -> &[YieldedValue] {
        &self.values
    }

    pub fn empty_dynamic_outputs(&self) -> &[String] {
        &self.empty_dynamic
    }

    pub(crate) fn into_parts(self) -> (Vec<YieldedValue>, Vec<String>) {
        (self.values, self.empty_dynamic)
    }
}

/// Adapter turning an async closure into a [`Compute`].
pub struct ComputeFn<F>(F);

pub fn compute_fn<F, Fut>(f: F) -> ComputeFn<F>
where
    F: Fn(ComputeContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ComputeOutput, StepFailure>> + Send + 'static,
{
    ComputeFn(f)
}

impl<F, Fut> Compute for ComputeFn<F>
where
    F: Fn(ComputeContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ComputeOutput, StepFailure>> + Send + 'static,
{
    fn compute(&self, ctx: ComputeContext) -> ComputeFuture {
        Box::pin((self.0)(ctx))
    }
}
