// src/io/mod.rs

//! IO-manager contract: persists step outputs and loads them back as inputs
//! of downstream steps. The core only ever passes [`OutputHandle`]s around
//! and never looks inside them.

mod memory;

pub use memory::InMemoryIoManager;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::plan::StepKey;

/// Opaque reference to a stored output value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputHandle(String);

impl OutputHandle {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OutputHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a value being stored came from.
#[derive(Debug, Clone)]
pub struct OutputContext {
    pub run_id: Uuid,
    pub step_key: StepKey,
    pub output: String,
    pub mapping_key: Option<String>,
    pub attempt: u32,
    pub type_name: String,
}

/// Where a value being loaded is going.
#[derive(Debug, Clone)]
pub struct InputContext {
    pub run_id: Uuid,
    pub step_key: StepKey,
    pub input: String,
    pub type_name: String,
}

/// Error type for IO-manager operations.
#[derive(Debug, thiserror::Error)]
pub enum IoError {
    /// No value stored under the handle.
    #[error("no stored value for handle {0}")]
    NotFound(OutputHandle),

    /// Backend-specific failure.
    #[error("io backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait IoManager: Send + Sync {
    /// Persist `value` and return a handle downstream steps can load from.
    async fn store(&self, value: Value, ctx: &OutputContext) -> Result<OutputHandle, IoError>;

    /// Load a value previously returned from [`IoManager::store`].
    async fn load(&self, handle: &OutputHandle, ctx: &InputContext) -> Result<Value, IoError>;
}
