// src/io/memory.rs

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{InputContext, IoError, IoManager, OutputContext, OutputHandle};

/// Keeps every stored value in process memory. Handles are derived from the
/// run id, step key, output, mapping key and attempt, so they never collide
/// within a process.
#[derive(Debug, Default)]
pub struct InMemoryIoManager {
    values: RwLock<HashMap<OutputHandle, Value>>,
}

impl InMemoryIoManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.values.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.values.read().await.is_empty()
    }

    fn handle_for(ctx: &OutputContext) -> OutputHandle {
        let mut raw = format!("{}/{}/{}", ctx.run_id, ctx.step_key, ctx.output);
        if let Some(key) = &ctx.mapping_key {
            raw.push('/');
            raw.push_str(key);
        }
        raw.push_str(&format!("#{}", ctx.attempt));
        OutputHandle::new(raw)
    }
}

#[async_trait]
impl IoManager for InMemoryIoManager {
    async fn store(&self, value: Value, ctx: &OutputContext) -> Result<OutputHandle, IoError> {
        let handle = Self::handle_for(ctx);
        self.values.write().await.insert(handle.clone(), value);
        Ok(handle)
    }

    async fn load(&self, handle: &OutputHandle, _ctx: &InputContext) -> Result<Value, IoError> {
        self.values
            .read()
            .await
            .get(handle)
            .cloned()
            .ok_or_else(|| IoError::NotFound(handle.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::StepKey;
    use serde_json::json;
    use uuid::Uuid;

    #[tokio::test]
    async fn stores_and_loads_values() {
        let io = InMemoryIoManager::new();
        let run_id = Uuid::new_v4();
        let out_ctx = OutputContext {
            run_id,
            step_key: StepKey::new("a"),
            output: "out".to_string(),
            mapping_key: Some("x".to_string()),
            attempt: 1,
            type_name: "Any".to_string(),
        };
        let handle = io.store(json!([1, 2]), &out_ctx).await.unwrap();
        assert!(handle.as_str().ends_with("/a/out/x#1"));

        let in_ctx = InputContext {
            run_id,
            step_key: StepKey::new("b"),
            input: "x".to_string(),
            type_name: "Any".to_string(),
        };
        assert_eq!(io.load(&handle, &in_ctx).await.unwrap(), json!([1, 2]));

        let missing = io.load(&OutputHandle::new("nope"), &in_ctx).await;
        assert!(matches!(missing, Err(IoError::NotFound(_))));
    }
}
