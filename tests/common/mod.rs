#![allow(dead_code)]

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use pipedag::ExecutionServices;
use pipedag::io::{InMemoryIoManager, InputContext, IoManager};
use pipedag::ledger::{Event, EventKind, InMemoryLedger};
use pipedag::plan::StepKey;

/// In-memory services, plus a typed handle on the IO manager so tests can
/// read stored values back.
pub fn in_memory_services() -> (ExecutionServices, Arc<InMemoryIoManager>) {
    let io = Arc::new(InMemoryIoManager::new());
    let services = ExecutionServices::new(Arc::new(InMemoryLedger::new()), io.clone());
    (services, io)
}

/// All events of `run_id`, in ledger order.
pub async fn events_of(services: &ExecutionServices, run_id: Uuid) -> Vec<Event> {
    services
        .ledger
        .read(run_id, 0)
        .await
        .expect("ledger read")
        .into_iter()
        .map(|r| r.event)
        .collect()
}

/// `(step_key, EVENT_NAME)` pairs for step-level events.
pub fn step_event_names(events: &[Event]) -> Vec<(String, &'static str)> {
    events
        .iter()
        .filter_map(|e| {
            e.step_key
                .as_ref()
                .map(|k| (k.to_string(), e.kind.name()))
        })
        .collect()
}

/// Names of every event of `step`, in order.
pub fn names_for(events: &[Event], step: &str) -> Vec<&'static str> {
    events
        .iter()
        .filter(|e| e.step_key.as_ref().map(|k| k.as_str()) == Some(step))
        .map(|e| e.kind.name())
        .collect()
}

/// Index of the first event of `step` with the given name.
pub fn position(events: &[Event], step: &str, name: &str) -> Option<usize> {
    events.iter().position(|e| {
        e.step_key.as_ref().map(|k| k.as_str()) == Some(step) && e.kind.name() == name
    })
}

pub fn count(events: &[Event], name: &str) -> usize {
    events.iter().filter(|e| e.kind.name() == name).count()
}

pub fn run_level_names(events: &[Event]) -> Vec<&'static str> {
    events
        .iter()
        .filter(|e| e.step_key.is_none())
        .map(|e| e.kind.name())
        .collect()
}

/// The `reason` of the run's `RUN_FAILURE` event, if any.
pub fn failure_reason(events: &[Event]) -> Option<String> {
    events.iter().find_map(|e| match &e.kind {
        EventKind::RunFailure { reason } => Some(reason.clone()),
        _ => None,
    })
}

/// Value stored for the plain (non-dynamic) `output` of `step`.
pub async fn output_value(
    io: &InMemoryIoManager,
    events: &[Event],
    step: &str,
    output: &str,
) -> Option<Value> {
    let (run_id, handle) = events.iter().find_map(|e| match &e.kind {
        EventKind::StepOutput {
            output: name,
            mapping_key: None,
            handle,
        } if name == output && e.step_key.as_ref().map(|k| k.as_str()) == Some(step) => {
            Some((e.run_id, handle.clone()))
        }
        _ => None,
    })?;
    let ctx = InputContext {
        run_id,
        step_key: StepKey::new(step),
        input: output.to_string(),
        type_name: "Any".to_string(),
    };
    io.load(&handle, &ctx).await.ok()
}
