// src/exec/step_runner.rs

//! Runs one attempt of one step: resources, inputs, compute, outputs.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::RuntimeEvent;
use crate::exec::ComputeContext;
use crate::exec::outputs::{CheckedOutput, check_outputs};
use crate::io::{InputContext, IoManager, OutputContext, OutputHandle};
use crate::plan::ExecutionStep;
use crate::resources::ResourceManager;
use crate::scheduler::{
    FailureKind, InputValue, ProducedOutput, StepDispatch, StepFailure, StepOutcome,
};

/// Shared services every step attempt needs.
#[derive(Clone)]
pub(crate) struct StepEnv {
    pub run_id: Uuid,
    pub io: Arc<dyn IoManager>,
    pub resources: Arc<ResourceManager>,
    pub runtime_tx: mpsc::Sender<RuntimeEvent>,
}

/// Aborts the wrapped task when dropped, so aborting the step also stops
/// its compute.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Run a single attempt and report `StepCompleted` for it.
pub(crate) async fn run_step(dispatch: StepDispatch, env: StepEnv, cancel: CancellationToken) {
    let key = dispatch.step.key.clone();
    let attempt = dispatch.attempt;

    let outcome = match run_step_inner(&dispatch, &env, cancel).await {
        Ok(produced) => StepOutcome::Success(produced),
        Err(failure) => {
            info!(step = %key, attempt, kind = ?failure.kind, error = %failure.message, "step attempt failed");
            StepOutcome::Failure(failure)
        }
    };

    if env
        .runtime_tx
        .send(RuntimeEvent::StepCompleted {
            step: key.clone(),
            attempt,
            outcome,
        })
        .await
        .is_err()
    {
        debug!(step = %key, attempt, "runtime gone before step completion was reported");
    }
}

async fn run_step_inner(
    dispatch: &StepDispatch,
    env: &StepEnv,
    cancel: CancellationToken,
) -> Result<BTreeMap<String, ProducedOutput>, StepFailure> {
    let step = &dispatch.step;
    let attempt = dispatch.attempt;

    let resources = match env.resources.acquire_all(&step.required_resource_keys).await {
        Ok(resources) => resources,
        Err(failure) => {
            if failure.first_report {
                let _ = env
                    .runtime_tx
                    .send(RuntimeEvent::ResourceInitFailed {
                        step: step.key.clone(),
                        attempt,
                        resource: failure.key.clone(),
                        message: failure.message.clone(),
                    })
                    .await;
            }
            return Err(StepFailure::new(
                FailureKind::ResourceInit,
                format!("resource '{}' failed to initialize: {}", failure.key, failure.message),
            ));
        }
    };

    let inputs = load_inputs(dispatch, env).await?;

    let _ = env
        .runtime_tx
        .send(RuntimeEvent::StepRunning {
            step: step.key.clone(),
            attempt,
        })
        .await;

    let ctx = ComputeContext {
        run_id: env.run_id,
        step_key: step.key.clone(),
        handle: step.handle.clone(),
        mapping_key: step.mapping_key().map(str::to_string),
        attempt,
        inputs,
        config: step.config.clone(),
        resources,
        cancel,
    };

    debug!(step = %step.key, attempt, "running compute");
    let mut task = AbortOnDrop(tokio::spawn(step.definition.compute().compute(ctx)));
    let produced = match (&mut task.0).await {
        Ok(result) => result?,
        Err(err) if err.is_panic() => {
            warn!(step = %step.key, attempt, "compute panicked");
            return Err(StepFailure::user("compute panicked"));
        }
        Err(_) => return Err(StepFailure::canceled("compute task was aborted")),
    };

    let checked = check_outputs(step, produced)?;
    store_outputs(step, attempt, checked, env).await
}

async fn load_inputs(
    dispatch: &StepDispatch,
    env: &StepEnv,
) -> Result<BTreeMap<String, Value>, StepFailure> {
    let mut inputs = BTreeMap::new();

    for input in &dispatch.inputs {
        let ctx = InputContext {
            run_id: env.run_id,
            step_key: dispatch.step.key.clone(),
            input: input.name.clone(),
            type_name: input.type_name.clone(),
        };
        let value = match &input.value {
            InputValue::Single(handle) => load_value(env.io.as_ref(), handle, &ctx).await?,
            InputValue::Many(handles) => {
                let mut items = Vec::with_capacity(handles.len());
                for handle in handles {
                    items.push(load_value(env.io.as_ref(), handle, &ctx).await?);
                }
                Value::Array(items)
            }
            InputValue::Literal(value) => value.clone(),
            InputValue::Unit => continue,
        };
        inputs.insert(input.name.clone(), value);
    }

    Ok(inputs)
}

async fn load_value(
    io: &dyn IoManager,
    handle: &OutputHandle,
    ctx: &InputContext,
) -> Result<Value, StepFailure> {
    io.load(handle, ctx).await.map_err(|e| {
        StepFailure::new(
            FailureKind::Io,
            format!("loading input '{}' from {handle}: {e}", ctx.input),
        )
    })
}

async fn store_outputs(
    step: &ExecutionStep,
    attempt: u32,
    checked: BTreeMap<String, CheckedOutput>,
    env: &StepEnv,
) -> Result<BTreeMap<String, ProducedOutput>, StepFailure> {
    let mut produced = BTreeMap::new();

    for (output, value) in checked {
        let type_name = step
            .output(&output)
            .map(|o| o.type_name.clone())
            .unwrap_or_default();
        let ctx = |mapping_key: Option<String>| OutputContext {
            run_id: env.run_id,
            step_key: step.key.clone(),
            output: output.clone(),
            mapping_key,
            attempt,
            type_name: type_name.clone(),
        };
        let io_failure = |e: crate::io::IoError| {
            StepFailure::new(FailureKind::Io, format!("storing output '{output}': {e}"))
        };

        let stored = match value {
            CheckedOutput::Single(value) => {
                let handle = env.io.store(value, &ctx(None)).await.map_err(io_failure)?;
                ProducedOutput::Single(handle)
            }
            CheckedOutput::Dynamic(items) => {
                let mut handles = Vec::with_capacity(items.len());
                for (mapping_key, value) in items {
                    let handle = env
                        .io
                        .store(value, &ctx(Some(mapping_key.clone())))
                        .await
                        .map_err(io_failure)?;
                    handles.push((mapping_key, handle));
                }
                ProducedOutput::Dynamic(handles)
            }
        };
        produced.insert(output, stored);
    }

    Ok(produced)
}
