use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use pipedag::engine::RuntimeEvent;
use pipedag::errors::Result;
use pipedag::exec::ExecutorBackend;
use pipedag::io::OutputHandle;
use pipedag::plan::StepKey;
use pipedag::scheduler::{ProducedOutput, StepDispatch, StepFailure, StepOutcome};

/// A fake executor that:
/// - records which steps were dispatched, with their attempt
/// - immediately reports `StepRunning` and `StepCompleted` for each one
///
/// Steps succeed by default with a handle `"<step>.<output>"` for every
/// non-dynamic output; [`FakeExecutor::fail`] scripts a failure instead.
pub struct FakeExecutor {
    runtime_tx: tokio::sync::mpsc::Sender<RuntimeEvent>,
    dispatched: Arc<Mutex<Vec<(String, u32)>>>,
    failures: HashMap<String, StepFailure>,
}

impl FakeExecutor {
    pub fn new(
        runtime_tx: tokio::sync::mpsc::Sender<RuntimeEvent>,
        dispatched: Arc<Mutex<Vec<(String, u32)>>>,
    ) -> Self {
        Self {
            runtime_tx,
            dispatched,
            failures: HashMap::new(),
        }
    }

    /// Every attempt of `step` fails with `failure`.
    pub fn fail(mut self, step: &str, failure: StepFailure) -> Self {
        self.failures.insert(step.to_string(), failure);
        self
    }

    fn outcome_for(&self, dispatch: &StepDispatch) -> StepOutcome {
        if let Some(failure) = self.failures.get(dispatch.key().as_str()) {
            return StepOutcome::Failure(failure.clone());
        }
        let produced = dispatch
            .step
            .outputs
            .iter()
            .filter(|o| !o.is_dynamic)
            .map(|o| {
                let handle = OutputHandle::new(format!("{}.{}", dispatch.key(), o.name));
                (o.name.clone(), ProducedOutput::Single(handle))
            })
            .collect();
        StepOutcome::Success(produced)
    }
}

impl ExecutorBackend for FakeExecutor {
    fn dispatch(
        &mut self,
        dispatch: StepDispatch,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let tx = self.runtime_tx.clone();
        let outcome = self.outcome_for(&dispatch);
        {
            let mut guard = self.dispatched.lock().unwrap();
            guard.push((dispatch.key().to_string(), dispatch.attempt));
        }

        Box::pin(async move {
            let step: StepKey = dispatch.key().clone();
            tx.send(RuntimeEvent::StepRunning {
                step: step.clone(),
                attempt: dispatch.attempt,
            })
            .await
            .map_err(anyhow::Error::from)?;
            tx.send(RuntimeEvent::StepCompleted {
                step,
                attempt: dispatch.attempt,
                outcome,
            })
            .await
            .map_err(anyhow::Error::from)?;
            Ok(())
        })
    }

    fn cancel_steps(
        &mut self,
        _steps: Vec<StepKey>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }

    fn abort_steps(
        &mut self,
        _steps: Vec<StepKey>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }
}
