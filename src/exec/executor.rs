// src/exec/executor.rs

//! In-process executor: every attempt runs as its own Tokio task.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::engine::RuntimeEvent;
use crate::errors::Result;
use crate::exec::backend::ExecutorBackend;
use crate::exec::step_runner::{StepEnv, run_step};
use crate::io::IoManager;
use crate::plan::StepKey;
use crate::resources::ResourceManager;
use crate::scheduler::StepDispatch;

/// Internal handle for a currently-running attempt.
///
/// - `cancel` is the cooperative stop signal handed to compute.
/// - `handle` is the Tokio task that is actually running the step.
struct ActiveStep {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Executor used by [`execute_pipeline`](crate::execute_pipeline).
pub struct InProcessExecutor {
    env: StepEnv,
    run_cancel: CancellationToken,
    active: HashMap<StepKey, ActiveStep>,
}

impl std::fmt::Debug for InProcessExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessExecutor")
            .field("run_id", &self.env.run_id)
            .field("active", &self.active.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl InProcessExecutor {
    /// `run_cancel` is the run's token; each step gets a child of it.
    pub fn new(
        run_id: Uuid,
        runtime_tx: mpsc::Sender<RuntimeEvent>,
        io: Arc<dyn IoManager>,
        resources: Arc<ResourceManager>,
        run_cancel: CancellationToken,
    ) -> Self {
        Self {
            env: StepEnv {
                run_id,
                io,
                resources,
                runtime_tx,
            },
            run_cancel,
            active: HashMap::new(),
        }
    }

    /// Number of attempts whose task has not finished yet.
    pub fn running_count(&self) -> usize {
        self.active
            .values()
            .filter(|a| !a.handle.is_finished())
            .count()
    }
}

impl ExecutorBackend for InProcessExecutor {
    fn dispatch(
        &mut self,
        dispatch: StepDispatch,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        self.active.retain(|_, a| !a.handle.is_finished());

        let key = dispatch.key().clone();
        let cancel = self.run_cancel.child_token();
        let env = self.env.clone();
        let token = cancel.clone();
        let spawn_key = key.clone();

        let handle = tokio::spawn(async move {
            run_step(dispatch, env, token).await;
            debug!(step = %spawn_key, "step runner future finished");
        });
        self.active.insert(key, ActiveStep { cancel, handle });

        Box::pin(async { Ok(()) })
    }

    fn cancel_steps(
        &mut self,
        steps: Vec<StepKey>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        for key in steps {
            if let Some(active) = self.active.get(&key) {
                debug!(step = %key, "requesting cooperative stop");
                active.cancel.cancel();
            }
        }
        Box::pin(async { Ok(()) })
    }

    fn abort_steps(
        &mut self,
        steps: Vec<StepKey>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        for key in steps {
            if let Some(active) = self.active.remove(&key) {
                info!(step = %key, "aborting step task");
                active.cancel.cancel();
                active.handle.abort();
            }
        }
        Box::pin(async { Ok(()) })
    }
}
