// src/lib.rs

pub mod config;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod graph;
pub mod io;
pub mod ledger;
pub mod logging;
pub mod plan;
pub mod resources;
pub mod scheduler;
pub mod types;

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::RunConfig;
use crate::engine::{CoreRuntime, Runtime, RuntimeEvent};
use crate::errors::{CompileError, PipedagError, Result};
use crate::exec::InProcessExecutor;
use crate::graph::Pipeline;
use crate::io::{InMemoryIoManager, IoManager};
use crate::ledger::{
    Event, EventKind, InMemoryLedger, LedgerStore, RunStatus, step_states_from_events,
};
use crate::plan::{ExecutionPlan, KnownExecutionState, PlanSnapshot, StepKey, compile};
use crate::resources::ResourceManager;
use crate::scheduler::{ActiveExecution, SchedulerSettings, StepState};

/// External collaborators a run writes to.
#[derive(Clone)]
pub struct ExecutionServices {
    pub ledger: Arc<dyn LedgerStore>,
    pub io: Arc<dyn IoManager>,
}

impl ExecutionServices {
    pub fn new(ledger: Arc<dyn LedgerStore>, io: Arc<dyn IoManager>) -> Self {
        Self { ledger, io }
    }

    /// In-memory ledger and IO manager, for tests and embedding.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryLedger::new()),
            Arc::new(InMemoryIoManager::new()),
        )
    }
}

impl std::fmt::Debug for ExecutionServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionServices").finish_non_exhaustive()
    }
}

/// Summary of a finished run. The ledger holds the full story.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub run_id: Uuid,
    pub status: RunStatus,
    /// `None` when compilation failed.
    pub plan: Option<PlanSnapshot>,
    /// Final state of every step, including materialized ones.
    pub step_states: BTreeMap<StepKey, StepState>,
}

impl RunResult {
    pub fn state_of(&self, key: &str) -> Option<StepState> {
        self.step_states.get(&StepKey::new(key)).copied()
    }
}

/// High-level entry point: compile `pipeline` against `config` and execute
/// it to completion.
///
/// This wires together:
/// - plan compilation
/// - resource manager / scheduler / core runtime
/// - in-process executor
/// - cancellation through `cancel`
///
/// A pipeline that fails to compile still gets a run: a single
/// `RUN_FAILURE` event is recorded and the result has no steps.
pub async fn execute_pipeline(
    pipeline: &Pipeline,
    config: RunConfig,
    services: ExecutionServices,
    cancel: CancellationToken,
) -> Result<RunResult> {
    let plan = compile(pipeline, &config);
    run_plan(pipeline, config, plan, services, cancel).await
}

/// Run only `step_keys` of `pipeline`, reading everything upstream of them
/// from `known`, usually built with [`KnownExecutionState::from_run`].
///
/// Keys name plan steps; instances of a mapped step are picked with
/// `name[key]` next to its `name[?]`. Unknown keys, or selected steps whose
/// upstream is neither selected nor known, fail the run the way a compile
/// error does.
pub async fn reexecute_pipeline<I, S>(
    pipeline: &Pipeline,
    config: RunConfig,
    step_keys: I,
    known: KnownExecutionState,
    services: ExecutionServices,
    cancel: CancellationToken,
) -> Result<RunResult>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let plan = compile(pipeline, &config).and_then(|plan| plan.subset(step_keys, known));
    run_plan(pipeline, config, plan, services, cancel).await
}

async fn run_plan(
    pipeline: &Pipeline,
    config: RunConfig,
    plan: std::result::Result<ExecutionPlan, CompileError>,
    services: ExecutionServices,
    cancel: CancellationToken,
) -> Result<RunResult> {
    let run_id = Uuid::new_v4();
    info!(%run_id, pipeline = pipeline.name(), mode = %config.mode, "starting run");

    let plan = match plan {
        Ok(plan) => plan,
        Err(err) => {
            warn!(%run_id, error = %err, "pipeline failed to compile");
            services
                .ledger
                .append(
                    run_id,
                    Event::run(
                        run_id,
                        EventKind::RunFailure {
                            reason: err.to_string(),
                        },
                    ),
                )
                .await?;
            return Ok(RunResult {
                run_id,
                status: RunStatus::Failure,
                plan: None,
                step_states: BTreeMap::new(),
            });
        }
    };

    let snapshot = plan.snapshot();
    services
        .ledger
        .append(
            run_id,
            Event::run(
                run_id,
                EventKind::RunStarting {
                    pipeline: pipeline.name().to_string(),
                    mode: plan.mode().to_string(),
                    plan: Box::new(snapshot.clone()),
                },
            ),
        )
        .await?;

    let mode = pipeline
        .mode(plan.mode())
        .ok_or_else(|| PipedagError::ConfigError(format!("unknown mode '{}'", plan.mode())))?;
    let resources = Arc::new(ResourceManager::new(run_id, mode, &plan.resource_users()));

    // Runtime event channel.
    let (rt_tx, rt_rx) = mpsc::channel::<RuntimeEvent>(256);

    let executor = InProcessExecutor::new(
        run_id,
        rt_tx.clone(),
        Arc::clone(&services.io),
        Arc::clone(&resources),
        cancel.clone(),
    );

    // Construct the pure core runtime (single source of truth for semantics).
    let execution = ActiveExecution::new(&plan, SchedulerSettings::from_config(&config.execution));
    let core = CoreRuntime::new(execution, config.execution.cancel_grace_period);

    // Construct the async IO shell around the core.
    let runtime = Runtime::new(
        run_id,
        core,
        rt_rx,
        rt_tx,
        executor,
        Arc::clone(&services.ledger),
        resources,
        cancel,
    );
    let status = runtime.run().await?;

    let records = services.ledger.read(run_id, 0).await?;
    let step_states = step_states_from_events(records.iter().map(|r| &r.event));

    Ok(RunResult {
        run_id,
        status,
        plan: Some(snapshot),
        step_states,
    })
}
