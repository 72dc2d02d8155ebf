// tests/resources_lifecycle.rs

mod common;
use crate::common::{count, events_of, in_memory_services, output_value};
use pipedag_test_utils::builders::{fan_out, gather, source};
use pipedag_test_utils::{init_tracing, with_timeout};

use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use pipedag::config::RunConfig;
use pipedag::errors::PipedagError;
use pipedag::io::InMemoryIoManager;
use pipedag::{ExecutionServices, execute_pipeline};
use pipedag::exec::ComputeOutput;
use pipedag::graph::{GraphDefinition, InputDefinition, NodeDefinition, OutputDefinition, Pipeline};
use pipedag::ledger::{
    Event, EventKind, EventRecord, InMemoryLedger, LedgerError, LedgerStore, RunStatus,
};
use pipedag::resources::{ModeDefinition, ResourceFactory, ResourceHandle, ResourceInitContext};
use pipedag::scheduler::{FailureKind, RetryPolicy, StepFailure, StepState};

type TestResult = Result<(), Box<dyn Error>>;

/// Hands out a `u32` connection id and counts lifecycle calls.
#[derive(Clone, Default)]
struct CountingFactory {
    inits: Arc<AtomicU32>,
    teardowns: Arc<AtomicU32>,
    fail_init: bool,
    fail_teardown: bool,
}

#[async_trait]
impl ResourceFactory for CountingFactory {
    async fn init(&self, _ctx: ResourceInitContext) -> Result<ResourceHandle, String> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        // Give concurrent acquirers a chance to pile up on the same slot.
        tokio::time::sleep(Duration::from_millis(10)).await;
        if self.fail_init {
            return Err("connection refused".to_string());
        }
        Ok(Arc::new(42u32))
    }

    async fn teardown(&self, _handle: ResourceHandle) -> Result<(), String> {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        if self.fail_teardown {
            return Err("close failed".to_string());
        }
        Ok(())
    }
}

/// Reads the `db` resource; with an `x` input it tags the value with it.
fn uses_db(name: &str, with_input: bool) -> Arc<NodeDefinition> {
    let mut builder = NodeDefinition::builder(name)
        .output(OutputDefinition::any("out"))
        .required_resource("db");
    if with_input {
        builder = builder.input(InputDefinition::any("x"));
    }
    builder
        .compute_fn(|ctx| async move {
            let conn = *ctx
                .resources
                .get::<u32>("db")
                .ok_or_else(|| StepFailure::fatal("db resource missing"))?;
            let value = match ctx.input("x") {
                Some(x) => json!(format!("{}@{conn}", x.as_str().unwrap_or("?"))),
                None => json!(conn),
            };
            Ok(ComputeOutput::single("out", value))
        })
        .build()
        .expect("uses_db node")
}

fn with_db(graph: GraphDefinition, factory: &CountingFactory) -> Pipeline {
    Pipeline::new(graph).with_mode(ModeDefinition::new("default").resource("db", factory.clone()))
}

#[tokio::test]
async fn shared_resource_is_initialized_and_torn_down_once() -> TestResult {
    init_tracing();

    let graph = GraphDefinition::builder("shared")
        .node(source("seed", json!("row")))
        .node(uses_db("first", true))
        .node(uses_db("second", false))
        .node(uses_db("third", false))
        .edge(("seed", "out"), ("first", "x"))
        .build()?;
    let factory = CountingFactory::default();
    let (services, io) = in_memory_services();

    let result = with_timeout(execute_pipeline(
        &with_db(graph, &factory),
        RunConfig::default(),
        services.clone(),
        CancellationToken::new(),
    ))
    .await?;

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(factory.inits.load(Ordering::SeqCst), 1);
    assert_eq!(factory.teardowns.load(Ordering::SeqCst), 1);

    let events = events_of(&services, result.run_id).await;
    assert_eq!(output_value(&io, &events, "first", "out").await, Some(json!("row@42")));
    Ok(())
}

#[tokio::test]
async fn unused_resources_are_never_initialized() -> TestResult {
    init_tracing();

    let graph = GraphDefinition::builder("unused")
        .node(source("a", json!(1)))
        .build()?;
    let factory = CountingFactory::default();
    let (services, _io) = in_memory_services();

    let result = with_timeout(execute_pipeline(
        &with_db(graph, &factory),
        RunConfig::default(),
        services,
        CancellationToken::new(),
    ))
    .await?;

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(factory.inits.load(Ordering::SeqCst), 0);
    assert_eq!(factory.teardowns.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn failed_init_is_recorded_once_and_fails_every_dependent() -> TestResult {
    init_tracing();

    let graph = GraphDefinition::builder("broken_db")
        .node(uses_db("first", false))
        .node(uses_db("second", false))
        .build()?;
    let factory = CountingFactory {
        fail_init: true,
        ..CountingFactory::default()
    };
    let (services, _io) = in_memory_services();
    let config =
        RunConfig::default().with_retry_policy(RetryPolicy::fixed(2, Duration::from_millis(1)));

    let result = with_timeout(execute_pipeline(
        &with_db(graph, &factory),
        config,
        services.clone(),
        CancellationToken::new(),
    ))
    .await?;

    assert_eq!(result.status, RunStatus::Failure);
    assert_eq!(result.state_of("first"), Some(StepState::Failure));
    assert_eq!(result.state_of("second"), Some(StepState::Failure));
    assert_eq!(factory.inits.load(Ordering::SeqCst), 1);
    assert_eq!(factory.teardowns.load(Ordering::SeqCst), 0);

    let events = events_of(&services, result.run_id).await;
    assert_eq!(count(&events, "RESOURCE_INIT_FAILURE"), 1);
    assert_eq!(count(&events, "STEP_RETRYING"), 0);
    let kinds: Vec<FailureKind> = events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::StepFailure { kind, .. } => Some(*kind),
            _ => None,
        })
        .collect();
    assert_eq!(kinds, vec![FailureKind::ResourceInit, FailureKind::ResourceInit]);
    Ok(())
}

#[tokio::test]
async fn mapped_instances_share_one_instance() -> TestResult {
    init_tracing();

    let graph = GraphDefinition::builder("mapped_db")
        .node(fan_out("split", &["a", "b", "c"]))
        .node(uses_db("each", true))
        .node(gather("join"))
        .edge(("split", "items"), ("each", "x"))
        .edge(("each", "out"), ("join", "all"))
        .build()?;
    let factory = CountingFactory::default();
    let (services, io) = in_memory_services();

    let result = with_timeout(execute_pipeline(
        &with_db(graph, &factory),
        RunConfig::default(),
        services.clone(),
        CancellationToken::new(),
    ))
    .await?;

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(factory.inits.load(Ordering::SeqCst), 1);
    assert_eq!(factory.teardowns.load(Ordering::SeqCst), 1);

    let events = events_of(&services, result.run_id).await;
    assert_eq!(
        output_value(&io, &events, "join", "out").await,
        Some(json!(["a@42", "b@42", "c@42"]))
    );
    Ok(())
}

#[tokio::test]
async fn teardown_failures_are_recorded_without_failing_the_run() -> TestResult {
    init_tracing();

    let graph = GraphDefinition::builder("leaky")
        .node(uses_db("only", false))
        .build()?;
    let factory = CountingFactory {
        fail_teardown: true,
        ..CountingFactory::default()
    };
    let (services, _io) = in_memory_services();

    let result = with_timeout(execute_pipeline(
        &with_db(graph, &factory),
        RunConfig::default(),
        services.clone(),
        CancellationToken::new(),
    ))
    .await?;

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(factory.teardowns.load(Ordering::SeqCst), 1);

    let events = events_of(&services, result.run_id).await;
    assert_eq!(count(&events, "RESOURCE_TEARDOWN_FAILURE"), 1);
    Ok(())
}

/// Delegates to an in-memory ledger but refuses every `StepSuccess`.
struct RejectsSuccessLedger {
    inner: InMemoryLedger,
}

#[async_trait]
impl LedgerStore for RejectsSuccessLedger {
    async fn append(&self, run_id: Uuid, event: Event) -> Result<u64, LedgerError> {
        if matches!(event.kind, EventKind::StepSuccess) {
            return Err(LedgerError::Backend("disk full".to_string()));
        }
        self.inner.append(run_id, event).await
    }

    async fn read(&self, run_id: Uuid, cursor: u64) -> Result<Vec<EventRecord>, LedgerError> {
        self.inner.read(run_id, cursor).await
    }

    async fn run_ids(&self) -> Result<Vec<Uuid>, LedgerError> {
        self.inner.run_ids().await
    }
}

#[tokio::test]
async fn ledger_failure_tears_down_resources_and_aborts_running_steps() -> TestResult {
    init_tracing();

    let finished = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&finished);
    let slow = NodeDefinition::builder("slow")
        .output(OutputDefinition::any("out"))
        .compute_fn(move |_ctx| {
            let flag = Arc::clone(&flag);
            async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                flag.store(true, Ordering::SeqCst);
                Ok(ComputeOutput::single("out", json!(null)))
            }
        })
        .build()?;

    let graph = GraphDefinition::builder("ledger_down")
        .node(uses_db("query", false))
        .node(slow)
        .build()?;
    let factory = CountingFactory::default();
    let services = ExecutionServices::new(
        Arc::new(RejectsSuccessLedger {
            inner: InMemoryLedger::new(),
        }),
        Arc::new(InMemoryIoManager::new()),
    );

    let result = with_timeout(execute_pipeline(
        &with_db(graph, &factory),
        RunConfig::default(),
        services,
        CancellationToken::new(),
    ))
    .await;

    assert!(matches!(result, Err(PipedagError::Ledger(_))));
    assert_eq!(factory.inits.load(Ordering::SeqCst), 1);
    assert_eq!(factory.teardowns.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!finished.load(Ordering::SeqCst), "slow step kept running after the run failed");
    Ok(())
}
