#![allow(dead_code)]

//! Small node definitions with canned compute, for wiring test graphs.
//!
//! Unless stated otherwise a node has a single `Any` output named `out`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use pipedag::exec::ComputeOutput;
use pipedag::graph::{InputDefinition, NodeDefinition, OutputDefinition};
use pipedag::scheduler::{RetryPolicy, StepFailure};
use serde_json::{Value, json};

pub const OUT: &str = "out";

/// No inputs; yields `value`.
pub fn source(name: &str, value: Value) -> Arc<NodeDefinition> {
    NodeDefinition::builder(name)
        .output(OutputDefinition::any(OUT))
        .compute_fn(move |_ctx| {
            let value = value.clone();
            async move { Ok(ComputeOutput::single(OUT, value)) }
        })
        .build()
        .expect("source node")
}

/// One input `x`; yields it unchanged.
pub fn relay(name: &str) -> Arc<NodeDefinition> {
    NodeDefinition::builder(name)
        .input(InputDefinition::any("x"))
        .output(OutputDefinition::any(OUT))
        .compute_fn(|ctx| async move {
            let value = ctx.input("x").cloned().unwrap_or(Value::Null);
            Ok(ComputeOutput::single(OUT, value))
        })
        .build()
        .expect("relay node")
}

/// One integer input `x`; yields `x + 1`.
pub fn add_one(name: &str) -> Arc<NodeDefinition> {
    NodeDefinition::builder(name)
        .input(InputDefinition::any("x"))
        .output(OutputDefinition::any(OUT))
        .compute_fn(|ctx| async move {
            let x: i64 = ctx.input_as("x")?;
            Ok(ComputeOutput::single(OUT, json!(x + 1)))
        })
        .build()
        .expect("add_one node")
}

/// Inputs named by `inputs`; always fails with `failure`.
pub fn failing(name: &str, inputs: &[&str], failure: StepFailure) -> Arc<NodeDefinition> {
    let mut builder = NodeDefinition::builder(name).output(OutputDefinition::any(OUT));
    for input in inputs {
        builder = builder.input(InputDefinition::any(*input));
    }
    builder
        .compute_fn(move |_ctx| {
            let failure = failure.clone();
            async move { Err(failure) }
        })
        .build()
        .expect("failing node")
}

/// No inputs; fails with a retryable error for the first `failures` calls,
/// then yields `"ok"`. `calls` counts every invocation.
pub fn flaky(name: &str, failures: u32, calls: Arc<AtomicU32>, policy: RetryPolicy) -> Arc<NodeDefinition> {
    NodeDefinition::builder(name)
        .output(OutputDefinition::any(OUT))
        .retry_policy(policy)
        .compute_fn(move |_ctx| {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if call <= failures {
                    Err(StepFailure::user(format!("transient failure #{call}")))
                } else {
                    Ok(ComputeOutput::single(OUT, json!("ok")))
                }
            }
        })
        .build()
        .expect("flaky node")
}

/// No inputs; dynamic output `items` with one item per key, valued by the
/// key itself.
pub fn fan_out(name: &str, keys: &[&str]) -> Arc<NodeDefinition> {
    let keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
    NodeDefinition::builder(name)
        .output(OutputDefinition::any("items").dynamic())
        .compute_fn(move |_ctx| {
            let keys = keys.clone();
            async move {
                if keys.is_empty() {
                    return Ok(ComputeOutput::new().empty_dynamic("items"));
                }
                let out = keys
                    .into_iter()
                    .fold(ComputeOutput::new(), |out, k| out.dynamic("items", k.clone(), json!(k)));
                Ok(out)
            }
        })
        .build()
        .expect("fan_out node")
}

/// One input `x`; yields `x` upper-cased, or fails when `x` equals
/// `fail_on`.
pub fn shout(name: &str, fail_on: Option<&str>) -> Arc<NodeDefinition> {
    let fail_on = fail_on.map(str::to_string);
    NodeDefinition::builder(name)
        .input(InputDefinition::any("x"))
        .output(OutputDefinition::any(OUT))
        .compute_fn(move |ctx| {
            let fail_on = fail_on.clone();
            async move {
                let x: String = ctx.input_as("x")?;
                if fail_on.as_deref() == Some(x.as_str()) {
                    return Err(StepFailure::fatal(format!("refusing {x}")));
                }
                Ok(ComputeOutput::single(OUT, json!(x.to_uppercase())))
            }
        })
        .build()
        .expect("shout node")
}

/// Collect input `all`; yields the collected list.
pub fn gather(name: &str) -> Arc<NodeDefinition> {
    NodeDefinition::builder(name)
        .input(InputDefinition::any("all").collect())
        .output(OutputDefinition::any(OUT))
        .compute_fn(|ctx| async move {
            let all = ctx.input("all").cloned().unwrap_or(Value::Null);
            Ok(ComputeOutput::single(OUT, all))
        })
        .build()
        .expect("gather node")
}

/// No inputs; optional output `maybe` that is never yielded, plus `out`.
pub fn optional_branch(name: &str) -> Arc<NodeDefinition> {
    NodeDefinition::builder(name)
        .output(OutputDefinition::any(OUT))
        .output(OutputDefinition::any("maybe").optional())
        .compute_fn(|_ctx| async { Ok(ComputeOutput::single(OUT, json!(true))) })
        .build()
        .expect("optional_branch node")
}

/// No inputs; waits for cancellation, then fails as canceled.
pub fn wait_for_cancel(name: &str) -> Arc<NodeDefinition> {
    NodeDefinition::builder(name)
        .output(OutputDefinition::any(OUT))
        .compute_fn(|ctx| async move {
            ctx.cancel.cancelled().await;
            Err(StepFailure::canceled("stopped on request"))
        })
        .build()
        .expect("wait_for_cancel node")
}

/// No inputs; ignores cancellation and sleeps for `duration`.
pub fn stubborn(name: &str, duration: Duration) -> Arc<NodeDefinition> {
    NodeDefinition::builder(name)
        .output(OutputDefinition::any(OUT))
        .compute_fn(move |_ctx| async move {
            tokio::time::sleep(duration).await;
            Ok(ComputeOutput::single(OUT, json!("late")))
        })
        .build()
        .expect("stubborn node")
}

/// No inputs; sleeps briefly, so concurrent steps overlap if allowed to.
pub fn sleepy(name: &str, duration: Duration) -> Arc<NodeDefinition> {
    NodeDefinition::builder(name)
        .output(OutputDefinition::any(OUT))
        .compute_fn(move |_ctx| async move {
            tokio::time::sleep(duration).await;
            Ok(ComputeOutput::single(OUT, json!(null)))
        })
        .build()
        .expect("sleepy node")
}
