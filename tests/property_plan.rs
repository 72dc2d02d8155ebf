// tests/property_plan.rs

use std::collections::{BTreeMap, BTreeSet, HashSet};

use proptest::prelude::*;
use serde_json::json;

use pipedag::config::RunConfig;
use pipedag::graph::{GraphDefinition, Pipeline};
use pipedag::io::OutputHandle;
use pipedag::ledger::RunStatus;
use pipedag::plan::{ExecutionPlan, StepKey, compile};
use pipedag::scheduler::{
    ActiveExecution, ProducedOutput, SchedulerSettings, StepDispatch, StepFailure, StepOutcome,
    StepState,
};
use pipedag_test_utils::builders::{relay, source};

// Strategy to generate a valid DAG pipeline.
// We ensure acyclicity by only allowing node N to depend on nodes 0..N-1.
fn dag_pipeline_strategy(max_nodes: usize) -> impl Strategy<Value = Pipeline> {
    (1..=max_nodes).prop_flat_map(|num_nodes| {
        let deps_strat = proptest::collection::vec(
            proptest::collection::vec(any::<usize>(), 0..num_nodes),
            num_nodes,
        );

        deps_strat.prop_map(move |raw_deps| {
            let mut builder = GraphDefinition::builder("generated");
            let mut edges = Vec::new();
            for (i, potential_deps) in raw_deps.into_iter().enumerate() {
                let name = format!("n{i}");

                // Sanitize dependencies: only allow deps < i
                let deps: BTreeSet<usize> = if i > 0 {
                    potential_deps.into_iter().map(|d| d % i).collect()
                } else {
                    BTreeSet::new()
                };

                if deps.is_empty() {
                    builder = builder.node(source(&name, json!(i)));
                } else {
                    builder = builder.node(relay(&name));
                    for dep in deps {
                        edges.push((format!("n{dep}"), name.clone()));
                    }
                }
            }
            for (from, to) in &edges {
                builder = builder.edge((from.as_str(), "out"), (to.as_str(), "x"));
            }
            Pipeline::new(builder.build().expect("generated graph is valid"))
        })
    })
}

fn plan_of(pipeline: &Pipeline) -> ExecutionPlan {
    compile(pipeline, &RunConfig::default()).expect("generated graph compiles")
}

fn success(dispatch: &StepDispatch) -> StepOutcome {
    let produced = dispatch
        .step
        .outputs
        .iter()
        .map(|o| {
            let handle = OutputHandle::new(format!("{}.{}", dispatch.key(), o.name));
            (o.name.clone(), ProducedOutput::Single(handle))
        })
        .collect::<BTreeMap<_, _>>();
    StepOutcome::Success(produced)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn plan_has_one_step_per_node_in_dependency_order(pipeline in dag_pipeline_strategy(10)) {
        let plan = plan_of(&pipeline);
        prop_assert_eq!(plan.len(), pipeline.graph().flattened_node_count());

        let position: BTreeMap<StepKey, usize> = plan
            .step_keys()
            .into_iter()
            .enumerate()
            .map(|(i, k)| (k, i))
            .collect();
        for (up, down) in plan.dependency_edges() {
            prop_assert!(position[up] < position[down], "{} must precede {}", up, down);
        }

        let level_of: BTreeMap<StepKey, usize> = plan
            .steps_by_level()
            .into_iter()
            .enumerate()
            .flat_map(|(level, keys)| keys.into_iter().map(move |k| (k, level)))
            .collect();
        for (up, down) in plan.dependency_edges() {
            prop_assert!(level_of[up] < level_of[down]);
        }
    }

    #[test]
    fn compilation_is_deterministic(pipeline in dag_pipeline_strategy(10)) {
        prop_assert_eq!(plan_of(&pipeline).snapshot(), plan_of(&pipeline).snapshot());
    }

    #[test]
    fn scheduler_eventually_terminates_and_respects_dependencies(
        pipeline in dag_pipeline_strategy(10),
        failing_indices in proptest::collection::vec(0..10usize, 0..4),
        max_concurrent in 1..4usize,
    ) {
        let plan = plan_of(&pipeline);
        let failing: HashSet<StepKey> = failing_indices
            .iter()
            .map(|i| StepKey::new(format!("n{i}")))
            .filter(|k| plan.step(k).is_some())
            .collect();

        let settings = SchedulerSettings {
            max_concurrent,
            ..SchedulerSettings::default()
        };
        let mut execution = ActiveExecution::new(&plan, settings);

        // Queue of steps currently "executing"
        let mut executing: Vec<StepDispatch> = Vec::new();
        let mut started = execution.start();

        let mut rounds = 0;
        loop {
            for dispatch in started.dispatched() {
                // Every upstream finished successfully before dispatch.
                for up in plan.upstream_keys(dispatch.key()) {
                    prop_assert_eq!(execution.state(&up), Some(StepState::Success));
                }
                executing.push(dispatch.clone());
            }
            prop_assert!(execution.in_flight_count() <= max_concurrent);

            let Some(dispatch) = executing.pop() else {
                break;
            };
            let outcome = if failing.contains(dispatch.key()) {
                StepOutcome::Failure(StepFailure::fatal("scripted failure"))
            } else {
                success(&dispatch)
            };
            started = execution.complete(dispatch.key(), dispatch.attempt, outcome);

            rounds += 1;
            prop_assert!(rounds <= 1000, "simulation did not converge");
        }

        prop_assert!(execution.is_finished());

        // Everything downstream of a failure is skipped; the rest succeeds.
        let mut tainted: BTreeSet<StepKey> = BTreeSet::new();
        for key in plan.step_keys() {
            let upstream_tainted = plan
                .upstream_keys(&key)
                .iter()
                .any(|up| tainted.contains(up) || failing.contains(up));
            let expected = if upstream_tainted {
                StepState::Skipped
            } else if failing.contains(&key) {
                StepState::Failure
            } else {
                StepState::Success
            };
            prop_assert_eq!(execution.state(&key), Some(expected), "step {}", key);
            if upstream_tainted || failing.contains(&key) {
                tainted.insert(key);
            }
        }

        let expected_status = if failing.is_empty() { RunStatus::Success } else { RunStatus::Failure };
        prop_assert_eq!(execution.run_status(), expected_status);
    }
}
