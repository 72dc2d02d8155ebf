// tests/compile_plan.rs

use pipedag_test_utils::builders::{add_one, fan_out, gather, relay, shout, source};
use pipedag_test_utils::init_tracing;

use std::error::Error;
use std::sync::Arc;

use serde_json::json;

use pipedag::config::RunConfig;
use pipedag::errors::CompileError;
use pipedag::exec::ComputeOutput;
use pipedag::graph::{
    CompositeDefinition, ConfigField, ConfigSchema, ConfigType, GraphDefinition, InputDefinition,
    NodeDefinition, OutputDefinition, Pipeline,
};
use pipedag::io::OutputHandle;
use pipedag::plan::{KnownExecutionState, StepInputSource, StepKey, StepKind, compile};

type TestResult = Result<(), Box<dyn Error>>;

fn typed(name: &str, input: Option<&str>, output: &str) -> Arc<NodeDefinition> {
    let mut b = NodeDefinition::builder(name)
        .output(OutputDefinition::new("out", output))
        .compute_fn(|_ctx| async { Ok(ComputeOutput::new()) });
    if let Some(ty) = input {
        b = b.input(InputDefinition::new("x", ty));
    }
    b.build().expect("typed node")
}

fn keys(plan: &pipedag::plan::ExecutionPlan) -> Vec<String> {
    plan.step_keys().iter().map(|k| k.to_string()).collect()
}

#[test]
fn linear_graph_compiles_in_dependency_order() -> TestResult {
    init_tracing();

    let graph = GraphDefinition::builder("linear")
        .node(source("a", json!(1)))
        .node(add_one("b"))
        .node(add_one("c"))
        .edge(("a", "out"), ("b", "x"))
        .edge(("b", "out"), ("c", "x"))
        .build()?;
    let plan = compile(&Pipeline::new(graph), &RunConfig::default())?;

    assert_eq!(keys(&plan), vec!["a", "b", "c"]);
    assert_eq!(
        plan.steps_by_level(),
        vec![
            vec![StepKey::new("a")],
            vec![StepKey::new("b")],
            vec![StepKey::new("c")],
        ]
    );

    let b = plan.step(&StepKey::new("b")).ok_or("missing step b")?;
    assert!(matches!(
        &b.inputs[0].source,
        StepInputSource::FromStepOutput { upstream } if upstream.step_key.as_str() == "a"
    ));
    Ok(())
}

#[test]
fn diamond_levels_group_independent_steps() -> TestResult {
    let graph = GraphDefinition::builder("diamond")
        .node(source("root", json!(0)))
        .node(relay("left"))
        .node(relay("right"))
        .node(
            NodeDefinition::builder("join")
                .input(InputDefinition::any("x"))
                .output(OutputDefinition::any("out"))
                .compute_fn(|_ctx| async { Ok(ComputeOutput::new()) })
                .build()?,
        )
        .edge(("root", "out"), ("left", "x"))
        .edge(("root", "out"), ("right", "x"))
        .edge(("left", "out"), ("join", "x"))
        .edge(("right", "out"), ("join", "x"))
        .build()?;
    let plan = compile(&Pipeline::new(graph), &RunConfig::default())?;

    let levels = plan.steps_by_level();
    assert_eq!(levels.len(), 3);
    assert_eq!(levels[1], vec![StepKey::new("left"), StepKey::new("right")]);

    let join = plan.step(&StepKey::new("join")).ok_or("missing join")?;
    match &join.inputs[0].source {
        StepInputSource::FromMultipleSources { upstream } => assert_eq!(upstream.len(), 2),
        other => panic!("expected fan-in, got {other:?}"),
    }
    Ok(())
}

#[test]
fn compiling_twice_yields_identical_plans() -> TestResult {
    let graph = GraphDefinition::builder("again")
        .node(fan_out("split", &["a", "b"]))
        .node(shout("each", None))
        .node(gather("join"))
        .edge(("split", "items"), ("each", "x"))
        .edge(("each", "out"), ("join", "all"))
        .build()?;
    let pipeline = Pipeline::new(graph);
    let config = RunConfig::default();

    let first = compile(&pipeline, &config)?.snapshot();
    let second = compile(&pipeline, &config)?.snapshot();
    assert_eq!(first, second);
    Ok(())
}

#[test]
fn cycles_are_reported_with_their_members() -> TestResult {
    let graph = GraphDefinition::builder("loop")
        .node(relay("a"))
        .node(relay("b"))
        .edge(("a", "out"), ("b", "x"))
        .edge(("b", "out"), ("a", "x"))
        .build()?;

    let err = compile(&Pipeline::new(graph), &RunConfig::default()).unwrap_err();
    assert_eq!(
        err,
        CompileError::DependencyCycle {
            cycle: vec!["a".into(), "b".into(), "a".into()]
        }
    );
    Ok(())
}

#[test]
fn cycles_are_reported_along_their_edges() -> TestResult {
    let graph = GraphDefinition::builder("triangle")
        .node(relay("a"))
        .node(relay("b"))
        .node(relay("c"))
        .edge(("a", "out"), ("c", "x"))
        .edge(("c", "out"), ("b", "x"))
        .edge(("b", "out"), ("a", "x"))
        .build()?;

    let err = compile(&Pipeline::new(graph), &RunConfig::default()).unwrap_err();
    let expected: Vec<String> = ["a", "c", "b", "a"].iter().map(|s| s.to_string()).collect();
    assert_eq!(err, CompileError::DependencyCycle { cycle: expected });
    Ok(())
}

#[test]
fn independent_nodes_keep_declaration_order() -> TestResult {
    let graph = GraphDefinition::builder("wide")
        .node(source("zeta", json!(1)))
        .node(source("alpha", json!(2)))
        .node(relay("mid"))
        .node(source("omega", json!(3)))
        .edge(("alpha", "out"), ("mid", "x"))
        .build()?;

    let plan = compile(&Pipeline::new(graph), &RunConfig::default())?;
    assert_eq!(keys(&plan), vec!["zeta", "alpha", "mid", "omega"]);
    Ok(())
}

#[test]
fn incompatible_edge_types_are_rejected() -> TestResult {
    let graph = GraphDefinition::builder("types")
        .node(typed("producer", None, "Int"))
        .node(typed("consumer", Some("String"), "String"))
        .edge(("producer", "out"), ("consumer", "x"))
        .build()?;

    let err = compile(&Pipeline::new(graph.clone()), &RunConfig::default()).unwrap_err();
    assert!(matches!(err, CompileError::TypeMismatch { .. }), "got {err:?}");

    let lenient = Pipeline::new(graph)
        .with_type_compatibility(pipedag::graph::TypeRegistry::new().with_coercion("Int", "String"));
    assert!(compile(&lenient, &RunConfig::default()).is_ok());
    Ok(())
}

#[test]
fn unknown_mode_is_rejected_before_anything_else() -> TestResult {
    let graph = GraphDefinition::builder("m").node(source("a", json!(1))).build()?;
    let err = compile(&Pipeline::new(graph), &RunConfig::default().with_mode("prod")).unwrap_err();
    assert_eq!(err, CompileError::UnknownMode("prod".to_string()));
    Ok(())
}

#[test]
fn missing_resources_are_listed_sorted() -> TestResult {
    let needs = |name: &str, keys: &[&str]| {
        let mut b = NodeDefinition::builder(name)
            .output(OutputDefinition::any("out"))
            .compute_fn(|_ctx| async { Ok(ComputeOutput::new()) });
        for k in keys {
            b = b.required_resource(*k);
        }
        b.build().expect("node")
    };
    let graph = GraphDefinition::builder("res")
        .node(needs("a", &["warehouse", "cache"]))
        .node(needs("b", &["cache"]))
        .build()?;

    let err = compile(&Pipeline::new(graph), &RunConfig::default()).unwrap_err();
    assert_eq!(
        err,
        CompileError::MissingResources {
            missing: vec!["cache".into(), "warehouse".into()]
        }
    );
    Ok(())
}

#[test]
fn inputs_without_a_source_are_unsatisfied() -> TestResult {
    let graph = GraphDefinition::builder("lonely").node(relay("r")).build()?;
    let pipeline = Pipeline::new(graph);

    let err = compile(&pipeline, &RunConfig::default()).unwrap_err();
    assert_eq!(
        err,
        CompileError::UnsatisfiedInput {
            handle: "r".into(),
            input: "x".into()
        }
    );

    // A run config value satisfies it.
    let cfg = RunConfig::default().with_node_input("r", "x", json!("hi"));
    let plan = compile(&pipeline, &cfg)?;
    let step = plan.step(&StepKey::new("r")).ok_or("missing r")?;
    assert_eq!(
        step.inputs[0].source,
        StepInputSource::FromConfig { value: json!("hi") }
    );
    Ok(())
}

#[test]
fn node_config_is_checked_against_its_schema() -> TestResult {
    let node = NodeDefinition::builder("load")
        .output(OutputDefinition::any("out"))
        .config_schema(
            ConfigSchema::new()
                .field("table", ConfigField::required(ConfigType::String))
                .field(
                    "batch",
                    ConfigField::optional(ConfigType::Int).with_default(json!(100)),
                ),
        )
        .compute_fn(|_ctx| async { Ok(ComputeOutput::new()) })
        .build()?;
    let pipeline = Pipeline::new(GraphDefinition::builder("cfg").node(node).build()?);

    let err = compile(&pipeline, &RunConfig::default()).unwrap_err();
    assert!(matches!(err, CompileError::InvalidNodeConfig { ref handle, .. } if handle == "load"));

    let cfg = RunConfig::default().with_node_config("load", json!({ "table": "events" }));
    let plan = compile(&pipeline, &cfg)?;
    let step = plan.step(&StepKey::new("load")).ok_or("missing load")?;
    assert_eq!(step.config, json!({ "table": "events", "batch": 100 }));

    let err = compile(&pipeline, &RunConfig::default().with_node_config("nope", json!({})))
        .unwrap_err();
    assert_eq!(err, CompileError::UnknownNodeConfig("nope".into()));
    Ok(())
}

#[test]
fn composites_flatten_to_dotted_handles() -> TestResult {
    let interior = GraphDefinition::builder("inner")
        .node(add_one("first"))
        .node(add_one("second"))
        .edge(("first", "out"), ("second", "x"))
        .build()?;
    let composite = CompositeDefinition::builder("twice", interior)
        .input(InputDefinition::any("in"))
        .output(OutputDefinition::any("result"))
        .map_input("in", ("first", "x"))
        .map_output("result", ("second", "out"))
        .build()?;

    let graph = GraphDefinition::builder("outer")
        .node(source("seed", json!(1)))
        .node(composite)
        .node(relay("sink"))
        .edge(("seed", "out"), ("twice", "in"))
        .edge(("twice", "result"), ("sink", "x"))
        .build()?;
    assert_eq!(graph.flattened_node_count(), 4);

    let plan = compile(&Pipeline::new(graph), &RunConfig::default())?;
    assert_eq!(
        keys(&plan),
        vec!["seed", "twice.first", "twice.second", "sink"]
    );

    let sink = plan.step(&StepKey::new("sink")).ok_or("missing sink")?;
    assert!(matches!(
        &sink.inputs[0].source,
        StepInputSource::FromStepOutput { upstream } if upstream.step_key.as_str() == "twice.second"
    ));
    Ok(())
}

#[test]
fn mapped_steps_compile_to_placeholders() -> TestResult {
    let graph = GraphDefinition::builder("fan")
        .node(fan_out("split", &["a"]))
        .node(shout("each", None))
        .node(relay("after"))
        .node(gather("join"))
        .edge(("split", "items"), ("each", "x"))
        .edge(("each", "out"), ("after", "x"))
        .edge(("after", "out"), ("join", "all"))
        .build()?;
    let plan = compile(&Pipeline::new(graph), &RunConfig::default())?;

    assert_eq!(keys(&plan), vec!["split", "each[?]", "after[?]", "join"]);

    let each = plan.step(&StepKey::new("each[?]")).ok_or("missing each")?;
    assert!(matches!(&each.kind, StepKind::Unresolved { resolved_by } if resolved_by.to_string() == "split.items"));
    assert!(matches!(each.inputs[0].source, StepInputSource::FromPendingDynamic { .. }));

    let after = plan.step(&StepKey::new("after[?]")).ok_or("missing after")?;
    assert!(matches!(after.kind, StepKind::Unresolved { .. }));
    assert!(matches!(after.inputs[0].source, StepInputSource::FromUnresolvedStepOutput { .. }));

    let join = plan.step(&StepKey::new("join")).ok_or("missing join")?;
    assert!(matches!(
        &join.inputs[0].source,
        StepInputSource::Collect { upstream } if upstream.step_key.as_str() == "after[?]"
    ));
    Ok(())
}

#[test]
fn collecting_a_plain_output_is_invalid() -> TestResult {
    let graph = GraphDefinition::builder("bad_collect")
        .node(source("a", json!(1)))
        .node(gather("join"))
        .edge(("a", "out"), ("join", "all"))
        .build()?;

    let err = compile(&Pipeline::new(graph), &RunConfig::default()).unwrap_err();
    assert!(
        matches!(err, CompileError::InvalidDynamic { ref handle, .. } if handle == "join"),
        "got {err:?}"
    );
    Ok(())
}

#[test]
fn nested_dynamic_outputs_are_invalid() -> TestResult {
    let inner_fan = NodeDefinition::builder("refan")
        .input(InputDefinition::any("x"))
        .output(OutputDefinition::any("items").dynamic())
        .compute_fn(|_ctx| async { Ok(ComputeOutput::new()) })
        .build()?;
    let graph = GraphDefinition::builder("nested")
        .node(fan_out("split", &["a"]))
        .node(inner_fan)
        .edge(("split", "items"), ("refan", "x"))
        .build()?;

    let err = compile(&Pipeline::new(graph), &RunConfig::default()).unwrap_err();
    assert!(
        matches!(err, CompileError::InvalidDynamic { ref handle, .. } if handle == "refan"),
        "got {err:?}"
    );
    Ok(())
}

fn subset_fixture() -> Result<Pipeline, Box<dyn Error>> {
    let graph = GraphDefinition::builder("subset")
        .node(source("a", json!(1)))
        .node(add_one("b"))
        .node(fan_out("split", &["x", "y"]))
        .node(shout("each", None))
        .node(gather("join"))
        .edge(("a", "out"), ("b", "x"))
        .edge(("split", "items"), ("each", "x"))
        .edge(("each", "out"), ("join", "all"))
        .build()?;
    Ok(Pipeline::new(graph))
}

#[test]
fn subset_rejects_unknown_step_keys() -> TestResult {
    init_tracing();

    let plan = compile(&subset_fixture()?, &RunConfig::default())?;
    let err = plan
        .subset(["a", "nope", "each[x]"], KnownExecutionState::new())
        .err()
        .ok_or("unknown keys accepted")?;

    match err {
        CompileError::StepNotFound { keys } => {
            assert_eq!(keys, vec!["each[x]".to_string(), "nope".to_string()]);
        }
        other => return Err(format!("unexpected error: {other}").into()),
    }
    Ok(())
}

#[test]
fn subset_picks_instances_next_to_their_placeholder() -> TestResult {
    init_tracing();

    let plan = compile(&subset_fixture()?, &RunConfig::default())?;
    let known = KnownExecutionState::new().with_output(
        StepKey::new("split"),
        "items",
        OutputHandle::new("split-items"),
    );
    let subset = plan.subset(["each[?]", "each[y]"], known)?;

    let each = StepKey::new("each[?]");
    assert!(subset.is_selected(&each));
    assert!(!subset.is_selected(&StepKey::new("split")));
    assert!(!subset.is_selected(&StepKey::new("join")));
    assert_eq!(
        subset
            .selected_instances(&each)
            .map(|keys| keys.iter().cloned().collect::<Vec<_>>()),
        Some(vec!["y".to_string()])
    );
    assert_eq!(
        subset.snapshot().selection,
        Some(vec![each.clone(), StepKey::new("each[y]")])
    );

    // The full plan is untouched.
    assert!(plan.is_selected(&StepKey::new("join")));
    assert!(plan.snapshot().selection.is_none());
    Ok(())
}

#[test]
fn subset_needs_every_unselected_upstream_to_be_known() -> TestResult {
    init_tracing();

    let plan = compile(&subset_fixture()?, &RunConfig::default())?;

    let err = plan
        .subset(["join"], KnownExecutionState::new())
        .err()
        .ok_or("join ran without its instances")?;
    assert!(
        matches!(&err, CompileError::MissingKnownState { step, upstream } if step == "join" && upstream == "each[?]"),
        "{err}"
    );

    let known = KnownExecutionState::new()
        .with_output(StepKey::new("a"), "out", OutputHandle::new("a-out"))
        .with_mapping(StepKey::new("each[?]"), vec!["x".to_string(), "y".to_string()]);
    let subset = plan.subset(["b", "join"], known)?;
    let selected: Vec<String> = subset.selected_steps().map(|s| s.key.to_string()).collect();
    assert_eq!(selected, vec!["b", "join"]);
    Ok(())
}
