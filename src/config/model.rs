// src/config/model.rs

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::graph::DEFAULT_MODE;
use crate::scheduler::RetryPolicy;
use crate::types::{BackoffKind, CollectStrictness, LogLevel};

/// Run configuration as read from a TOML file, before validation.
///
/// ```toml
/// mode = "default"
///
/// [execution]
/// max_concurrent = 4
/// collect_strictness = "fail"
/// cancel_grace_period_ms = 5000
///
/// [execution.retry]
/// max_retries = 2
/// backoff = "exponential"
/// initial_ms = 100
/// multiplier = 2.0
/// max_ms = 2000
///
/// [logging]
/// level = "debug"
///
/// [nodes."etl.load"]
/// config = { table = "events" }
/// inputs = { batch_size = 500 }
/// ```
///
/// All sections are optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawRunConfig {
    #[serde(default)]
    pub mode: Option<String>,

    #[serde(default)]
    pub execution: RawExecutionSection,

    #[serde(default)]
    pub logging: LoggingSection,

    /// Per-node settings keyed by handle string (e.g. `"etl.load"`).
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeRunConfig>,
}

/// `[execution]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawExecutionSection {
    #[serde(default)]
    pub max_concurrent: Option<usize>,

    #[serde(default)]
    pub collect_strictness: CollectStrictness,

    #[serde(default)]
    pub cancel_grace_period_ms: Option<u64>,

    #[serde(default)]
    pub retry: Option<RawRetrySection>,
}

/// `[execution.retry]` section: run-wide default retry policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawRetrySection {
    #[serde(default)]
    pub max_retries: u32,

    #[serde(default)]
    pub backoff: BackoffKind,

    /// Fixed backoff delay.
    #[serde(default)]
    pub delay_ms: u64,

    #[serde(default = "default_initial_ms")]
    pub initial_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
}

fn default_initial_ms() -> u64 {
    100
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_ms() -> u64 {
    30_000
}

/// `[logging]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingSection {
    #[serde(default)]
    pub level: Option<LogLevel>,
}

/// `[nodes."<handle>"]` section.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeRunConfig {
    /// Checked against the node's config schema at compile time.
    #[serde(default)]
    pub config: Option<Value>,

    /// Literal values for inputs that nothing upstream feeds.
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
}

/// Resolved execution settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionConfig {
    /// Upper bound on steps between `STARTING` and their terminal state.
    pub max_concurrent: usize,
    pub collect_strictness: CollectStrictness,
    /// How long running steps get to stop cooperatively after a cancel.
    pub cancel_grace_period: Duration,
    /// Used by steps whose node carries no retry policy of its own.
    pub retry: RetryPolicy,
}

pub const DEFAULT_CANCEL_GRACE_PERIOD: Duration = Duration::from_secs(5);

pub(crate) fn default_max_concurrent() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            collect_strictness: CollectStrictness::default(),
            cancel_grace_period: DEFAULT_CANCEL_GRACE_PERIOD,
            retry: RetryPolicy::none(),
        }
    }
}

/// Validated run configuration: the fixed input to compilation and
/// execution of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub mode: String,
    pub execution: ExecutionConfig,
    pub log_level: Option<LogLevel>,
    pub nodes: BTreeMap<String, NodeRunConfig>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            mode: DEFAULT_MODE.to_string(),
            execution: ExecutionConfig::default(),
            log_level: None,
            nodes: BTreeMap::new(),
        }
    }
}

impl RunConfig {
    pub(crate) fn new_unchecked(
        mode: String,
        execution: ExecutionConfig,
        log_level: Option<LogLevel>,
        nodes: BTreeMap<String, NodeRunConfig>,
    ) -> Self {
        Self {
            mode,
            execution,
            log_level,
            nodes,
        }
    }

    pub fn node(&self, handle: &str) -> Option<&NodeRunConfig> {
        self.nodes.get(handle)
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = mode.into();
        self
    }

    /// Values below 1 are clamped to 1.
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.execution.max_concurrent = max_concurrent.max(1);
        self
    }

    pub fn with_collect_strictness(mut self, strictness: CollectStrictness) -> Self {
        self.execution.collect_strictness = strictness;
        self
    }

    pub fn with_cancel_grace_period(mut self, grace: Duration) -> Self {
        self.execution.cancel_grace_period = grace;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.execution.retry = policy;
        self
    }

    pub fn with_node_config(mut self, handle: impl Into<String>, config: Value) -> Self {
        self.nodes.entry(handle.into()).or_default().config = Some(config);
        self
    }

    pub fn with_node_input(
        mut self,
        handle: impl Into<String>,
        input: impl Into<String>,
        value: Value,
    ) -> Self {
        self.nodes
            .entry(handle.into())
            .or_default()
            .inputs
            .insert(input.into(), value);
        self
    }
}
