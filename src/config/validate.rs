// src/config/validate.rs

use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::model::{
    DEFAULT_CANCEL_GRACE_PERIOD, ExecutionConfig, NodeRunConfig, RawExecutionSection,
    RawRetrySection, RawRunConfig, RunConfig, default_max_concurrent,
};
use crate::errors::{PipedagError, Result};
use crate::graph::{DEFAULT_MODE, NodeHandle};
use crate::scheduler::RetryPolicy;
use crate::types::BackoffKind;

impl TryFrom<RawRunConfig> for RunConfig {
    type Error = PipedagError;

    fn try_from(raw: RawRunConfig) -> std::result::Result<Self, Self::Error> {
        let RawRunConfig {
            mode,
            execution,
            logging,
            nodes,
        } = raw;
        let mode = validate_mode(mode)?;
        let execution = validate_execution(execution)?;
        validate_node_handles(&nodes)?;
        Ok(RunConfig::new_unchecked(mode, execution, logging.level, nodes))
    }
}

fn validate_mode(mode: Option<String>) -> Result<String> {
    match mode {
        None => Ok(DEFAULT_MODE.to_string()),
        Some(m) if m.trim().is_empty() => Err(PipedagError::ConfigError(
            "`mode` must not be empty".to_string(),
        )),
        Some(m) => Ok(m),
    }
}

fn validate_execution(raw: RawExecutionSection) -> Result<ExecutionConfig> {
    let max_concurrent = raw.max_concurrent.unwrap_or_else(default_max_concurrent);
    if max_concurrent == 0 {
        return Err(PipedagError::ConfigError(
            "[execution].max_concurrent must be >= 1 (got 0)".to_string(),
        ));
    }

    let retry = match raw.retry {
        Some(r) => retry_policy_from_raw(&r)?,
        None => RetryPolicy::none(),
    };

    Ok(ExecutionConfig {
        max_concurrent,
        collect_strictness: raw.collect_strictness,
        cancel_grace_period: raw
            .cancel_grace_period_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_CANCEL_GRACE_PERIOD),
        retry,
    })
}

fn retry_policy_from_raw(raw: &RawRetrySection) -> Result<RetryPolicy> {
    let policy = match raw.backoff {
        BackoffKind::Fixed => RetryPolicy::fixed(raw.max_retries, Duration::from_millis(raw.delay_ms)),
        BackoffKind::Exponential => RetryPolicy::exponential(
            raw.max_retries,
            Duration::from_millis(raw.initial_ms),
            raw.multiplier,
            Duration::from_millis(raw.max_ms),
        ),
    };
    policy
        .validate()
        .map_err(|e| PipedagError::ConfigError(format!("[execution.retry]: {e}")))?;
    Ok(policy)
}

fn validate_node_handles(nodes: &BTreeMap<String, NodeRunConfig>) -> Result<()> {
    for handle in nodes.keys() {
        if NodeHandle::parse(handle).is_none() {
            return Err(PipedagError::ConfigError(format!(
                "[nodes.\"{handle}\"]: not a valid node handle"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LogLevel;

    fn parse(src: &str) -> RawRunConfig {
        toml::from_str(src).expect("valid toml")
    }

    #[test]
    fn every_section_survives_validation() {
        let raw = parse(
            r#"
mode = "local"

[execution]
max_concurrent = 2

[logging]
level = "debug"

[nodes."etl.load"]
config = { table = "events" }
"#,
        );

        let cfg = RunConfig::try_from(raw).expect("valid config");
        assert_eq!(cfg.mode, "local");
        assert_eq!(cfg.execution.max_concurrent, 2);
        assert_eq!(cfg.log_level, Some(LogLevel::Debug));
        assert!(cfg.node("etl.load").is_some());
    }

    #[test]
    fn bad_handle_is_reported_after_other_sections_validate() {
        let raw = parse(
            r#"
mode = "local"

[nodes."etl..load"]
"#,
        );

        match RunConfig::try_from(raw) {
            Err(PipedagError::ConfigError(msg)) => assert!(msg.contains("etl..load")),
            other => panic!("expected ConfigError, got {other:?}"),
        }
    }
}
