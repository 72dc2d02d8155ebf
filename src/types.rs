// src/types.rs

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// What a collect (fan-in over a dynamic output) step does when some of the
/// mapped instances it waits on did not succeed.
///
/// - `Fail`: the collect step fails without running (default).
/// - `Partial`: the collect step runs over the results that do exist, as long
///   as at least one instance succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectStrictness {
    Fail,
    Partial,
}

impl Default for CollectStrictness {
    fn default() -> Self {
        CollectStrictness::Fail
    }
}

impl FromStr for CollectStrictness {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fail" => Ok(CollectStrictness::Fail),
            "partial" => Ok(CollectStrictness::Partial),
            other => Err(format!(
                "invalid collect_strictness: {other} (expected \"fail\" or \"partial\")"
            )),
        }
    }
}

/// Log level as accepted in the `[logging]` config section.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("invalid log level: {other}")),
        }
    }
}

/// Backoff shape accepted in `[execution.retry]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}
