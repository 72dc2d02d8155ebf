// src/ledger/event.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::io::OutputHandle;
use crate::plan::{PlanSnapshot, StepKey};
use crate::scheduler::{FailureKind, SkipReason};

/// One immutable ledger entry. Belongs to exactly one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub run_id: Uuid,
    /// `None` for run-level events.
    pub step_key: Option<StepKey>,
    pub timestamp: DateTime<Utc>,
    pub attempt: u32,
    pub kind: EventKind,
}

impl Event {
    pub fn run(run_id: Uuid, kind: EventKind) -> Self {
        Self {
            run_id,
            step_key: None,
            timestamp: Utc::now(),
            attempt: 0,
            kind,
        }
    }

    pub fn step(run_id: Uuid, step_key: StepKey, attempt: u32, kind: EventKind) -> Self {
        Self {
            run_id,
            step_key: Some(step_key),
            timestamp: Utc::now(),
            attempt,
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    RunStarting {
        pipeline: String,
        mode: String,
        plan: Box<PlanSnapshot>,
    },
    RunStarted,
    RunSuccess,
    RunFailure {
        reason: String,
    },
    RunCanceling,
    RunCanceled,

    StepQueued,
    StepStarting,
    StepRunning,
    StepOutput {
        output: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mapping_key: Option<String>,
        handle: OutputHandle,
    },
    StepSuccess,
    StepFailure {
        kind: FailureKind,
        message: String,
    },
    StepRetrying {
        delay_ms: u64,
    },
    StepSkipped {
        reason: SkipReason,
    },
    StepsMaterialized {
        producer: StepKey,
        output: String,
        mapping_keys: Vec<String>,
        steps: Vec<StepKey>,
    },

    ResourceInitFailure {
        resource: String,
        message: String,
    },
    ResourceTeardownFailure {
        resource: String,
        message: String,
    },
}

impl EventKind {
    pub fn is_run_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::RunSuccess | EventKind::RunFailure { .. } | EventKind::RunCanceled
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            EventKind::RunStarting { .. } => "RUN_STARTING",
            EventKind::RunStarted => "RUN_STARTED",
            EventKind::RunSuccess => "RUN_SUCCESS",
            EventKind::RunFailure { .. } => "RUN_FAILURE",
            EventKind::RunCanceling => "RUN_CANCELING",
            EventKind::RunCanceled => "RUN_CANCELED",
            EventKind::StepQueued => "STEP_QUEUED",
            EventKind::StepStarting => "STEP_STARTING",
            EventKind::StepRunning => "STEP_RUNNING",
            EventKind::StepOutput { .. } => "STEP_OUTPUT",
            EventKind::StepSuccess => "STEP_SUCCESS",
            EventKind::StepFailure { .. } => "STEP_FAILURE",
            EventKind::StepRetrying { .. } => "STEP_RETRYING",
            EventKind::StepSkipped { .. } => "STEP_SKIPPED",
            EventKind::StepsMaterialized { .. } => "STEPS_MATERIALIZED",
            EventKind::ResourceInitFailure { .. } => "RESOURCE_INIT_FAILURE",
            EventKind::ResourceTeardownFailure { .. } => "RESOURCE_TEARDOWN_FAILURE",
        }
    }
}

/// An event plus its position in the run's sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub offset: u64,
    pub event: Event,
}
