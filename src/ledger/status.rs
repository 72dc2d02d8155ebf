// src/ledger/status.rs

//! Reductions from an event sequence to run and step status.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Event, EventKind};
use crate::plan::{PlanSnapshot, StepKey};
use crate::scheduler::StepState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    NotStarted,
    Starting,
    Started,
    Success,
    Failure,
    Canceled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Failure | RunStatus::Canceled)
    }
}

/// Fold run-level events into a status. The last relevant event wins.
pub fn run_status_from_events<'a>(events: impl IntoIterator<Item = &'a Event>) -> RunStatus {
    events
        .into_iter()
        .fold(RunStatus::NotStarted, |status, event| match event.kind {
            EventKind::RunStarting { .. } => RunStatus::Starting,
            EventKind::RunStarted | EventKind::RunCanceling => RunStatus::Started,
            EventKind::RunSuccess => RunStatus::Success,
            EventKind::RunFailure { .. } => RunStatus::Failure,
            EventKind::RunCanceled => RunStatus::Canceled,
            _ => status,
        })
}

/// Latest known state of every step mentioned in the events.
pub fn step_states_from_events<'a>(
    events: impl IntoIterator<Item = &'a Event>,
) -> BTreeMap<StepKey, StepState> {
    let mut states = BTreeMap::new();
    for event in events {
        let Some(key) = &event.step_key else {
            continue;
        };
        let state = match &event.kind {
            EventKind::StepQueued => StepState::Queued,
            EventKind::StepStarting => StepState::Starting,
            EventKind::StepRunning => StepState::Running,
            EventKind::StepSuccess => StepState::Success,
            EventKind::StepFailure { .. } => StepState::Failure,
            EventKind::StepRetrying { .. } => StepState::Retrying,
            EventKind::StepSkipped { .. } => StepState::Skipped,
            EventKind::StepsMaterialized { .. } => StepState::Expanded,
            _ => continue,
        };
        states.insert(key.clone(), state);
    }
    states
}

/// A run as seen through its ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: Uuid,
    pub pipeline: Option<String>,
    pub plan: Option<PlanSnapshot>,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn from_events(run_id: Uuid, events: &[Event]) -> Self {
        let mut run = Run {
            run_id,
            pipeline: None,
            plan: None,
            status: run_status_from_events(events),
            started_at: events.first().map(|e| e.timestamp),
            ended_at: None,
        };

        for event in events {
            match &event.kind {
                EventKind::RunStarting { pipeline, plan, .. } => {
                    run.pipeline = Some(pipeline.clone());
                    run.plan = Some(plan.as_ref().clone());
                    run.started_at = Some(event.timestamp);
                }
                kind if kind.is_run_terminal() => run.ended_at = Some(event.timestamp),
                _ => {}
            }
        }
        run
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(run_id: Uuid, kind: EventKind) -> Event {
        Event::run(run_id, kind)
    }

    #[test]
    fn status_follows_run_events() {
        let id = Uuid::new_v4();
        assert_eq!(run_status_from_events(&Vec::<Event>::new()), RunStatus::NotStarted);

        let events = vec![ev(id, EventKind::RunStarted), ev(id, EventKind::RunSuccess)];
        assert_eq!(run_status_from_events(&events), RunStatus::Success);

        let events = vec![
            ev(id, EventKind::RunStarted),
            ev(id, EventKind::RunCanceling),
            ev(id, EventKind::RunCanceled),
        ];
        assert_eq!(run_status_from_events(&events), RunStatus::Canceled);

        let events = vec![ev(
            id,
            EventKind::RunFailure {
                reason: "cycle".to_string(),
            },
        )];
        let run = Run::from_events(id, &events);
        assert_eq!(run.status, RunStatus::Failure);
        assert!(run.ended_at.is_some());
        assert!(run.plan.is_none());
    }

    #[test]
    fn step_states_take_the_latest_event() {
        let id = Uuid::new_v4();
        let a = StepKey::new("a");
        let events = vec![
            Event::step(id, a.clone(), 1, EventKind::StepQueued),
            Event::step(id, a.clone(), 1, EventKind::StepStarting),
            Event::step(
                id,
                a.clone(),
                1,
                EventKind::StepFailure {
                    kind: crate::scheduler::FailureKind::User,
                    message: "boom".to_string(),
                },
            ),
            Event::step(id, a.clone(), 1, EventKind::StepRetrying { delay_ms: 0 }),
        ];
        assert_eq!(step_states_from_events(&events).get(&a), Some(&StepState::Retrying));
    }
}
