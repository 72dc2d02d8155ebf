// src/ledger/mod.rs

//! Event ledger: the append-only per-run record of every step and run
//! transition, and the source of truth for how a run ended.

mod event;
mod memory;
mod status;

pub use event::{Event, EventKind, EventRecord};
pub use memory::InMemoryLedger;
pub use status::{Run, RunStatus, run_status_from_events, step_states_from_events};

use async_trait::async_trait;
use uuid::Uuid;

/// Error type for ledger storage operations.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// The event's run id does not match the run it was appended to.
    #[error("event for run {got} appended to run {expected}")]
    RunMismatch { expected: Uuid, got: Uuid },

    /// Backend-specific failure.
    #[error("ledger backend error: {0}")]
    Backend(String),
}

/// Storage contract for run events. Appends must keep per-run order.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Append one event and return its offset within the run.
    async fn append(&self, run_id: Uuid, event: Event) -> Result<u64, LedgerError>;

    /// Events of `run_id` with offset >= `cursor`, in order.
    async fn read(&self, run_id: Uuid, cursor: u64) -> Result<Vec<EventRecord>, LedgerError>;

    /// Every run id with at least one event, in first-append order.
    async fn run_ids(&self) -> Result<Vec<Uuid>, LedgerError>;
}
