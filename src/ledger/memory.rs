// src/ledger/memory.rs

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{RwLock, broadcast};
use uuid::Uuid;

use super::{Event, EventRecord, LedgerError, LedgerStore};

const SUBSCRIBER_CAPACITY: usize = 1024;

/// Process-local ledger. Per-run event vectors behind a lock, plus a
/// broadcast channel for tailing.
#[derive(Debug)]
pub struct InMemoryLedger {
    runs: RwLock<HashMap<Uuid, Vec<Event>>>,
    order: RwLock<Vec<Uuid>>,
    tx: broadcast::Sender<EventRecord>,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        let (tx, _rx) = broadcast::channel(SUBSCRIBER_CAPACITY);
        Self {
            runs: RwLock::new(HashMap::new()),
            order: RwLock::new(Vec::new()),
            tx,
        }
    }
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every event appended from now on, for all runs.
    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.tx.subscribe()
    }

    /// All events of a run, in append order.
    pub async fn events(&self, run_id: Uuid) -> Vec<Event> {
        self.runs
            .read()
            .await
            .get(&run_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedger {
    async fn append(&self, run_id: Uuid, event: Event) -> Result<u64, LedgerError> {
        if event.run_id != run_id {
            return Err(LedgerError::RunMismatch {
                expected: run_id,
                got: event.run_id,
            });
        }

        let record = {
            let mut runs = self.runs.write().await;
            if !runs.contains_key(&run_id) {
                self.order.write().await.push(run_id);
            }
            let events = runs.entry(run_id).or_default();
            let offset = events.len() as u64;
            events.push(event.clone());
            EventRecord { offset, event }
        };

        let offset = record.offset;
        // No subscribers is fine.
        let _ = self.tx.send(record);
        Ok(offset)
    }

    async fn read(&self, run_id: Uuid, cursor: u64) -> Result<Vec<EventRecord>, LedgerError> {
        let runs = self.runs.read().await;
        let Some(events) = runs.get(&run_id) else {
            return Ok(Vec::new());
        };
        Ok(events
            .iter()
            .enumerate()
            .skip(cursor as usize)
            .map(|(i, e)| EventRecord {
                offset: i as u64,
                event: e.clone(),
            })
            .collect())
    }

    async fn run_ids(&self) -> Result<Vec<Uuid>, LedgerError> {
        Ok(self.order.read().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::EventKind;

    #[tokio::test]
    async fn appends_in_order_and_reads_from_cursor() {
        let ledger = InMemoryLedger::new();
        let run_id = Uuid::new_v4();
        let mut rx = ledger.subscribe();

        for kind in [EventKind::RunStarted, EventKind::RunCanceling, EventKind::RunCanceled] {
            ledger.append(run_id, Event::run(run_id, kind)).await.unwrap();
        }

        let all = ledger.read(run_id, 0).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![0, 1, 2]);

        let tail = ledger.read(run_id, 2).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].event.kind, EventKind::RunCanceled);

        assert_eq!(ledger.run_ids().await.unwrap(), vec![run_id]);
        assert!(ledger.read(Uuid::new_v4(), 0).await.unwrap().is_empty());

        let first = rx.recv().await.unwrap();
        assert_eq!(first.offset, 0);
    }

    #[tokio::test]
    async fn rejects_events_for_another_run() {
        let ledger = InMemoryLedger::new();
        let err = ledger
            .append(Uuid::new_v4(), Event::run(Uuid::new_v4(), EventKind::RunStarted))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::RunMismatch { .. }));
    }
}
