// src/resources/manager.rs

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ModeDefinition, ResourceFactory, ResourceHandle, ResourceInitContext, Resources};

/// A resource factory failed. Every acquirer sees the same failure; only
/// the first is told to report it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInitFailure {
    pub key: String,
    pub message: String,
    pub first_report: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownFailure {
    pub key: String,
    pub message: String,
}

struct Slot {
    factory: Arc<dyn ResourceFactory>,
    instance: OnceCell<Result<ResourceHandle, String>>,
    failure_reported: AtomicBool,
    users: AtomicUsize,
    torn_down: AtomicBool,
}

/// Per-run owner of resource instances.
///
/// Counts start at the number of steps declaring each key and grow when
/// dynamic expansion adds instances. Release happens once per step.
pub struct ResourceManager {
    run_id: Uuid,
    slots: BTreeMap<String, Slot>,
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("run_id", &self.run_id)
            .field("keys", &self.slots.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ResourceManager {
    pub fn new(run_id: Uuid, mode: &ModeDefinition, users: &BTreeMap<String, usize>) -> Self {
        let slots = mode
            .resource_keys()
            .filter_map(|key| {
                let factory = mode.factory(key)?;
                let slot = Slot {
                    factory,
                    instance: OnceCell::new(),
                    failure_reported: AtomicBool::new(false),
                    users: AtomicUsize::new(users.get(key).copied().unwrap_or(0)),
                    torn_down: AtomicBool::new(false),
                };
                Some((key.to_string(), slot))
            })
            .collect();

        Self { run_id, slots }
    }

    /// Get the instance for `key`, initializing it on first use.
    pub async fn acquire(&self, key: &str) -> Result<ResourceHandle, ResourceInitFailure> {
        let Some(slot) = self.slots.get(key) else {
            return Err(ResourceInitFailure {
                key: key.to_string(),
                message: format!("resource '{key}' is not provided by the run's mode"),
                first_report: false,
            });
        };

        let result = slot
            .instance
            .get_or_init(|| async {
                debug!(run_id = %self.run_id, resource = key, "initializing resource");
                let ctx = ResourceInitContext {
                    run_id: self.run_id,
                    key: key.to_string(),
                };
                let res = slot.factory.init(ctx).await;
                match &res {
                    Ok(_) => info!(run_id = %self.run_id, resource = key, "resource initialized"),
                    Err(e) => warn!(run_id = %self.run_id, resource = key, error = %e, "resource init failed"),
                }
                res
            })
            .await;

        match result {
            Ok(handle) => Ok(Arc::clone(handle)),
            Err(message) => Err(ResourceInitFailure {
                key: key.to_string(),
                message: message.clone(),
                first_report: !slot.failure_reported.swap(true, Ordering::SeqCst),
            }),
        }
    }

    /// Acquire every key, stopping at the first failure.
    pub async fn acquire_all<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a String>,
    ) -> Result<Resources, ResourceInitFailure> {
        let mut resources = Resources::default();
        for key in keys {
            let handle = self.acquire(key).await?;
            resources.insert(key.clone(), handle);
        }
        Ok(resources)
    }

    /// Add users for steps materialized at run time.
    pub fn register_users(&self, counts: &BTreeMap<String, usize>) {
        for (key, n) in counts {
            if let Some(slot) = self.slots.get(key) {
                slot.users.fetch_add(*n, Ordering::SeqCst);
            }
        }
    }

    /// One dependent of each key reached a terminal state. Tears down any
    /// resource whose count drops to zero.
    pub async fn release<'a>(&self, keys: impl IntoIterator<Item = &'a String>) -> Vec<TeardownFailure> {
        let mut failures = Vec::new();
        for key in keys {
            let Some(slot) = self.slots.get(key) else {
                continue;
            };
            let prev = slot
                .users
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            if prev == Ok(1) {
                if let Some(f) = self.teardown_slot(key, slot).await {
                    failures.push(f);
                }
            }
        }
        failures
    }

    /// Tear down everything still alive (run end or cancellation).
    pub async fn teardown_all(&self) -> Vec<TeardownFailure> {
        let mut failures = Vec::new();
        for (key, slot) in &self.slots {
            if let Some(f) = self.teardown_slot(key, slot).await {
                failures.push(f);
            }
        }
        failures
    }

    pub fn users(&self, key: &str) -> Option<usize> {
        self.slots.get(key).map(|s| s.users.load(Ordering::SeqCst))
    }

    pub fn is_torn_down(&self, key: &str) -> bool {
        self.slots
            .get(key)
            .is_some_and(|s| s.torn_down.load(Ordering::SeqCst))
    }

    async fn teardown_slot(&self, key: &str, slot: &Slot) -> Option<TeardownFailure> {
        let Some(Ok(handle)) = slot.instance.get() else {
            return None;
        };
        if slot.torn_down.swap(true, Ordering::SeqCst) {
            return None;
        }

        debug!(run_id = %self.run_id, resource = key, "tearing down resource");
        match slot.factory.teardown(Arc::clone(handle)).await {
            Ok(()) => None,
            Err(message) => {
                warn!(run_id = %self.run_id, resource = key, error = %message, "resource teardown failed");
                Some(TeardownFailure {
                    key: key.to_string(),
                    message,
                })
            }
        }
    }
}
