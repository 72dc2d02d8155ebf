// src/engine/runtime.rs

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::errors::{PipedagError, Result};
use crate::exec::ExecutorBackend;
use crate::ledger::{Event, EventKind, LedgerStore, RunStatus};
use crate::plan::StepKey;
use crate::resources::{ResourceManager, TeardownFailure};
use crate::scheduler::StepDispatch;

use super::core::CoreRuntime;
use super::{CoreCommand, RuntimeEvent};

/// Drives one run in response to `RuntimeEvent`s and delegates compute to
/// an `ExecutorBackend`.
///
/// This is a pure IO shell around `CoreRuntime`, which contains all the
/// scheduling semantics. This struct handles async IO: reading events from
/// channels, writing the ledger, timers, and resource teardown.
pub struct Runtime<E: ExecutorBackend> {
    run_id: Uuid,
    core: CoreRuntime,
    event_rx: mpsc::Receiver<RuntimeEvent>,
    /// Used by retry and grace-period timers.
    event_tx: mpsc::Sender<RuntimeEvent>,
    executor: E,
    ledger: Arc<dyn LedgerStore>,
    resources: Arc<ResourceManager>,
    cancel: CancellationToken,
}

impl<E: ExecutorBackend> fmt::Debug for Runtime<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("run_id", &self.run_id)
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}

impl<E: ExecutorBackend> Runtime<E> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_id: Uuid,
        core: CoreRuntime,
        event_rx: mpsc::Receiver<RuntimeEvent>,
        event_tx: mpsc::Sender<RuntimeEvent>,
        executor: E,
        ledger: Arc<dyn LedgerStore>,
        resources: Arc<ResourceManager>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            run_id,
            core,
            event_rx,
            event_tx,
            executor,
            ledger,
            resources,
            cancel,
        }
    }

    /// Main event loop. Returns the terminal status of the run.
    ///
    /// - Starts the core, which records `RUN_STARTED` and dispatches roots.
    /// - Consumes `RuntimeEvent`s from `event_rx` and the cancellation token.
    /// - Executes commands returned by the core until it finishes the run.
    ///
    /// If the loop itself fails (ledger write, closed channel, executor
    /// error) in-flight steps are aborted and resources torn down before the
    /// error is returned.
    pub async fn run(mut self) -> Result<RunStatus> {
        info!(run_id = %self.run_id, "runtime started");

        match self.drive().await {
            Ok(status) => Ok(status),
            Err(err) => {
                self.shutdown_after_error(&err).await;
                Err(err)
            }
        }
    }

    async fn drive(&mut self) -> Result<RunStatus> {
        let step = self.core.start();
        if let Some(status) = self.execute_commands(step.commands).await? {
            return Ok(status);
        }

        let mut cancel_forwarded = false;
        loop {
            // Cancellation is checked first so a completion caused by the
            // cancel itself is seen after `CancelRequested`.
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled(), if !cancel_forwarded => {
                    cancel_forwarded = true;
                    RuntimeEvent::CancelRequested
                }
                maybe = self.event_rx.recv() => match maybe {
                    Some(e) => e,
                    None => {
                        return Err(PipedagError::Other(anyhow!(
                            "runtime event channel closed before the run finished"
                        )));
                    }
                },
            };

            debug!(?event, "runtime received event");

            // Feed the event into the pure core and get commands back.
            let step = self.core.step(event);
            if let Some(status) = self.execute_commands(step.commands).await? {
                return Ok(status);
            }
            if !step.keep_running {
                warn!("core stopped without finishing the run");
                return Ok(self.core.execution().run_status());
            }
        }
    }

    async fn shutdown_after_error(&mut self, err: &PipedagError) {
        let in_flight = self.core.execution().in_flight_keys();
        error!(
            run_id = %self.run_id,
            error = %err,
            in_flight = in_flight.len(),
            "runtime failed; aborting steps and tearing down resources"
        );
        if let Err(e) = self.executor.abort_steps(in_flight).await {
            warn!(error = %e, "failed to abort in-flight steps");
        }
        // The ledger may be what failed, so teardown failures are only logged.
        for failure in self.resources.teardown_all().await {
            warn!(resource = %failure.key, error = %failure.message, "resource teardown failed");
        }
    }

    /// Execute commands in order; `Some` once the run is finished.
    async fn execute_commands(&mut self, commands: Vec<CoreCommand>) -> Result<Option<RunStatus>> {
        for command in commands {
            if let Some(status) = self.execute_command(command).await? {
                return Ok(Some(status));
            }
        }
        Ok(None)
    }

    /// Execute a single command from the core.
    async fn execute_command(&mut self, command: CoreCommand) -> Result<Option<RunStatus>> {
        match command {
            CoreCommand::Record {
                step,
                attempt,
                kind,
            } => self.record(step, attempt, kind).await?,
            CoreCommand::Dispatch(dispatch) => self.dispatch(dispatch).await?,
            CoreCommand::ScheduleRetry { step, delay } => {
                self.send_after(delay, RuntimeEvent::RetryReady { step });
            }
            CoreCommand::CancelSteps(steps) => {
                info!(count = steps.len(), "asking running steps to stop");
                self.executor.cancel_steps(steps).await?;
            }
            CoreCommand::StartGracePeriod(period) => {
                self.send_after(period, RuntimeEvent::GraceExpired);
            }
            CoreCommand::AbortSteps(steps) => {
                warn!(count = steps.len(), "grace period expired; aborting running steps");
                self.executor.abort_steps(steps).await?;
            }
            CoreCommand::RegisterResourceUsers(users) => self.resources.register_users(&users),
            CoreCommand::ReleaseResources { step, keys } => {
                debug!(step = %step, ?keys, "releasing resources");
                let failures = self.resources.release(&keys).await;
                self.record_teardown_failures(failures).await?;
            }
            CoreCommand::Finish { status, reason } => {
                self.finish(status, reason).await?;
                return Ok(Some(status));
            }
        }
        Ok(None)
    }

    async fn dispatch(&mut self, dispatch: StepDispatch) -> Result<()> {
        debug!(step = %dispatch.key(), attempt = dispatch.attempt, "dispatching step");
        self.executor.dispatch(dispatch).await
    }

    async fn finish(&mut self, status: RunStatus, reason: Option<String>) -> Result<()> {
        let failures = self.resources.teardown_all().await;
        self.record_teardown_failures(failures).await?;

        let kind = match status {
            RunStatus::Success => EventKind::RunSuccess,
            RunStatus::Canceled => EventKind::RunCanceled,
            _ => EventKind::RunFailure {
                reason: reason.unwrap_or_else(|| "run failed".to_string()),
            },
        };
        self.record(None, 0, kind).await?;
        info!(run_id = %self.run_id, ?status, "run finished");
        Ok(())
    }

    async fn record_teardown_failures(&self, failures: Vec<TeardownFailure>) -> Result<()> {
        for failure in failures {
            warn!(resource = %failure.key, error = %failure.message, "resource teardown failed");
            self.record(
                None,
                0,
                EventKind::ResourceTeardownFailure {
                    resource: failure.key,
                    message: failure.message,
                },
            )
            .await?;
        }
        Ok(())
    }

    async fn record(&self, step: Option<StepKey>, attempt: u32, kind: EventKind) -> Result<()> {
        let event = match step {
            Some(key) => Event::step(self.run_id, key, attempt, kind),
            None => Event::run(self.run_id, kind),
        };
        self.ledger.append(self.run_id, event).await?;
        Ok(())
    }

    fn send_after(&self, delay: Duration, event: RuntimeEvent) {
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // The run may already be over.
            let _ = tx.send(event).await;
        });
    }
}
