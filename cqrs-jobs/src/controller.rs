//! Ticks the job table: claims due jobs for this worker, advances their
//! executions, and hands due tasks off to the dispatch path.
//!
//! Grounded on `original_source/background/controller.go`'s `Controller`:
//! `manageJobs` (claim + heartbeat) and `manageExecutions` (advance each
//! owned job) run every tick, both always run even if one fails, and
//! errors accumulate rather than aborting the tick early. Ten consecutive
//! failed ticks stops the controller, mirroring the reference's
//! `failures >= 10` panic.
//!
//! The reference's `Block` wires the controller's ticker up to an ad hoc
//! `signal.Notify` of its own. Here the controller is just another
//! [`cqrs_ports::Port`], so it shares the same OS-signal handling and
//! forced-exit deadline every other port in the process does instead of
//! running its own.

use crate::domain::{ExecutionStatus, Job, JobError};
use crate::store::{JobStore, JobStoreError};
use cqrs_core::{Clock, DispatchContext, FrameworkError};
use cqrs_ports::{Port, PortError};
use futures::future::BoxFuture;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// How often the controller ticks by default.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(5);

/// Consecutive failed ticks before the controller gives up and fails the
/// port, taking the rest of the process's ports down with it.
pub const FAILURE_LIMIT: u32 = 10;

/// Errors a single controller tick can raise.
#[derive(Error, Debug)]
pub enum ControllerError {
    /// Loading or persisting a job failed.
    #[error("job store error: {0}")]
    Store(#[from] JobStoreError),

    /// A job's state transition was illegal.
    #[error("job state error: {0}")]
    State(#[from] JobError),

    /// The registered [`QueueAction`] failed to dispatch a due task.
    #[error("queue action failed: {0}")]
    QueueAction(#[from] FrameworkError),
}

/// Hands a due job's decoded task off to whatever dispatches commands —
/// the bus, in a full deployment.
///
/// Grounded on the reference's `RegisterQueueAction(qa queueAction)`: the
/// reference source notes its own `queueAction` indirection exists because
/// the background package has no direct way to reference the concrete bus
/// command type, and resolves it with exactly this kind of registered
/// callback rather than an import. The same tension applies here — `cqrs-jobs`
/// only depends on `cqrs-core`/`cqrs-router`/`cqrs-ports`, not `cqrs-bus` —
/// so the controller is handed a callback instead of a bus handle.
pub type QueueAction =
    Arc<dyn Fn(DispatchContext, Vec<u8>) -> BoxFuture<'static, Result<(), FrameworkError>> + Send + Sync>;

/// Ticks the job table for one worker.
pub struct Controller {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    worker_id: Uuid,
    tick_interval: Duration,
    queue_action: QueueAction,
}

impl Controller {
    /// A controller for `worker_id`, using `store` for persistence and
    /// `clock` for "now", dispatching due tasks through `queue_action`.
    #[must_use]
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>, worker_id: Uuid, queue_action: QueueAction) -> Self {
        Self { store, clock, worker_id, tick_interval: DEFAULT_TICK_INTERVAL, queue_action }
    }

    #[must_use]
    pub const fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    #[must_use]
    pub const fn worker_id(&self) -> Uuid {
        self.worker_id
    }

    /// Run a single tick: claim, heartbeat, then advance every owned job.
    /// Both actions always run; their errors are collected rather than
    /// short-circuiting each other, matching `runActions`.
    async fn tick(&self) -> Vec<ControllerError> {
        let mut errors = Vec::new();
        if let Err(error) = self.manage_jobs().await {
            errors.push(error);
        }
        if let Err(error) = self.manage_executions().await {
            errors.push(error);
        }
        errors
    }

    async fn manage_jobs(&self) -> Result<(), ControllerError> {
        let now = self.clock.now();
        self.store.claim_for(self.worker_id, now).await?;
        self.store.heartbeat(self.worker_id, now).await?;
        Ok(())
    }

    async fn manage_executions(&self) -> Result<(), ControllerError> {
        let jobs = self.store.get_for(self.worker_id).await?;
        for job in jobs {
            if let Err(error) = self.advance_job(job).await {
                warn!(%error, "failed to advance job");
            }
        }
        Ok(())
    }

    /// The transition table from the reference `advanceJob`: `None` job
    /// schedule their first execution; a due `Waiting` execution is claimed
    /// and queued (the store write happens before queueing, preventing a
    /// second worker from claiming the same due execution while this one is
    /// in flight); `Processing` is left alone — it's awaiting the completion
    /// middleware; `Complete` either does nothing (recurring — the
    /// completion middleware already scheduled the next one) or schedules a
    /// fresh execution (one-shot, re-activated since the last run).
    async fn advance_job(&self, mut job: Job) -> Result<(), ControllerError> {
        let now = self.clock.now();
        match job.next_execution_status() {
            ExecutionStatus::None => {
                job.schedule_next_execution(now)?;
                self.store.store(job).await?;
            }
            ExecutionStatus::Waiting if job.is_due(now) => {
                job.schedule_now(now)?;
                self.store.store(job.clone()).await?;
                self.queue_job(&job).await?;
            }
            ExecutionStatus::Waiting | ExecutionStatus::Processing => {}
            ExecutionStatus::Complete if job.is_recurring() => {}
            ExecutionStatus::Complete => {
                job.schedule_next_execution(now)?;
                self.store.store(job).await?;
            }
        }
        Ok(())
    }

    async fn queue_job(&self, job: &Job) -> Result<(), ControllerError> {
        let ctx = DispatchContext::new().with_job_id(job.id);
        (self.queue_action)(ctx, job.task.clone()).await?;
        Ok(())
    }

    /// Mark a job's in-flight execution complete and persist it. Called by
    /// the completion middleware once the command it queued has run,
    /// regardless of whether that command succeeded — mirroring the
    /// reference's `FinishTaskForJob`, invoked unconditionally by
    /// `JobFinishingMiddleware`.
    ///
    /// # Errors
    ///
    /// Propagates [`JobStoreError`] if the job can't be loaded or persisted,
    /// or [`JobError`] if it has no execution to complete.
    pub async fn finish_task_for_job(&self, job_id: Uuid) -> Result<(), ControllerError> {
        let mut job = self.store.get_one(job_id).await?;
        let now = self.clock.now();
        job.complete(now)?;
        self.store.store(job).await?;
        Ok(())
    }
}

impl Port for Controller {
    fn run(&self, cancellation: CancellationToken) -> Pin<Box<dyn Future<Output = Result<(), PortError>> + Send + '_>> {
        Box::pin(async move {
            info!(worker_id = %self.worker_id, "background controller starting");
            let mut interval = tokio::time::interval(self.tick_interval);
            let mut failures: u32 = 0;

            loop {
                tokio::select! {
                    () = cancellation.cancelled() => break,
                    _ = interval.tick() => {
                        let tick_errors = self.tick().await;
                        if tick_errors.is_empty() {
                            failures = 0;
                        } else {
                            failures += 1;
                            for tick_error in &tick_errors {
                                error!(error = %tick_error, failures, "background controller tick failed");
                            }
                            if failures >= FAILURE_LIMIT {
                                return Err(PortError::Failed(format!(
                                    "background controller failed {failures} consecutive ticks"
                                )));
                            }
                        }
                    }
                }
            }

            info!(worker_id = %self.worker_id, "background controller stopped");
            Ok(())
        })
    }
}
