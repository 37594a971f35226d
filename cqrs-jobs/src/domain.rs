//! `Job` and `JobExecution`: the entities the controller leases, heartbeats
//! and advances.
//!
//! Grounded on `original_source/background/domain.go`. Time is threaded
//! through as an explicit `DateTime<Utc>` parameter on every method that
//! needs "now" rather than calling a global clock, matching the
//! [`cqrs_core::Clock`] injection already used elsewhere in this workspace.

use chrono::{DateTime, Duration as ChronoDuration, DurationRound, Utc};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// The current status of one [`JobExecution`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// No execution has been scheduled yet.
    None,
    /// An execution is scheduled but not yet due, or due but not yet claimed.
    Waiting,
    /// An execution has been handed off to the command dispatch path and is
    /// awaiting the completion middleware's callback.
    Processing,
    /// The execution finished.
    Complete,
}

impl ExecutionStatus {
    /// The column value this status is stored as.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Waiting => "waiting",
            Self::Processing => "processing",
            Self::Complete => "complete",
        }
    }

    /// Parse a stored status column back into its enum value.
    ///
    /// # Errors
    ///
    /// [`JobError::UnknownStatus`] if `value` isn't one of the recognized
    /// column values.
    pub fn parse(value: &str) -> Result<Self, JobError> {
        match value {
            "none" => Ok(Self::None),
            "waiting" => Ok(Self::Waiting),
            "processing" => Ok(Self::Processing),
            "complete" => Ok(Self::Complete),
            other => Err(JobError::UnknownStatus(other.to_string())),
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by [`Job`]'s state transitions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// [`Job::schedule_next_execution`] was called on an inactive job.
    #[error("job is not active")]
    NotActive,

    /// [`Job::schedule_next_execution`] was called before `start_at` was set.
    #[error("job has no start time")]
    NoStartTime,

    /// A one-shot job (no `frequency_minutes`) already ran or has an
    /// execution recorded; it cannot be scheduled again.
    #[error("job is one-shot and has already run or been scheduled")]
    OneShotAlreadyUsed,

    /// [`Job::schedule_next_execution`] was called while an execution is
    /// still `Waiting` or `Processing`.
    #[error("job already has an execution waiting")]
    ExecutionAlreadyWaiting,

    /// [`Job::schedule_now`] was called on a job that isn't due.
    #[error("job is not due")]
    NotDue,

    /// A stored execution's status column held an unrecognized value.
    #[error("job has unknown status: {0}")]
    UnknownStatus(String),

    /// [`Job::complete`] was called with no executions recorded.
    #[error("job has no execution to complete")]
    NoExecutionToComplete,
}

/// A domain entity for a delayed or recurring execution task.
///
/// `task` is the command this job dispatches when due, already encoded in
/// the same wire format the durable queue carries its payloads in — the
/// controller never needs to know the command's concrete Rust type.
#[derive(Clone, Debug)]
pub struct Job {
    /// Stable identifier, also the queue/event correlation key.
    pub id: Uuid,
    /// A human-readable label; not unique.
    pub name: String,
    /// `None` for a one-shot job; `Some(minutes)` for a recurring one.
    pub frequency_minutes: Option<u32>,
    /// Whether this job was registered internally rather than by a user.
    pub system_job: bool,
    /// The encoded command this job dispatches when due.
    pub task: Vec<u8>,
    /// The user this job runs on behalf of, if any.
    pub user_id: Option<Uuid>,
    /// The worker currently holding this job's claim.
    pub worker: Option<Uuid>,
    /// When the owning worker last renewed its claim.
    pub heartbeat: Option<DateTime<Utc>>,
    /// Whether this job should still be scheduled.
    pub active: bool,
    /// The earliest time this job may run; required before scheduling.
    pub start_at: Option<DateTime<Utc>>,
    /// This job's executions, oldest first; the last one is the pending one.
    pub executions: Vec<JobExecution>,
    /// When this job was first registered.
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// A new job with the legal defaults the reference constructor applies:
    /// active, flagged as a system job, with no executions yet.
    #[must_use]
    pub fn new(name: impl Into<String>, task: Vec<u8>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            frequency_minutes: None,
            system_job: true,
            task,
            user_id: None,
            worker: None,
            heartbeat: None,
            active: true,
            start_at: None,
            executions: Vec::new(),
            created_at: now,
        }
    }

    #[must_use]
    pub const fn with_start_at(mut self, start_at: DateTime<Utc>) -> Self {
        self.start_at = Some(start_at);
        self
    }

    #[must_use]
    pub const fn with_frequency_minutes(mut self, minutes: u32) -> Self {
        self.frequency_minutes = Some(minutes);
        self
    }

    #[must_use]
    pub const fn with_user_id(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    #[must_use]
    pub const fn is_recurring(&self) -> bool {
        self.frequency_minutes.is_some()
    }

    #[must_use]
    pub fn next_execution(&self) -> Option<&JobExecution> {
        self.executions.last()
    }

    #[must_use]
    pub fn next_execution_status(&self) -> ExecutionStatus {
        self.next_execution().map_or(ExecutionStatus::None, |execution| execution.status)
    }

    /// Whether the pending execution is waiting, active, and its scheduled
    /// time has arrived.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_execution_status() == ExecutionStatus::Waiting
            && self.active
            && self.next_execution().is_some_and(|execution| execution.next <= now)
    }

    /// Move the pending execution from `Waiting` to `Processing`, recording
    /// when it was scheduled.
    ///
    /// # Errors
    ///
    /// [`JobError::NotDue`] if the job isn't currently due.
    pub fn schedule_now(&mut self, now: DateTime<Utc>) -> Result<(), JobError> {
        if !self.is_due(now) {
            return Err(JobError::NotDue);
        }
        let execution = self.executions.last_mut().ok_or(JobError::NotDue)?;
        execution.status = ExecutionStatus::Processing;
        execution.scheduled_at = Some(now);
        Ok(())
    }

    /// Mark the pending execution complete and, for a recurring job,
    /// schedule its successor; for a one-shot job, deactivate.
    ///
    /// # Errors
    ///
    /// [`JobError::NoExecutionToComplete`] if there is no execution to
    /// complete, or whatever [`Job::schedule_next_execution`] returns for a
    /// recurring job.
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<(), JobError> {
        {
            let execution = self.executions.last_mut().ok_or(JobError::NoExecutionToComplete)?;
            execution.status = ExecutionStatus::Complete;
            execution.completed_at = Some(now);
        }

        if self.is_recurring() {
            self.schedule_next_execution(now)
        } else {
            self.active = false;
            Ok(())
        }
    }

    /// Create the job's next pending execution.
    ///
    /// # Errors
    ///
    /// - [`JobError::NotActive`] if the job is inactive.
    /// - [`JobError::NoStartTime`] if `start_at` was never set.
    /// - [`JobError::OneShotAlreadyUsed`] if this is a one-shot job with an
    ///   execution already recorded.
    /// - [`JobError::ExecutionAlreadyWaiting`] if the pending execution
    ///   hasn't finished yet.
    pub fn schedule_next_execution(&mut self, now: DateTime<Utc>) -> Result<(), JobError> {
        if !self.active {
            return Err(JobError::NotActive);
        }
        let start_at = self.start_at.ok_or(JobError::NoStartTime)?;
        if self.frequency_minutes.is_none() && !self.executions.is_empty() {
            return Err(JobError::OneShotAlreadyUsed);
        }

        let next = match (self.frequency_minutes, self.next_execution_status()) {
            (None, _) | (Some(_), ExecutionStatus::None) => start_at,
            (Some(frequency), ExecutionStatus::Complete) => self.calculate_next_iteration(frequency, now),
            _ => return Err(JobError::ExecutionAlreadyWaiting),
        };

        self.add_execution(next);
        Ok(())
    }

    /// `max(lastScheduledFor + period, now)`, rounded to the period — catches
    /// up missed intervals without duplicating past ones.
    fn calculate_next_iteration(&self, frequency_minutes: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let period = ChronoDuration::minutes(i64::from(frequency_minutes));
        let last_scheduled = self.next_execution().map_or(now, |execution| execution.next);
        let proposed = last_scheduled + period;

        let rounded = if proposed < now { now } else { proposed };
        rounded.duration_round(period).unwrap_or(rounded)
    }

    fn add_execution(&mut self, next: DateTime<Utc>) {
        self.executions.push(JobExecution::new(self.id, next));
    }
}

/// A domain entity for one run of a [`Job`].
#[derive(Clone, Debug)]
pub struct JobExecution {
    /// Stable identifier.
    pub id: Uuid,
    /// The job this execution belongs to.
    pub job_id: Uuid,
    /// Where this execution is in its lifecycle.
    pub status: ExecutionStatus,
    /// When this execution is (or was) due to run.
    pub next: DateTime<Utc>,
    /// When the controller claimed this execution, if it has.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// When this execution finished, if it has.
    pub completed_at: Option<DateTime<Utc>>,
    /// When this execution was created.
    pub created_at: DateTime<Utc>,
}

impl JobExecution {
    fn new(job_id: Uuid, next: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            status: ExecutionStatus::Waiting,
            next,
            scheduled_at: None,
            completed_at: None,
            created_at: next,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        "2026-01-01T00:00:00Z".parse().unwrap_or_default()
    }

    fn job(now: DateTime<Utc>) -> Job {
        Job::new("SendDigest", vec![1, 2, 3], now).with_start_at(now)
    }

    #[test]
    fn none_status_schedules_the_first_execution() {
        let mut j = job(now());
        assert_eq!(j.next_execution_status(), ExecutionStatus::None);
        j.schedule_next_execution(now()).expect("should schedule");
        assert_eq!(j.next_execution_status(), ExecutionStatus::Waiting);
        assert_eq!(j.next_execution().expect("execution exists").next, now());
    }

    #[test]
    fn one_shot_job_cannot_be_scheduled_twice() {
        let mut j = job(now());
        j.schedule_next_execution(now()).expect("first schedule should succeed");
        let err = j.schedule_next_execution(now() + ChronoDuration::minutes(1)).unwrap_err();
        assert_eq!(err, JobError::ExecutionAlreadyWaiting);
    }

    #[test]
    fn is_due_requires_waiting_active_and_past_scheduled_time() {
        let mut j = job(now());
        assert!(!j.is_due(now()));
        j.schedule_next_execution(now()).expect("should schedule");
        assert!(j.is_due(now()));
        assert!(!j.is_due(now() - ChronoDuration::seconds(1)));
    }

    #[test]
    fn schedule_now_transitions_waiting_to_processing() {
        let mut j = job(now());
        j.schedule_next_execution(now()).expect("should schedule");
        j.schedule_now(now()).expect("should claim");
        assert_eq!(j.next_execution_status(), ExecutionStatus::Processing);
    }

    #[test]
    fn schedule_now_rejects_a_job_not_yet_due() {
        let mut j = job(now());
        j.schedule_next_execution(now() + ChronoDuration::minutes(5)).expect("should schedule");
        let err = j.schedule_now(now()).unwrap_err();
        assert_eq!(err, JobError::NotDue);
    }

    #[test]
    fn completing_a_one_shot_job_deactivates_it() {
        let mut j = job(now());
        j.schedule_next_execution(now()).expect("should schedule");
        j.schedule_now(now()).expect("should claim");
        j.complete(now()).expect("should complete");
        assert!(!j.active);
        assert_eq!(j.next_execution_status(), ExecutionStatus::Complete);
    }

    #[test]
    fn completing_a_recurring_job_schedules_the_next_iteration() {
        let mut j = job(now()).with_frequency_minutes(60);
        j.schedule_next_execution(now()).expect("should schedule");
        j.schedule_now(now()).expect("should claim");
        j.complete(now() + ChronoDuration::minutes(65)).expect("should complete");
        assert!(j.active);
        assert_eq!(j.next_execution_status(), ExecutionStatus::Waiting);
        assert!(j.next_execution().expect("execution exists").next >= now() + ChronoDuration::minutes(65));
    }

    #[test]
    fn calculate_next_iteration_catches_up_missed_intervals_without_duplication() {
        let mut j = job(now()).with_frequency_minutes(10);
        j.schedule_next_execution(now()).expect("should schedule");
        j.schedule_now(now()).expect("should claim");
        let far_future = now() + ChronoDuration::hours(5);
        j.complete(far_future).expect("should complete");
        let next = j.next_execution().expect("execution exists").next;
        assert!(next >= far_future);
        assert!(next < far_future + ChronoDuration::minutes(10));
    }

    #[test]
    fn execution_status_round_trips_through_its_string_form() {
        for status in [
            ExecutionStatus::None,
            ExecutionStatus::Waiting,
            ExecutionStatus::Processing,
            ExecutionStatus::Complete,
        ] {
            assert_eq!(ExecutionStatus::parse(status.as_str()).expect("parse should succeed"), status);
        }
    }

    #[test]
    fn unknown_status_string_is_rejected() {
        assert!(matches!(ExecutionStatus::parse("bogus"), Err(JobError::UnknownStatus(_))));
    }
}
