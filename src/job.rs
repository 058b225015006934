use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Unique identifier of a job, assigned by the store at admission.
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
pub struct JobId(i64);

impl From<i64> for JobId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<JobId> for i64 {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

/// A unit of admitted work with lifecycle state.
///
/// The store is the single source of truth for this state; workers hold only
/// a transient copy while a handler executes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// The key selecting the registered handler.
    pub job_type: String,
    /// Opaque structured data passed to the handler. The queue does not
    /// validate its shape.
    pub payload: Value,
    /// Higher priority dispatches first among eligible jobs.
    pub priority: i32,
    pub status: JobStatus,
    /// Number of times this job has been claimed for execution.
    pub attempt: u16,
    pub max_attempts: u16,
    /// Earliest eligible dispatch time.
    pub run_at: DateTime<Utc>,
    pub dedupe_key: Option<String>,
    /// Failure history, most recent last.
    pub errors: Vec<JobError>,
    /// Handler output, set on completion.
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// The most recent failure, if any.
    pub fn last_error(&self) -> Option<&JobError> {
        self.errors.last()
    }

    pub(crate) fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// A job is eligible for claim iff it is at rest in a runnable state and
    /// its `run_at` has passed.
    pub(crate) fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        matches!(
            self.status,
            JobStatus::Pending | JobStatus::Delayed | JobStatus::Failed
        ) && self.run_at <= now
    }
}

/// Lifecycle state of a [`Job`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Admitted and eligible for dispatch.
    Pending,
    /// Admitted with a delay that has not yet elapsed.
    Delayed,
    /// Claimed by exactly one worker and currently executing.
    Active,
    /// Finished successfully.
    Completed,
    /// The last attempt failed; awaiting retry at `run_at`.
    Failed,
    /// Dead-lettered after exhausting `max_attempts`. Requires explicit
    /// replay to run again.
    Dead,
    /// Cancelled before execution.
    Cancelled,
}

impl JobStatus {
    /// Terminal states are never claimed and never leave on their own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Dead | Self::Cancelled)
    }
}

/// A single recorded failure of a job attempt.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub attempt: u16,
    pub kind: ErrorKind,
    pub message: String,
    pub recorded_at: DateTime<Utc>,
}

/// Classification of an attempt failure.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The handler panicked.
    Panic,
    /// The handler exceeded its declared execution duration.
    Timeout,
    /// Handler-reported failure, tagged with the handler's own error type.
    Other(String),
}

/// Read-only filter for [`crate::JobQueue::jobs`].
///
/// All set fields must match; an empty filter matches every job.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    job_type: Option<String>,
    statuses: Vec<JobStatus>,
    dedupe_key: Option<String>,
    run_before: Option<DateTime<Utc>>,
    run_after: Option<DateTime<Utc>>,
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    /// Match any of the given statuses.
    pub fn statuses(mut self, statuses: impl IntoIterator<Item = JobStatus>) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }

    pub fn status(self, status: JobStatus) -> Self {
        self.statuses([status])
    }

    pub fn dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    pub fn run_before(mut self, at: DateTime<Utc>) -> Self {
        self.run_before = Some(at);
        self
    }

    pub fn run_after(mut self, at: DateTime<Utc>) -> Self {
        self.run_after = Some(at);
        self
    }

    pub(crate) fn matches(&self, job: &Job) -> bool {
        self.job_type
            .as_ref()
            .map_or(true, |job_type| &job.job_type == job_type)
            && (self.statuses.is_empty() || self.statuses.contains(&job.status))
            && self
                .dedupe_key
                .as_ref()
                .map_or(true, |key| job.dedupe_key.as_ref() == Some(key))
            && self.run_before.map_or(true, |at| job.run_at < at)
            && self.run_after.map_or(true, |at| job.run_at > at)
    }
}
