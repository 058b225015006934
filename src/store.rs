//! The Job Store contract.
//!
//! The queue assumes a pluggable store behind this narrow contract rather
//! than a specific database. Any store must support atomic conditional
//! writes (all transitions compare on the current status), a ranged claim by
//! `(status, run_at, priority)`, and point lookup by id or dedupe key. The
//! contract is the operation set, not a byte layout.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::job::{Job, JobError, JobFilter, JobId, JobStatus};

pub mod memory;

/// Storage contract for job records and their state.
///
/// The store is the single source of truth; concurrent workers and the
/// scheduler rely on every mutation here being atomic and conditional on the
/// job's current status.
#[async_trait]
pub trait JobStore: Clone + Send + Sync + 'static {
    /// Inserts a job, or, when `dedupe_key` is set and a non-terminal job
    /// with the same key exists, returns that job's id without inserting.
    /// The lookup and insert must be a single atomic operation.
    async fn enqueue(&self, job: NewJob) -> Result<JobId, StoreError>;

    /// Atomically claims the highest-priority job with `run_at <= now`, ties
    /// broken by earliest `created_at`. Claiming transitions the job to
    /// [`JobStatus::Active`] and increments its attempt counter in the same
    /// operation, so no two callers can ever claim the same job.
    async fn claim_ready(&self, now: DateTime<Utc>) -> Result<Option<Job>, StoreError>;

    /// `Active -> Completed`, storing the handler result.
    async fn mark_completed(
        &self,
        id: JobId,
        result: Value,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Records a failed attempt. With `retry_at` the job transitions
    /// `Active -> Failed` and becomes claimable again at `retry_at`; without
    /// it the job is dead-lettered (`Active -> Dead`).
    async fn mark_failed(
        &self,
        id: JobId,
        error: JobError,
        retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// `Pending | Delayed | Failed -> Cancelled`. Any other current status
    /// fails with [`StoreError::InvalidTransition`].
    async fn mark_cancelled(&self, id: JobId, now: DateTime<Utc>) -> Result<(), StoreError>;

    /// `Dead -> Pending` with one extra permitted attempt. Explicit manual
    /// replay is the only way a dead-lettered job runs again.
    async fn mark_replayed(&self, id: JobId, now: DateTime<Utc>) -> Result<(), StoreError>;

    /// Point lookup by id.
    async fn job(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Read-only query for dashboards and monitoring.
    async fn query(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError>;

    /// The earliest `run_at` among jobs that are, or will become, claimable.
    /// Workers use this to sleep until work is due instead of busy-polling.
    async fn next_run_at(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Subscribes to wake notifications. The channel receives the `run_at`
    /// of any job that is inserted or becomes claimable.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<DateTime<Utc>>;
}

/// A job as handed to [`JobStore::enqueue`], before an id is assigned.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: String,
    pub payload: Value,
    pub priority: i32,
    pub max_attempts: u16,
    /// [`JobStatus::Pending`] or [`JobStatus::Delayed`].
    pub status: JobStatus,
    pub run_at: DateTime<Utc>,
    pub dedupe_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Errors surfaced by a [`JobStore`] implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    JobNotFound(JobId),
    /// The conditional write failed: the job was not in a status permitting
    /// the requested transition. Carries the status that was observed.
    #[error("job {id} is {status:?}; transition not permitted")]
    InvalidTransition { id: JobId, status: JobStatus },
    /// Infrastructure failure reaching the store. Callers must retry
    /// admission themselves; the queue never retries this.
    #[error("job store unavailable: {0}")]
    Unavailable(String),
    #[error("error encoding or decoding job data")]
    Encode(#[from] serde_json::Error),
    #[error("store in bad state")]
    BadState,
}
