//! A background job queue and scheduler with pluggable handlers.
//!
//! `taskmill` provides the substrate on which domain-specific processors run
//! without each reimplementing retry, concurrency, or timing logic:
//!
//! - a [`JobQueue`] that admits units of work, dispatches them to registered
//!   handlers through a fixed-size worker pool, retries failures with backoff,
//!   and dead-letters jobs that exhaust their attempts,
//! - a [`JobScheduler`] that fires recurring or delayed jobs on a clock and
//!   admits concrete job instances into a target queue, and
//! - a narrow [`JobStore`] contract behind which any store supporting atomic
//!   conditional writes can be plugged in. [`InMemoryStore`] is provided as a
//!   correct reference implementation.
//!
//! Handlers are registered against a job type key at runtime. Delivery is
//! at-least-once: a handler can be re-invoked after a crash between execution
//! and completion bookkeeping, and must tolerate that.
//!
//! # Example
//!
//! ```
//! use taskmill::prelude::*;
//! use taskmill::store::memory::InMemoryStore;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
//! let queue = JobQueue::new(InMemoryStore::new());
//! queue.register_handler("render", handler_fn(|job: Job| async move {
//!     Ok(serde_json::json!({ "rendered": job.payload }))
//! }));
//!
//! let id = queue
//!     .add("render", serde_json::json!({ "video_id": "v1" }), JobOptions::default())
//!     .await
//!     .unwrap();
//!
//! queue.run_pending().await.unwrap();
//! assert_eq!(queue.job(id).await.unwrap().unwrap().status, JobStatus::Completed);
//! # });
//! ```

pub mod backoff;
pub mod clock;
pub mod events;
pub mod handler;
pub mod job;
pub mod prelude;
pub mod queue;
pub mod scheduler;
pub mod store;

use thiserror::Error;

use crate::store::StoreError;

pub use crate::events::JobEvent;
pub use crate::handler::{handler_fn, Handler, HandlerError, HandlerResult};
pub use crate::job::{Job, JobFilter, JobId, JobStatus};
pub use crate::queue::{JobOptions, JobQueue, QueueConfig};
pub use crate::scheduler::{
    CatchUp, JobScheduler, RecurrenceRule, ScheduleSpec, ScheduledJobId, SchedulerConfig,
};
pub use crate::store::memory::InMemoryStore;
pub use crate::store::JobStore;

/// The error type for queue and scheduler operations.
///
/// Handler failures are not represented here: they are caught at the dispatch
/// loop boundary and converted into retry or dead-letter transitions, and
/// never propagate to callers of the admission or scheduling APIs.
#[derive(Debug, Error)]
pub enum Error {
    /// The job type passed to [`JobQueue::add`] has no registered handler.
    #[error("no handler registered for job type `{0}`")]
    UnknownJobType(String),
    /// The recurrence rule is malformed or can never produce a future time.
    #[error("invalid recurrence rule: {0}")]
    InvalidRecurrenceRule(String),
    /// The job is currently executing and cannot be cancelled by the queue.
    #[error("job {0} is active and cannot be cancelled")]
    JobAlreadyActive(JobId),
    /// The job has already reached a terminal state.
    #[error("job {0} is already in a terminal state")]
    JobAlreadyTerminal(JobId),
    #[error("no scheduled job with id {0}")]
    ScheduledJobNotFound(ScheduledJobId),
    /// Error communicating with the backing job store.
    ///
    /// Surfaced synchronously: the queue does not silently drop work it
    /// cannot persist, and does not retry store failures itself.
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("error encoding or decoding a job payload")]
    Encode(#[from] serde_json::Error),
    #[error("failed to gracefully shut down")]
    ShutdownFailed,
    #[error("system in bad state")]
    BadState,
}
