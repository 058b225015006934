//! Outbound event channel for observability layers.
//!
//! Events are emitted strictly after the state transition they describe has
//! committed to the store. Delivery is fan-out over a broadcast channel;
//! subscribers that fall behind observe [`tokio::sync::broadcast::error::RecvError::Lagged`]
//! rather than blocking the dispatch loop.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::job::JobId;
use crate::scheduler::ScheduledJobId;

/// A state transition notification.
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// A job finished successfully.
    Completed { id: JobId, job_type: String },
    /// An attempt failed; the job will be retried at `retry_at`.
    Failed {
        id: JobId,
        job_type: String,
        attempt: u16,
        retry_at: DateTime<Utc>,
    },
    /// A job exhausted its attempts and was dead-lettered.
    DeadLettered {
        id: JobId,
        job_type: String,
        attempt: u16,
    },
    /// The scheduler fired an occurrence and admitted a job for it.
    ScheduledJobFired {
        id: ScheduledJobId,
        job_id: JobId,
        occurrence: DateTime<Utc>,
    },
}

#[derive(Debug, Clone)]
pub(crate) struct EventBus {
    sender: broadcast::Sender<JobEvent>,
}

impl EventBus {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }

    /// A send with no live subscribers is not an error.
    pub(crate) fn emit(&self, event: JobEvent) {
        let _ = self.sender.send(event);
    }
}
