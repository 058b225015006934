//! An in memory implementation of [`JobStore`].
//!
//! It is a correct (but not optimized) implementation: every mutation runs
//! under a single write lock, which makes the claim and the conditional
//! status transitions trivially atomic. Suitable for tests and small
//! single-process deployments; a production system would put a real database
//! behind the [`JobStore`] contract instead.

use std::sync::{
    atomic::{AtomicBool, AtomicI64, Ordering},
    Arc, RwLock,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;

use super::{JobStore, NewJob, StoreError};
use crate::job::{Job, JobError, JobFilter, JobId, JobStatus};

type Subscriber = mpsc::UnboundedSender<DateTime<Utc>>;

/// An in memory [`JobStore`].
#[derive(Clone, Default)]
pub struct InMemoryStore {
    jobs: Arc<RwLock<Vec<Job>>>,
    id_counter: Arc<AtomicI64>,
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
    paused: Arc<AtomicBool>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the store in paused mode where subscribers are not woken when jobs
    /// are inserted or become claimable. Jobs accumulate untouched until
    /// [`InMemoryStore::notify_all`] is called or a worker poll interval
    /// elapses. Useful for asserting on enqueued-but-unprocessed jobs.
    pub fn paused(self) -> Self {
        self.paused.store(true, Ordering::Relaxed);
        self
    }

    /// Wake all subscribers. Particularly helpful in paused mode.
    pub fn notify_all(&self) -> Result<(), StoreError> {
        let now = Utc::now();
        self.subscribers
            .read()
            .map_err(|_| StoreError::BadState)?
            .iter()
            .for_each(|sender| {
                let _ = sender.send(now);
            });
        Ok(())
    }

    fn notify_subscribers(&self, run_at: DateTime<Utc>) -> Result<(), StoreError> {
        if !self.paused.load(Ordering::Relaxed) {
            self.subscribers
                .read()
                .map_err(|_| StoreError::BadState)?
                .iter()
                .for_each(|sender| {
                    let _ = sender.send(run_at);
                });
        }
        Ok(())
    }

    fn with_job<T>(
        &self,
        id: JobId,
        apply: impl FnOnce(&mut Job) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        match jobs.iter_mut().find(|job| job.id == id) {
            None => Err(StoreError::JobNotFound(id)),
            Some(job) => apply(job),
        }
    }
}

impl NewJob {
    fn into_job(self, id: i64) -> Job {
        Job {
            id: id.into(),
            job_type: self.job_type,
            payload: self.payload,
            priority: self.priority,
            status: self.status,
            attempt: 0,
            max_attempts: self.max_attempts,
            run_at: self.run_at,
            dedupe_key: self.dedupe_key,
            errors: vec![],
            result: None,
            created_at: self.created_at,
            updated_at: self.created_at,
        }
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn enqueue(&self, job: NewJob) -> Result<JobId, StoreError> {
        let run_at = job.run_at;
        let id = {
            let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
            if let Some(key) = job.dedupe_key.as_deref() {
                // Idempotent enqueue: an existing non-terminal job with the
                // same key wins over the new insert.
                if let Some(existing) = jobs
                    .iter()
                    .find(|job| !job.status.is_terminal() && job.dedupe_key.as_deref() == Some(key))
                {
                    return Ok(existing.id);
                }
            }
            let id = self.id_counter.fetch_add(1, Ordering::SeqCst);
            jobs.push(job.into_job(id));
            id
        };

        self.notify_subscribers(run_at)?;

        Ok(id.into())
    }

    async fn claim_ready(&self, now: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let mut best: Option<usize> = None;
        for (index, job) in jobs.iter().enumerate() {
            if !job.is_claimable(now) {
                continue;
            }
            best = match best {
                None => Some(index),
                Some(current) => {
                    let current_job = &jobs[current];
                    if job.priority > current_job.priority
                        || (job.priority == current_job.priority
                            && (job.created_at, job.id) < (current_job.created_at, current_job.id))
                    {
                        Some(index)
                    } else {
                        Some(current)
                    }
                }
            };
        }
        Ok(best.map(|index| {
            let job = &mut jobs[index];
            job.status = JobStatus::Active;
            job.attempt += 1;
            job.updated_at = now;
            job.clone()
        }))
    }

    async fn mark_completed(
        &self,
        id: JobId,
        result: Value,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.with_job(id, |job| match job.status {
            JobStatus::Active => {
                job.status = JobStatus::Completed;
                job.result = Some(result);
                job.updated_at = now;
                Ok(())
            }
            status => Err(StoreError::InvalidTransition { id, status }),
        })
    }

    async fn mark_failed(
        &self,
        id: JobId,
        error: JobError,
        retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.with_job(id, |job| match job.status {
            JobStatus::Active => {
                job.errors.push(error);
                job.updated_at = now;
                match retry_at {
                    Some(retry_at) => {
                        job.status = JobStatus::Failed;
                        job.run_at = retry_at;
                    }
                    None => job.status = JobStatus::Dead,
                }
                Ok(())
            }
            status => Err(StoreError::InvalidTransition { id, status }),
        })?;
        if let Some(retry_at) = retry_at {
            self.notify_subscribers(retry_at)?;
        }
        Ok(())
    }

    async fn mark_cancelled(&self, id: JobId, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.with_job(id, |job| match job.status {
            JobStatus::Pending | JobStatus::Delayed | JobStatus::Failed => {
                job.status = JobStatus::Cancelled;
                job.updated_at = now;
                Ok(())
            }
            status => Err(StoreError::InvalidTransition { id, status }),
        })
    }

    async fn mark_replayed(&self, id: JobId, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.with_job(id, |job| match job.status {
            JobStatus::Dead => {
                job.status = JobStatus::Pending;
                job.run_at = now;
                job.max_attempts += 1;
                job.updated_at = now;
                Ok(())
            }
            status => Err(StoreError::InvalidTransition { id, status }),
        })?;
        self.notify_subscribers(now)
    }

    async fn job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self
            .jobs
            .read()
            .map_err(|_| StoreError::BadState)?
            .iter()
            .find(|job| job.id == id)
            .cloned())
    }

    async fn query(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        Ok(self
            .jobs
            .read()
            .map_err(|_| StoreError::BadState)?
            .iter()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect())
    }

    async fn next_run_at(&self, _now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .jobs
            .read()
            .map_err(|_| StoreError::BadState)?
            .iter()
            .filter(|job| {
                matches!(
                    job.status,
                    JobStatus::Pending | JobStatus::Delayed | JobStatus::Failed
                )
            })
            .map(|job| job.run_at)
            .min())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<DateTime<Utc>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        if let Ok(mut subscribers) = self.subscribers.write() {
            subscribers.push(sender);
        }
        receiver
    }
}

#[cfg(test)]
pub(crate) mod test {
    use assert_matches::assert_matches;
    use chrono::TimeDelta;

    use super::*;
    use crate::job::ErrorKind;

    impl NewJob {
        pub(crate) fn mock_job() -> Self {
            // Timestamped in the past so tests can claim with an instant
            // captured before the enqueue.
            let now = Utc::now() - TimeDelta::seconds(1);
            Self {
                job_type: "render".to_owned(),
                payload: Value::String("data".to_owned()),
                priority: 0,
                max_attempts: 5,
                status: JobStatus::Pending,
                run_at: now,
                dedupe_key: None,
                created_at: now,
            }
        }

        pub(crate) fn with_priority(self, priority: i32) -> Self {
            Self { priority, ..self }
        }

        pub(crate) fn with_run_at(self, run_at: DateTime<Utc>) -> Self {
            Self { run_at, ..self }
        }

        pub(crate) fn with_created_at(self, created_at: DateTime<Utc>) -> Self {
            Self { created_at, ..self }
        }

        pub(crate) fn with_dedupe_key(self, key: impl Into<String>) -> Self {
            Self {
                dedupe_key: Some(key.into()),
                ..self
            }
        }
    }

    pub(crate) fn mock_error(attempt: u16) -> JobError {
        JobError {
            attempt,
            kind: ErrorKind::Other("custom".to_owned()),
            message: "boom".to_owned(),
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn enqueue_and_lookup() {
        let store = InMemoryStore::new();
        let id = store.enqueue(NewJob::mock_job()).await.unwrap();

        let job = store.job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempt, 0);
        assert_eq!(job.job_type, "render");

        assert!(store.job(JobId::from(999)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn enqueue_dedupes_against_non_terminal_jobs() {
        let store = InMemoryStore::new();
        let now = Utc::now();

        let first = store
            .enqueue(NewJob::mock_job().with_dedupe_key("video:v1"))
            .await
            .unwrap();
        let second = store
            .enqueue(NewJob::mock_job().with_dedupe_key("video:v1"))
            .await
            .unwrap();
        assert_eq!(first, second);

        // Once the keyed job reaches a terminal state the key is free again.
        let claimed = store.claim_ready(now).await.unwrap().unwrap();
        assert_eq!(claimed.id, first);
        store
            .mark_completed(first, Value::Null, now)
            .await
            .unwrap();

        let third = store
            .enqueue(NewJob::mock_job().with_dedupe_key("video:v1"))
            .await
            .unwrap();
        assert_ne!(first, third);
    }

    #[tokio::test]
    async fn claim_prefers_priority_then_fifo() {
        let store = InMemoryStore::new();
        let now = Utc::now();

        let low_old = store
            .enqueue(
                NewJob::mock_job()
                    .with_priority(1)
                    .with_created_at(now - TimeDelta::minutes(2)),
            )
            .await
            .unwrap();
        let high = store
            .enqueue(NewJob::mock_job().with_priority(5))
            .await
            .unwrap();
        let low_new = store
            .enqueue(
                NewJob::mock_job()
                    .with_priority(1)
                    .with_created_at(now - TimeDelta::minutes(1)),
            )
            .await
            .unwrap();

        let order: Vec<JobId> = [
            store.claim_ready(now).await.unwrap().unwrap().id,
            store.claim_ready(now).await.unwrap().unwrap().id,
            store.claim_ready(now).await.unwrap().unwrap().id,
        ]
        .into();
        assert_eq!(order, vec![high, low_old, low_new]);
        assert!(store.claim_ready(now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_skips_future_run_at() {
        let store = InMemoryStore::new();
        let now = Utc::now();

        store
            .enqueue(NewJob::mock_job().with_run_at(now + TimeDelta::minutes(5)))
            .await
            .unwrap();
        assert!(store.claim_ready(now).await.unwrap().is_none());
        assert!(store
            .claim_ready(now + TimeDelta::minutes(5))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn claim_increments_attempt_and_activates() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let id = store.enqueue(NewJob::mock_job()).await.unwrap();

        let claimed = store.claim_ready(now).await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.status, JobStatus::Active);
        assert_eq!(claimed.attempt, 1);

        // An active job cannot be claimed again.
        assert!(store.claim_ready(now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mark_failed_with_retry_reschedules() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let id = store.enqueue(NewJob::mock_job()).await.unwrap();
        store.claim_ready(now).await.unwrap().unwrap();

        let retry_at = now + TimeDelta::seconds(30);
        store
            .mark_failed(id, mock_error(1), Some(retry_at), now)
            .await
            .unwrap();

        let job = store.job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.run_at, retry_at);
        assert_eq!(job.last_error().unwrap().message, "boom");

        assert!(store.claim_ready(now).await.unwrap().is_none());
        let reclaimed = store.claim_ready(retry_at).await.unwrap().unwrap();
        assert_eq!(reclaimed.attempt, 2);
    }

    #[tokio::test]
    async fn mark_failed_without_retry_dead_letters() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let id = store.enqueue(NewJob::mock_job()).await.unwrap();
        store.claim_ready(now).await.unwrap().unwrap();

        store.mark_failed(id, mock_error(1), None, now).await.unwrap();

        let job = store.job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Dead);
        assert!(store.claim_ready(now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn transitions_are_conditional_on_status() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let id = store.enqueue(NewJob::mock_job()).await.unwrap();

        // Not active: completion and failure bookkeeping are rejected.
        assert_matches!(
            store.mark_completed(id, Value::Null, now).await,
            Err(StoreError::InvalidTransition {
                status: JobStatus::Pending,
                ..
            })
        );
        assert_matches!(
            store.mark_failed(id, mock_error(1), None, now).await,
            Err(StoreError::InvalidTransition { .. })
        );
        // Not dead: replay is rejected.
        assert_matches!(
            store.mark_replayed(id, now).await,
            Err(StoreError::InvalidTransition { .. })
        );

        store.claim_ready(now).await.unwrap().unwrap();
        // Active: cancellation is rejected.
        assert_matches!(
            store.mark_cancelled(id, now).await,
            Err(StoreError::InvalidTransition {
                status: JobStatus::Active,
                ..
            })
        );

        store.mark_completed(id, Value::Null, now).await.unwrap();
        // Terminal: everything is rejected.
        assert_matches!(
            store.mark_cancelled(id, now).await,
            Err(StoreError::InvalidTransition {
                status: JobStatus::Completed,
                ..
            })
        );

        assert_matches!(
            store.mark_completed(JobId::from(999), Value::Null, now).await,
            Err(StoreError::JobNotFound(_))
        );
    }

    #[tokio::test]
    async fn cancel_pending_job() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let id = store.enqueue(NewJob::mock_job()).await.unwrap();

        store.mark_cancelled(id, now).await.unwrap();
        let job = store.job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(store.claim_ready(now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn replay_gives_dead_job_one_more_attempt() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let id = store
            .enqueue(NewJob::mock_job())
            .await
            .unwrap();
        store.claim_ready(now).await.unwrap().unwrap();
        store.mark_failed(id, mock_error(1), None, now).await.unwrap();

        store.mark_replayed(id, now).await.unwrap();

        let job = store.job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.max_attempts, 6);
        assert_eq!(job.attempt, 1);
    }

    #[tokio::test]
    async fn next_run_at_reports_earliest_claimable() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        assert!(store.next_run_at(now).await.unwrap().is_none());

        let soon = now + TimeDelta::seconds(10);
        let later = now + TimeDelta::minutes(10);
        store
            .enqueue(NewJob::mock_job().with_run_at(later))
            .await
            .unwrap();
        store
            .enqueue(NewJob::mock_job().with_run_at(soon))
            .await
            .unwrap();

        assert_eq!(store.next_run_at(now).await.unwrap(), Some(soon));
    }

    #[tokio::test]
    async fn enqueue_wakes_subscribers_unless_paused() {
        let store = InMemoryStore::new();
        let mut wake = store.subscribe();
        store.enqueue(NewJob::mock_job()).await.unwrap();
        assert!(wake.try_recv().is_ok());

        let paused = InMemoryStore::new().paused();
        let mut wake = paused.subscribe();
        paused.enqueue(NewJob::mock_job()).await.unwrap();
        assert!(wake.try_recv().is_err());

        paused.notify_all().unwrap();
        assert!(wake.try_recv().is_ok());
    }
}
