use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, Instrument};

use crate::backoff::Strategy;
use crate::clock::Clock;
use crate::events::{EventBus, JobEvent};
use crate::handler::{Handler, HandlerError};
use crate::job::{ErrorKind, Job, JobError, JobId};
use crate::store::{JobStore, StoreError};

/// Claims eligible jobs from the store, sleeping until the next job is due
/// or a wake notification arrives.
struct ReadyJobs<S> {
    store: S,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    wake: mpsc::UnboundedReceiver<DateTime<Utc>>,
}

impl<S: JobStore> ReadyJobs<S> {
    const DELTA: Duration = Duration::from_millis(15);

    async fn next(&mut self) -> Result<Job, StoreError> {
        loop {
            let now = self.clock.now();
            let delay = match self.store.next_run_at(now).await? {
                Some(run_at) => (run_at - now)
                    .to_std()
                    .unwrap_or(Self::DELTA)
                    .min(self.poll_interval),
                None => self.poll_interval,
            };
            if delay <= Self::DELTA {
                if let Some(job) = self.store.claim_ready(now).await? {
                    return Ok(job);
                }
            }
            tokio::select! {
                _ = self.wake.recv() => {},
                _ = tokio::time::sleep(delay) => {},
            }
        }
    }
}

/// A single member of the queue's worker pool. Claims and executes one job at
/// a time until its cancellation token fires.
pub(crate) struct Worker<S> {
    id: usize,
    store: S,
    handlers: Arc<RwLock<HashMap<String, Arc<dyn Handler>>>>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    backoff: Arc<dyn Strategy + Send + Sync>,
    poll_interval: Duration,
    shutdown: CancellationToken,
}

impl<S: JobStore> Worker<S> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: usize,
        store: S,
        handlers: Arc<RwLock<HashMap<String, Arc<dyn Handler>>>>,
        events: EventBus,
        clock: Arc<dyn Clock>,
        backoff: Arc<dyn Strategy + Send + Sync>,
        poll_interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id,
            store,
            handlers,
            events,
            clock,
            backoff,
            poll_interval,
            shutdown,
        }
    }

    pub(crate) async fn run(self) {
        let mut ready = ReadyJobs {
            store: self.store.clone(),
            clock: self.clock.clone(),
            poll_interval: self.poll_interval,
            wake: self.store.subscribe(),
        };
        loop {
            tokio::select! {
                job = ready.next() => {
                    match job {
                        Ok(job) => self.execute(job).await,
                        Err(error) => {
                            tracing::error!(?error, "Failed to claim next job: {error}");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                },
                _ = self.shutdown.cancelled() => {
                    break;
                }
            }
        }
        tracing::debug!("Shutting down queue worker {}", self.id);
    }

    /// Runs a claimed job to a terminal or retryable outcome.
    ///
    /// The handler future runs in its own task so that a panic is contained
    /// and surfaced as an attempt failure rather than taking down the worker.
    #[instrument(skip(self, job), fields(job_id = %job.id, job_type = %job.job_type, attempt = job.attempt))]
    pub(crate) async fn execute(&self, job: Job) {
        let job_id = job.id;
        let job_type = job.job_type.clone();
        let attempt = job.attempt;
        let is_final_attempt = job.is_final_attempt();
        let delay = self.backoff.backoff(attempt);

        let handler = match self.handler_for(&job.job_type) {
            Some(handler) => handler,
            None => {
                // Registrations can change between admission and dispatch.
                let error = HandlerError::new(format!(
                    "no handler registered for job type `{job_type}`"
                ))
                .with_type("unknown_job_type");
                self.handle_error(
                    is_final_attempt,
                    job_id,
                    &job_type,
                    attempt,
                    delay,
                    ErrorKind::Other(error.error_type().to_owned()),
                    error.to_string(),
                )
                .await;
                return;
            }
        };

        let timeout = handler.timeout();
        tracing::debug!(%job_id, "Executing job {job_id}");
        let result = tokio::spawn(
            async move {
                match timeout {
                    Some(timeout) => tokio::time::timeout(timeout, handler.run(job)).await,
                    None => Ok(handler.run(job).await),
                }
            }
            .in_current_span(),
        );

        match result.await {
            Ok(Ok(Ok(value))) => self.handle_complete(job_id, &job_type, value).await,
            Ok(Ok(Err(error))) => {
                self.handle_error(
                    is_final_attempt,
                    job_id,
                    &job_type,
                    attempt,
                    delay,
                    ErrorKind::Other(error.error_type().to_owned()),
                    error.to_string(),
                )
                .await
            }
            Ok(Err(_elapsed)) => {
                let message = match timeout {
                    Some(timeout) => {
                        format!("Job failed to complete within timeout: {timeout:?}")
                    }
                    None => "Job failed to complete within timeout".to_owned(),
                };
                self.handle_error(
                    is_final_attempt,
                    job_id,
                    &job_type,
                    attempt,
                    delay,
                    ErrorKind::Timeout,
                    message,
                )
                .await
            }
            Err(join_error) => {
                let message = panic_message(join_error);
                self.handle_error(
                    is_final_attempt,
                    job_id,
                    &job_type,
                    attempt,
                    delay,
                    ErrorKind::Panic,
                    message,
                )
                .await
            }
        }
    }

    fn handler_for(&self, job_type: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.read().ok()?.get(job_type).cloned()
    }

    async fn handle_complete(&self, job_id: JobId, job_type: &str, result: Value) {
        tracing::debug!(%job_id, "Job complete {job_id}");
        let now = self.clock.now();
        match self.store.mark_completed(job_id, result, now).await {
            Ok(()) => self.events.emit(JobEvent::Completed {
                id: job_id,
                job_type: job_type.to_owned(),
            }),
            Err(err) => {
                tracing::error!(
                    ?err,
                    %job_id,
                    "Failed to mark job {job_id} as complete, error: {err:?}",
                );
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_error(
        &self,
        is_final_attempt: bool,
        job_id: JobId,
        job_type: &str,
        attempt: u16,
        delay: chrono::TimeDelta,
        kind: ErrorKind,
        message: String,
    ) {
        let now = self.clock.now();
        let error = JobError {
            attempt,
            kind,
            message,
            recorded_at: now,
        };
        if is_final_attempt {
            tracing::error!(
                %job_id,
                ?error,
                "Job {job_id} failed its final attempt and will be dead-lettered: {}",
                error.message,
            );
            match self.store.mark_failed(job_id, error, None, now).await {
                Ok(()) => self.events.emit(JobEvent::DeadLettered {
                    id: job_id,
                    job_type: job_type.to_owned(),
                    attempt,
                }),
                Err(err) => {
                    tracing::error!(
                        ?err,
                        %job_id,
                        "Failed to mark job {job_id} as dead, error: {err:?}",
                    );
                }
            }
        } else {
            let retry_at = now + delay;
            tracing::warn!(
                %job_id,
                ?error,
                "Job {job_id} failed and will be retried in {delay}: {}",
                error.message,
            );
            match self.store.mark_failed(job_id, error, Some(retry_at), now).await {
                Ok(()) => self.events.emit(JobEvent::Failed {
                    id: job_id,
                    job_type: job_type.to_owned(),
                    attempt,
                    retry_at,
                }),
                Err(err) => {
                    tracing::error!(
                        ?err,
                        %job_id,
                        "Failed to mark job {job_id} as failed, error: {err:?}",
                    );
                }
            }
        }
    }
}

fn panic_message(error: JoinError) -> String {
    let msg = error.to_string();
    match error.try_into_panic() {
        Ok(panic) => panic
            .downcast_ref::<&str>()
            .map(ToString::to_string)
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or(msg),
        Err(_) => msg,
    }
}
