//! Job admission, dispatch, and lifecycle management.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::TimeDelta;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backoff::{BackoffStrategy, Jitter, Strategy};
use crate::clock::{Clock, SystemClock};
use crate::events::{EventBus, JobEvent};
use crate::handler::Handler;
use crate::job::{Job, JobFilter, JobId, JobStatus};
use crate::store::{JobStore, NewJob, StoreError};
use crate::Error;

pub(crate) mod worker;

use worker::Worker;

/// The default backoff for failed jobs: exponential with an initial backoff
/// of 4 seconds, a max of seven days, and a 10% jitter margin.
const DEFAULT_BACKOFF: BackoffStrategy<crate::backoff::Exponential> =
    BackoffStrategy::exponential(TimeDelta::seconds(4))
        .with_max(TimeDelta::days(7))
        .with_jitter(Jitter::Relative(0.1));

const DEFAULT_MAX_ATTEMPTS: u16 = 5;

/// Per-job admission options for [`JobQueue::add`].
#[derive(Debug, Clone)]
pub struct JobOptions {
    priority: i32,
    delay: TimeDelta,
    max_attempts: Option<u16>,
    dedupe_key: Option<String>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            delay: TimeDelta::zero(),
            max_attempts: None,
            dedupe_key: None,
        }
    }
}

impl JobOptions {
    /// Higher priority dispatches first among eligible jobs.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Delay the earliest eligible dispatch time by `delay` from now.
    pub fn with_delay(mut self, delay: TimeDelta) -> Self {
        self.delay = delay;
        self
    }

    /// Override the queue-wide default attempt limit for this job.
    pub fn with_max_attempts(mut self, max_attempts: u16) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Make the enqueue idempotent: while a job with the same key is
    /// non-terminal, re-admission returns the existing job's id.
    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }
}

/// Configuration for a [`JobQueue`].
#[derive(Clone)]
pub struct QueueConfig {
    concurrency: usize,
    default_max_attempts: u16,
    backoff: Arc<dyn Strategy + Send + Sync>,
    event_capacity: usize,
    poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Arc::new(DEFAULT_BACKOFF),
            event_capacity: 128,
            poll_interval: Duration::from_secs(30),
        }
    }
}

impl QueueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of workers, i.e. the maximum number of simultaneously active
    /// jobs regardless of queue depth.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Attempt limit applied when [`JobOptions::with_max_attempts`] is not
    /// set.
    pub fn with_default_max_attempts(mut self, max_attempts: u16) -> Self {
        self.default_max_attempts = max_attempts.max(1);
        self
    }

    /// Retry backoff strategy, see [`crate::backoff`].
    pub fn with_backoff(mut self, backoff: impl Strategy + Send + Sync + 'static) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    /// Buffer size of the event broadcast channel.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Upper bound on how long an idle worker sleeps between polls when no
    /// wake notification arrives.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

type HandlerRegistry = Arc<RwLock<HashMap<String, Arc<dyn Handler>>>>;

/// A durable queue of jobs dispatched to registered handlers by a pool of
/// workers.
///
/// Constructed explicitly with a store dependency and passed by reference to
/// producers and handlers; there is no process-wide instance. The worker pool
/// is started with [`JobQueue::start`] and stopped with
/// [`JobQueue::shutdown`].
pub struct JobQueue<S: JobStore> {
    store: S,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    handlers: HandlerRegistry,
    events: EventBus,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: JobStore> JobQueue<S> {
    pub fn new(store: S) -> Self {
        Self::with_config(store, QueueConfig::default())
    }

    pub fn with_config(store: S, config: QueueConfig) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            events: EventBus::new(config.event_capacity),
            config,
            handlers: Default::default(),
            shutdown: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Replace the time source, primarily for deterministic tests.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Associates a job type with a handler.
    ///
    /// Re-registration for the same type overwrites the previous handler —
    /// an explicit override mechanism supporting handler hot-swapping in
    /// tests, not an error.
    pub fn register_handler(&self, job_type: impl Into<String>, handler: impl Handler + 'static) {
        let job_type = job_type.into();
        if let Ok(mut handlers) = self.handlers.write() {
            if handlers
                .insert(job_type.clone(), Arc::new(handler))
                .is_some()
            {
                tracing::debug!(job_type, "replaced handler for job type {job_type}");
            }
        }
    }

    /// Admits a job.
    ///
    /// Fails with [`Error::UnknownJobType`] when no handler is registered for
    /// `job_type`. Never blocks on handler execution. With a dedupe key, an
    /// existing non-terminal job with the same key makes this call a no-op
    /// returning that job's id.
    pub async fn add(
        &self,
        job_type: &str,
        payload: impl Serialize,
        options: JobOptions,
    ) -> Result<JobId, Error> {
        if !self
            .handlers
            .read()
            .map_err(|_| Error::BadState)?
            .contains_key(job_type)
        {
            return Err(Error::UnknownJobType(job_type.to_owned()));
        }

        let now = self.clock.now();
        let delayed = options.delay > TimeDelta::zero();
        let job = NewJob {
            job_type: job_type.to_owned(),
            payload: serde_json::to_value(payload)?,
            priority: options.priority,
            max_attempts: options
                .max_attempts
                .unwrap_or(self.config.default_max_attempts),
            status: if delayed {
                JobStatus::Delayed
            } else {
                JobStatus::Pending
            },
            run_at: now + options.delay,
            dedupe_key: options.dedupe_key,
            created_at: now,
        };

        let id = self.store.enqueue(job).await?;
        tracing::debug!(%id, job_type, "enqueued job {id}");
        Ok(id)
    }

    /// Cancels a job that has not started executing.
    ///
    /// An active job cannot be cancelled mid-execution by the queue; handlers
    /// must implement their own cooperative cancellation if they need it.
    pub async fn cancel(&self, id: JobId) -> Result<(), Error> {
        let now = self.clock.now();
        self.store
            .mark_cancelled(id, now)
            .await
            .map_err(|error| match error {
                StoreError::InvalidTransition {
                    status: JobStatus::Active,
                    ..
                } => Error::JobAlreadyActive(id),
                StoreError::InvalidTransition { status, .. } if status.is_terminal() => {
                    Error::JobAlreadyTerminal(id)
                }
                error => error.into(),
            })
    }

    /// Manually replays a dead-lettered job, permitting exactly one more
    /// attempt. The queue never resurrects dead jobs on its own.
    pub async fn replay(&self, id: JobId) -> Result<(), Error> {
        let now = self.clock.now();
        Ok(self.store.mark_replayed(id, now).await?)
    }

    /// Point lookup, read-only.
    pub async fn job(&self, id: JobId) -> Result<Option<Job>, Error> {
        Ok(self.store.job(id).await?)
    }

    /// Filtered listing for dashboards and monitoring, read-only.
    pub async fn jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, Error> {
        Ok(self.store.query(filter).await?)
    }

    /// Subscribe to [`JobEvent`]s. Events are emitted after the transition
    /// they describe has committed.
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Starts the worker pool: `concurrency` workers, each claiming and
    /// executing one job at a time.
    pub fn start(&self) {
        if let Ok(mut workers) = self.workers.lock() {
            for worker_id in 0..self.config.concurrency {
                let worker = self.worker(worker_id);
                workers.push(tokio::spawn(worker.run()));
            }
            tracing::debug!(count = self.config.concurrency, "started queue workers");
        }
    }

    /// Signals all workers to stop and waits for them to drain their current
    /// job.
    pub async fn shutdown(&self) -> Result<(), Error> {
        tracing::debug!("shutting down job queue");
        self.shutdown.cancel();
        let handles: Vec<_> = {
            let mut workers = self.workers.lock().map_err(|_| Error::ShutdownFailed)?;
            workers.drain(..).collect()
        };
        for handle in futures::future::join_all(handles).await {
            handle.map_err(|_| Error::ShutdownFailed)?;
        }
        Ok(())
    }

    /// Claims and executes eligible jobs inline until none remain, returning
    /// how many were executed.
    ///
    /// Deterministic alternative to [`JobQueue::start`] for tests: combined
    /// with a [`crate::clock::ManualClock`] it processes exactly the jobs due
    /// at the current instant, without timers or background tasks.
    pub async fn run_pending(&self) -> Result<usize, Error> {
        let worker = self.worker(0);
        let mut executed = 0;
        loop {
            let now = self.clock.now();
            match self.store.claim_ready(now).await? {
                Some(job) => {
                    worker.execute(job).await;
                    executed += 1;
                }
                None => break,
            }
        }
        Ok(executed)
    }

    fn worker(&self, worker_id: usize) -> Worker<S> {
        Worker::new(
            worker_id,
            self.store.clone(),
            self.handlers.clone(),
            self.events.clone(),
            self.clock.clone(),
            self.config.backoff.clone(),
            self.config.poll_interval,
            self.shutdown.clone(),
        )
    }

    pub(crate) fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub(crate) fn events(&self) -> &EventBus {
        &self.events
    }
}
