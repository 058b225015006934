//! Recurring job definitions evaluated into queue admissions.
//!
//! The scheduler owns no execution machinery of its own. Each tick it decides
//! which schedule entries are due and admits ordinary jobs for them via the
//! queue, deduplicated per occurrence so that overlapping ticks (or several
//! scheduler instances sharing a store) fire each occurrence exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::events::JobEvent;
use crate::queue::{JobOptions, JobQueue};
use crate::store::JobStore;
use crate::Error;

pub mod recurrence;

pub use recurrence::RecurrenceRule;

/// Opaque identifier of a schedule entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScheduledJobId(i64);

impl From<i64> for ScheduledJobId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for ScheduledJobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// The payload admitted with each fired occurrence.
#[derive(Clone)]
enum PayloadTemplate {
    Fixed(Value),
    Generated(Arc<dyn Fn() -> Value + Send + Sync>),
}

impl PayloadTemplate {
    fn render(&self) -> Value {
        match self {
            Self::Fixed(value) => value.clone(),
            Self::Generated(generate) => generate(),
        }
    }
}

impl std::fmt::Debug for PayloadTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed(value) => f.debug_tuple("Fixed").field(value).finish(),
            Self::Generated(_) => f.debug_tuple("Generated").finish(),
        }
    }
}

/// A recurring job definition: which job to admit, and when.
///
/// # Example
///
/// ```
/// # use taskmill::{RecurrenceRule, ScheduleSpec};
/// # use chrono::TimeDelta;
/// # use serde_json::json;
/// let spec = ScheduleSpec::new("nightly_report", RecurrenceRule::cron("0 0 2 * * * *").unwrap())
///     .with_payload(json!({"format": "csv"}))
///     .with_priority(10);
/// # let _ = spec;
/// ```
#[derive(Debug, Clone)]
pub struct ScheduleSpec {
    job_type: String,
    rule: RecurrenceRule,
    payload: PayloadTemplate,
    priority: i32,
}

impl ScheduleSpec {
    pub fn new(job_type: impl Into<String>, rule: RecurrenceRule) -> Self {
        Self {
            job_type: job_type.into(),
            rule,
            payload: PayloadTemplate::Fixed(Value::Null),
            priority: 0,
        }
    }

    /// A fixed payload admitted with every occurrence.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = PayloadTemplate::Fixed(payload);
        self
    }

    /// A payload generated afresh for each occurrence.
    pub fn with_payload_fn(
        mut self,
        generate: impl Fn() -> Value + Send + Sync + 'static,
    ) -> Self {
        self.payload = PayloadTemplate::Generated(Arc::new(generate));
        self
    }

    /// Priority of the admitted jobs.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// What to do when a tick discovers more than one elapsed occurrence, e.g.
/// after the process was down across several of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CatchUp {
    /// Fire a single job for the most recent elapsed occurrence.
    #[default]
    MostRecent,
    /// Fire nothing and resume with the next future occurrence.
    Skip,
}

/// Configuration for a [`JobScheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    tick_interval: Duration,
    catch_up: CatchUp,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            catch_up: CatchUp::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// How often the background runner evaluates due entries.
    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    pub fn with_catch_up(mut self, catch_up: CatchUp) -> Self {
        self.catch_up = catch_up;
        self
    }
}

#[derive(Debug, Clone)]
struct ScheduledJob {
    spec: ScheduleSpec,
    enabled: bool,
    next_run_at: DateTime<Utc>,
    last_triggered_at: Option<DateTime<Utc>>,
}

/// Evaluates [`ScheduleSpec`]s and admits a job to the queue for each fired
/// occurrence.
///
/// Driven either by [`JobScheduler::start`], which spawns a background tick
/// loop, or by calling [`JobScheduler::tick`] directly with an explicit
/// instant for deterministic tests.
pub struct JobScheduler<S: JobStore> {
    queue: Arc<JobQueue<S>>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    entries: Arc<Mutex<HashMap<ScheduledJobId, ScheduledJob>>>,
    id_counter: Arc<AtomicI64>,
    shutdown: CancellationToken,
    runner: Mutex<Option<JoinHandle<()>>>,
}

impl<S: JobStore> JobScheduler<S> {
    /// Creates a scheduler admitting jobs to `queue`, sharing its clock.
    pub fn new(queue: Arc<JobQueue<S>>) -> Self {
        Self::with_config(queue, SchedulerConfig::default())
    }

    pub fn with_config(queue: Arc<JobQueue<S>>, config: SchedulerConfig) -> Self {
        Self {
            clock: queue.clock(),
            queue,
            config,
            entries: Default::default(),
            id_counter: Arc::new(AtomicI64::new(0)),
            shutdown: CancellationToken::new(),
            runner: Mutex::new(None),
        }
    }

    /// Registers a recurring job definition, enabled, with its first
    /// occurrence computed from now.
    pub fn schedule(&self, spec: ScheduleSpec) -> Result<ScheduledJobId, Error> {
        let now = self.clock.now();
        let next_run_at = spec.rule.next_after(now).ok_or_else(|| {
            Error::InvalidRecurrenceRule("rule has no upcoming occurrence".to_owned())
        })?;
        let id = ScheduledJobId(self.id_counter.fetch_add(1, Ordering::SeqCst) + 1);
        let mut entries = self.entries.lock().map_err(|_| Error::BadState)?;
        entries.insert(
            id,
            ScheduledJob {
                spec,
                enabled: true,
                next_run_at,
                last_triggered_at: None,
            },
        );
        tracing::debug!(%id, %next_run_at, "scheduled recurring job {id}");
        Ok(id)
    }

    /// Evaluates all entries against `now`, admitting a job for each fired
    /// occurrence. Returns the number of jobs admitted.
    ///
    /// Safe to call concurrently or redundantly: occurrence dedupe keys and a
    /// compare-and-advance guard on each entry make re-evaluating the same
    /// instant a no-op.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<usize, Error> {
        let due: Vec<(ScheduledJobId, ScheduleSpec, DateTime<Utc>)> = {
            let entries = self.entries.lock().map_err(|_| Error::BadState)?;
            entries
                .iter()
                .filter(|(_, entry)| entry.enabled && entry.next_run_at <= now)
                .map(|(id, entry)| (*id, entry.spec.clone(), entry.next_run_at))
                .collect()
        };

        let mut fired = 0;
        for (id, spec, stale_next) in due {
            let latest = latest_elapsed_occurrence(&spec.rule, stale_next, now);
            let fire_at = match self.config.catch_up {
                CatchUp::MostRecent => Some(latest),
                // With Skip, anything other than the expected occurrence
                // means occurrences were missed.
                CatchUp::Skip if latest == stale_next => Some(latest),
                CatchUp::Skip => None,
            };

            let job_id = match fire_at {
                Some(occurrence) => {
                    match self
                        .queue
                        .add(
                            &spec.job_type,
                            spec.payload.render(),
                            JobOptions::default()
                                .with_priority(spec.priority)
                                .with_dedupe_key(occurrence_key(id, occurrence)),
                        )
                        .await
                    {
                        Ok(job_id) => Some(job_id),
                        Err(Error::Store(error)) => return Err(error.into()),
                        Err(error) => {
                            // Leaves the entry unadvanced so the occurrence is
                            // retried next tick, e.g. once a handler for the
                            // job type is registered.
                            tracing::error!(
                                ?error,
                                %id,
                                "Failed to admit job for scheduled job {id}: {error}"
                            );
                            continue;
                        }
                    }
                }
                None => {
                    tracing::debug!(%id, "skipping elapsed occurrences of scheduled job {id}");
                    None
                }
            };

            let advanced = {
                let mut entries = self.entries.lock().map_err(|_| Error::BadState)?;
                match entries.get_mut(&id) {
                    // Another tick got here first; the dedupe key already made
                    // the admission idempotent.
                    Some(entry) if entry.next_run_at != stale_next => false,
                    Some(entry) => match spec.rule.next_after(latest) {
                        Some(next) => {
                            entry.next_run_at = next;
                            if job_id.is_some() {
                                entry.last_triggered_at = Some(latest);
                            }
                            true
                        }
                        None => {
                            tracing::debug!(%id, "scheduled job {id} has no further occurrences");
                            entry.enabled = false;
                            true
                        }
                    },
                    None => false,
                }
            };

            if advanced {
                if let Some(job_id) = job_id {
                    fired += 1;
                    self.queue.events().emit(JobEvent::ScheduledJobFired {
                        id,
                        job_id,
                        occurrence: latest,
                    });
                }
            }
        }
        Ok(fired)
    }

    /// Suspends an entry. Its definition is retained but ticks ignore it.
    pub fn disable(&self, id: ScheduledJobId) -> Result<(), Error> {
        let mut entries = self.entries.lock().map_err(|_| Error::BadState)?;
        let entry = entries
            .get_mut(&id)
            .ok_or(Error::ScheduledJobNotFound(id))?;
        entry.enabled = false;
        Ok(())
    }

    /// Resumes an entry. The next occurrence is computed from now:
    /// occurrences elapsed while disabled are never replayed.
    pub fn enable(&self, id: ScheduledJobId) -> Result<(), Error> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().map_err(|_| Error::BadState)?;
        let entry = entries
            .get_mut(&id)
            .ok_or(Error::ScheduledJobNotFound(id))?;
        if !entry.enabled {
            entry.next_run_at = entry.spec.rule.next_after(now).ok_or_else(|| {
                Error::InvalidRecurrenceRule("rule has no upcoming occurrence".to_owned())
            })?;
            entry.enabled = true;
        }
        Ok(())
    }

    /// Starts the background tick loop.
    pub fn start(self: &Arc<Self>) {
        let scheduler = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(scheduler.config.tick_interval) => {
                        let now = scheduler.clock.now();
                        if let Err(error) = scheduler.tick(now).await {
                            tracing::error!(?error, "Scheduler tick failed: {error}");
                        }
                    },
                    _ = scheduler.shutdown.cancelled() => {
                        break;
                    },
                }
            }
            tracing::debug!("Shutting down job scheduler");
        });
        if let Ok(mut runner) = self.runner.lock() {
            *runner = Some(handle);
        }
    }

    /// Stops the background tick loop.
    pub async fn shutdown(&self) -> Result<(), Error> {
        self.shutdown.cancel();
        let handle = {
            let mut runner = self.runner.lock().map_err(|_| Error::ShutdownFailed)?;
            runner.take()
        };
        if let Some(handle) = handle {
            handle.await.map_err(|_| Error::ShutdownFailed)?;
        }
        Ok(())
    }
}

/// The occurrence-scoped dedupe key tying one queue job to one firing.
fn occurrence_key(id: ScheduledJobId, occurrence: DateTime<Utc>) -> String {
    format!("{id}@{}", occurrence.timestamp_millis())
}

/// Walks the rule forward from the first due occurrence to the last one not
/// after `now`.
fn latest_elapsed_occurrence(
    rule: &RecurrenceRule,
    first_due: DateTime<Utc>,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let mut latest = first_due;
    while let Some(next) = rule.next_after(latest) {
        if next > now {
            break;
        }
        latest = next;
    }
    latest
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use chrono::{TimeDelta, TimeZone, Utc};
    use serde_json::{json, Value};

    use super::*;
    use crate::clock::ManualClock;
    use crate::handler::handler_fn;
    use crate::job::{JobFilter, JobStatus};
    use crate::store::memory::InMemoryStore;

    fn scheduler_fixture(
        config: SchedulerConfig,
    ) -> (JobScheduler<InMemoryStore>, Arc<JobQueue<InMemoryStore>>, ManualClock) {
        let clock = ManualClock::at(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        let queue = Arc::new(
            JobQueue::new(InMemoryStore::new()).with_clock(Arc::new(clock.clone())),
        );
        queue.register_handler("report", handler_fn(|_job| async { Ok(Value::Null) }));
        let scheduler = JobScheduler::with_config(queue.clone(), config);
        (scheduler, queue, clock)
    }

    fn every_minute() -> ScheduleSpec {
        ScheduleSpec::new(
            "report",
            RecurrenceRule::every(TimeDelta::minutes(1)).unwrap(),
        )
    }

    #[tokio::test]
    async fn fires_each_occurrence_exactly_once() {
        let (scheduler, queue, clock) = scheduler_fixture(SchedulerConfig::default());
        scheduler.schedule(every_minute()).unwrap();

        // Not due yet.
        assert_eq!(scheduler.tick(clock.now()).await.unwrap(), 0);

        clock.advance(TimeDelta::minutes(1));
        assert_eq!(scheduler.tick(clock.now()).await.unwrap(), 1);

        // Re-evaluating the same instant, or a hair later, is a no-op.
        assert_eq!(scheduler.tick(clock.now()).await.unwrap(), 0);
        assert_eq!(
            scheduler
                .tick(clock.now() + TimeDelta::milliseconds(1))
                .await
                .unwrap(),
            0
        );

        let jobs = queue.jobs(&JobFilter::new()).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_type, "report");
    }

    #[tokio::test]
    async fn occurrences_do_not_drift_with_late_ticks() {
        let (scheduler, queue, clock) = scheduler_fixture(SchedulerConfig::default());
        let start = clock.now();
        scheduler.schedule(every_minute()).unwrap();

        // Each tick arrives noticeably after the occurrence it fires.
        for n in 1..=100 {
            clock.set(start + TimeDelta::minutes(n) + TimeDelta::seconds(17));
            assert_eq!(scheduler.tick(clock.now()).await.unwrap(), 1);
        }

        let jobs = queue.jobs(&JobFilter::new()).await.unwrap();
        assert_eq!(jobs.len(), 100);
        // Occurrences stay on the minute grid: dedupe keys encode the
        // occurrence timestamps, all multiples of a minute from the start.
        for job in &jobs {
            let key = job.dedupe_key.as_deref().unwrap();
            let millis: i64 = key.split('@').nth(1).unwrap().parse().unwrap();
            assert_eq!((millis - start.timestamp_millis()) % 60_000, 0);
        }
    }

    #[tokio::test]
    async fn catch_up_most_recent_fires_one_job_for_a_gap() {
        let (scheduler, queue, clock) = scheduler_fixture(SchedulerConfig::default());
        scheduler.schedule(every_minute()).unwrap();

        // Ten occurrences elapse without a tick.
        clock.advance(TimeDelta::minutes(10));
        assert_eq!(scheduler.tick(clock.now()).await.unwrap(), 1);

        let jobs = queue.jobs(&JobFilter::new()).await.unwrap();
        assert_eq!(jobs.len(), 1);
        // The fired occurrence is the most recent elapsed one.
        let key = jobs[0].dedupe_key.as_deref().unwrap();
        assert!(key.ends_with(&clock.now().timestamp_millis().to_string()));

        // The series resumes without double-firing.
        clock.advance(TimeDelta::minutes(1));
        assert_eq!(scheduler.tick(clock.now()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn catch_up_skip_fires_nothing_for_a_gap() {
        let (scheduler, queue, clock) =
            scheduler_fixture(SchedulerConfig::new().with_catch_up(CatchUp::Skip));
        scheduler.schedule(every_minute()).unwrap();

        clock.advance(TimeDelta::minutes(10));
        assert_eq!(scheduler.tick(clock.now()).await.unwrap(), 0);
        assert!(queue.jobs(&JobFilter::new()).await.unwrap().is_empty());

        // The next on-time occurrence fires normally.
        clock.advance(TimeDelta::minutes(1));
        assert_eq!(scheduler.tick(clock.now()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn disabled_entries_are_ignored_until_enabled() {
        let (scheduler, queue, clock) = scheduler_fixture(SchedulerConfig::default());
        let id = scheduler.schedule(every_minute()).unwrap();

        scheduler.disable(id).unwrap();
        clock.advance(TimeDelta::minutes(30));
        assert_eq!(scheduler.tick(clock.now()).await.unwrap(), 0);

        // Occurrences elapsed while disabled are never replayed.
        scheduler.enable(id).unwrap();
        assert_eq!(scheduler.tick(clock.now()).await.unwrap(), 0);
        assert!(queue.jobs(&JobFilter::new()).await.unwrap().is_empty());

        clock.advance(TimeDelta::minutes(1));
        assert_eq!(scheduler.tick(clock.now()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn disable_unknown_entry_fails() {
        let (scheduler, _queue, _clock) = scheduler_fixture(SchedulerConfig::default());
        assert_matches!(
            scheduler.disable(ScheduledJobId::from(42)),
            Err(Error::ScheduledJobNotFound(_))
        );
    }

    #[tokio::test]
    async fn unregistered_job_type_is_retried_next_tick() {
        let (scheduler, queue, clock) = scheduler_fixture(SchedulerConfig::default());
        scheduler
            .schedule(ScheduleSpec::new(
                "unregistered",
                RecurrenceRule::every(TimeDelta::minutes(1)).unwrap(),
            ))
            .unwrap();

        clock.advance(TimeDelta::minutes(1));
        assert_eq!(scheduler.tick(clock.now()).await.unwrap(), 0);
        assert!(queue.jobs(&JobFilter::new()).await.unwrap().is_empty());

        // Once a handler appears the pending occurrence fires.
        queue.register_handler("unregistered", handler_fn(|_job| async { Ok(Value::Null) }));
        assert_eq!(scheduler.tick(clock.now()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn scheduled_jobs_carry_spec_payload_and_priority() {
        let (scheduler, queue, clock) = scheduler_fixture(SchedulerConfig::default());
        scheduler
            .schedule(
                every_minute()
                    .with_payload(json!({"format": "csv"}))
                    .with_priority(7),
            )
            .unwrap();

        clock.advance(TimeDelta::minutes(1));
        scheduler.tick(clock.now()).await.unwrap();

        let jobs = queue.jobs(&JobFilter::new()).await.unwrap();
        assert_eq!(jobs[0].payload, json!({"format": "csv"}));
        assert_eq!(jobs[0].priority, 7);
        assert_eq!(jobs[0].status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn fired_occurrences_are_announced_as_events() {
        let (scheduler, queue, clock) = scheduler_fixture(SchedulerConfig::default());
        let mut events = queue.subscribe_events();
        let id = scheduler.schedule(every_minute()).unwrap();

        clock.advance(TimeDelta::minutes(1));
        let occurrence = clock.now();
        scheduler.tick(occurrence).await.unwrap();

        assert_matches!(
            events.try_recv(),
            Ok(JobEvent::ScheduledJobFired { id: event_id, occurrence: fired, .. })
                if event_id == id && fired == occurrence
        );
    }

    #[tokio::test]
    async fn generated_payloads_are_rendered_per_occurrence() {
        let (scheduler, queue, clock) = scheduler_fixture(SchedulerConfig::default());
        let counter = Arc::new(std::sync::atomic::AtomicI64::new(0));
        scheduler
            .schedule(every_minute().with_payload_fn({
                let counter = counter.clone();
                move || json!(counter.fetch_add(1, Ordering::SeqCst))
            }))
            .unwrap();

        clock.advance(TimeDelta::minutes(1));
        scheduler.tick(clock.now()).await.unwrap();
        clock.advance(TimeDelta::minutes(1));
        scheduler.tick(clock.now()).await.unwrap();

        let mut payloads: Vec<Value> = queue
            .jobs(&JobFilter::new())
            .await
            .unwrap()
            .into_iter()
            .map(|job| job.payload)
            .collect();
        payloads.sort_by_key(|value| value.as_i64());
        assert_eq!(payloads, vec![json!(0), json!(1)]);
    }
}
