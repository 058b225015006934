//! The handler capability invoked by the queue for each job type.
//!
//! Handlers are registered against a string job type via
//! [`crate::JobQueue::register_handler`] and dispatched dynamically over that
//! registration table. Delivery is at-least-once: a handler may be re-invoked
//! for the same job after a crash between execution and completion
//! bookkeeping, and must be written to tolerate re-invocation. The queue does
//! not, and cannot, enforce this.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::job::Job;

/// The outcome of a handler invocation. The success value is stored as the
/// job's result.
pub type HandlerResult = Result<Value, HandlerError>;

/// A failure reported by a handler.
///
/// Converted by the dispatch loop into a retry or dead-letter transition;
/// never surfaced to unrelated callers.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct HandlerError {
    error_type: String,
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error_type: "handler".to_owned(),
            message: message.into(),
        }
    }

    /// Tag the error with a handler-specific type, recorded in the job's
    /// error history.
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = error_type.into();
        self
    }

    pub fn error_type(&self) -> &str {
        &self.error_type
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Caller-supplied logic executed for a job type.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn run(&self, job: Job) -> HandlerResult;

    /// Maximum execution duration for jobs of this type.
    ///
    /// When exceeded the attempt is force-failed, entering the standard
    /// retry/backoff path, and the worker slot is freed. [`None`] means no
    /// limit, in which case a stuck handler occupies its worker indefinitely.
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

/// Wraps an async closure as a [`Handler`].
///
/// # Example
///
/// ```
/// use taskmill::{handler_fn, Job};
///
/// let handler = handler_fn(|job: Job| async move {
///     Ok(serde_json::json!({ "echoed": job.payload }))
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    FnHandler { f, timeout: None }
}

/// A [`Handler`] backed by a closure. Constructed via [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
    timeout: Option<Duration>,
}

impl<F> FnHandler<F> {
    /// Declare a maximum execution duration for this handler.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn run(&self, job: Job) -> HandlerResult {
        (self.f)(job).await
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}
