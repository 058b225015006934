//! The purpose of this module is to alleviate the need to import many of the
//! `[taskmill]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use taskmill::prelude::*;
//! ```
pub use crate::backoff::BackoffStrategy;
pub use crate::backoff::Jitter;
pub use crate::backoff::Strategy;
pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::events::JobEvent;
pub use crate::handler::{handler_fn, Handler, HandlerError, HandlerResult};
pub use crate::job::{Job, JobFilter, JobId, JobStatus};
pub use crate::queue::{JobOptions, JobQueue, QueueConfig};
pub use crate::scheduler::{
    CatchUp, JobScheduler, RecurrenceRule, ScheduleSpec, ScheduledJobId, SchedulerConfig,
};
pub use crate::store::memory::InMemoryStore;
pub use crate::store::JobStore;
