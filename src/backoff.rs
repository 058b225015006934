//! Retry backoff strategies.
//!
//! Two strategies are provided, constant and exponential, each optionally
//! modified by a jitter and clamped by minimum/maximum bounds. All of the
//! constructors and configuration functions are `const`, so a strategy can be
//! built statically and handed to [`crate::QueueConfig::with_backoff`].
//!
//! # Example
//!
//! ```
//! # use taskmill::backoff::{BackoffStrategy, Jitter, Strategy};
//! # use chrono::TimeDelta;
//! let strategy = BackoffStrategy::exponential(TimeDelta::seconds(4))
//!     .with_max(TimeDelta::days(7))
//!     .with_jitter(Jitter::Relative(0.1));
//!
//! assert!(strategy.backoff(1) >= TimeDelta::milliseconds(3600));
//! assert!(strategy.backoff(1) <= TimeDelta::milliseconds(4400));
//! ```

use chrono::TimeDelta;
use rand::Rng;

/// Computes the delay before a failed attempt is retried.
pub trait Strategy {
    /// Given the attempt that just failed (1-based), returns the [`TimeDelta`]
    /// to wait before the job becomes claimable again.
    fn backoff(&self, attempt: u16) -> TimeDelta;
}

/// Constant backoff: the same delay no matter the attempt.
///
/// Constructed via [`BackoffStrategy::constant`].
///
/// # Example
///
/// ```
/// # use taskmill::backoff::{BackoffStrategy, Strategy};
/// # use chrono::TimeDelta;
/// let strategy = BackoffStrategy::constant(TimeDelta::seconds(10));
///
/// assert_eq!(strategy.backoff(1), TimeDelta::seconds(10));
/// assert_eq!(strategy.backoff(7), TimeDelta::seconds(10));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Constant {
    delay: TimeDelta,
}

impl Strategy for Constant {
    fn backoff(&self, _attempt: u16) -> TimeDelta {
        self.delay
    }
}

/// Exponential backoff: `base * 2^(attempt - 1)`.
///
/// It is advisable to clamp growth with [`BackoffStrategy::with_max`].
/// Constructed via [`BackoffStrategy::exponential`].
///
/// # Example
///
/// ```
/// # use taskmill::backoff::{BackoffStrategy, Strategy};
/// # use chrono::TimeDelta;
/// let strategy =
///     BackoffStrategy::exponential(TimeDelta::seconds(2)).with_max(TimeDelta::seconds(30));
///
/// assert_eq!(strategy.backoff(1), TimeDelta::seconds(2));
/// assert_eq!(strategy.backoff(2), TimeDelta::seconds(4));
/// assert_eq!(strategy.backoff(3), TimeDelta::seconds(8));
/// assert_eq!(strategy.backoff(4), TimeDelta::seconds(16));
/// assert_eq!(strategy.backoff(5), TimeDelta::seconds(30));
/// assert_eq!(strategy.backoff(6), TimeDelta::seconds(30));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exponential {
    base: TimeDelta,
    max: Option<TimeDelta>,
}

impl Strategy for Exponential {
    fn backoff(&self, attempt: u16) -> TimeDelta {
        // Doublings beyond 2^32 have long since saturated any sensible max.
        let doublings = u32::from(attempt.saturating_sub(1)).min(32);
        let mut seconds = self
            .base
            .num_seconds()
            .saturating_mul(1i64 << doublings);
        if let Some(max) = self.max {
            seconds = seconds.min(max.num_seconds());
        }
        TimeDelta::seconds(seconds)
    }
}

/// A random jitter applied to a computed backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// Added to the backoff in the range `-delta <= jitter <= delta`.
    Absolute(TimeDelta),
    /// Added as a proportion of the computed backoff.
    Relative(f64),
}

impl Jitter {
    fn apply_jitter(&self, value: TimeDelta) -> TimeDelta {
        let milliseconds = match self {
            Self::Absolute(delta) => delta.num_milliseconds(),
            Self::Relative(ratio) => (value.num_milliseconds() as f64 * ratio).round() as i64,
        };
        let jitter = rand::thread_rng().gen_range(-milliseconds..=milliseconds);
        value + TimeDelta::milliseconds(jitter)
    }
}

/// A backoff [`Strategy`] together with jitter and bounds.
///
/// # Example
///
/// ```
/// # use taskmill::backoff::{BackoffStrategy, Jitter, Strategy};
/// # use chrono::TimeDelta;
/// let strategy = BackoffStrategy::constant(TimeDelta::seconds(20))
///     .with_jitter(Jitter::Absolute(TimeDelta::seconds(10)))
///     .with_min(TimeDelta::seconds(15));
///
/// for attempt in 1..10 {
///     let backoff = strategy.backoff(attempt);
///     assert!(backoff >= TimeDelta::seconds(15));
///     assert!(backoff <= TimeDelta::seconds(30));
/// }
/// ```
#[derive(Debug, Clone, Copy)]
pub struct BackoffStrategy<T: Strategy> {
    strategy: T,
    jitter: Option<Jitter>,
    min: TimeDelta,
}

impl BackoffStrategy<Constant> {
    /// Creates a [`BackoffStrategy`] returning the same delay for every
    /// attempt.
    pub const fn constant(delay: TimeDelta) -> Self {
        Self::new(Constant { delay })
    }
}

impl BackoffStrategy<Exponential> {
    /// Creates a [`BackoffStrategy`] doubling the delay with each attempt.
    pub const fn exponential(base: TimeDelta) -> Self {
        Self::new(Exponential { base, max: None })
    }

    /// Clamps the maximum value returned by [`Strategy::backoff`].
    pub const fn with_max(mut self, max_delay: TimeDelta) -> Self {
        self.strategy.max = Some(max_delay);
        self
    }
}

impl<T> BackoffStrategy<T>
where
    T: Strategy,
{
    /// Wraps a custom [`Strategy`]. More commonly constructed via
    /// [`BackoffStrategy::constant`] or [`BackoffStrategy::exponential`].
    pub const fn new(strategy: T) -> Self {
        Self {
            strategy,
            jitter: None,
            min: TimeDelta::zero(),
        }
    }

    /// Adds a jitter, see [`Jitter`].
    pub const fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Adds a minimum value. Useful with a large jitter to avoid a near-zero
    /// retry delay.
    pub const fn with_min(mut self, min: TimeDelta) -> Self {
        self.min = min;
        self
    }
}

impl<T> Strategy for BackoffStrategy<T>
where
    T: Strategy,
{
    fn backoff(&self, attempt: u16) -> TimeDelta {
        let mut backoff = self.strategy.backoff(attempt);

        if let Some(jitter) = self.jitter {
            backoff = jitter.apply_jitter(backoff);
        }

        backoff.max(self.min)
    }
}
