//! Conflict and retry governance.
//!
//! Failed dispatches are classified first. Conflicts are re-dispatched
//! immediately and never touch the retry budget; transient failures back off
//! exponentially until the budget is spent; terminal failures are recorded
//! and not retried.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use steward_core::{Error, RetrySettings};
use steward_workflow::RetryInfo;

/// Ceiling for computed delays when no maximum is configured.
const BACKOFF_CEILING: Duration = Duration::from_secs(24 * 60 * 60);

/// How a failure is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureClass {
    /// Stale write. Re-dispatch now against fresher state.
    Conflict,
    /// Worth retrying with backoff.
    Transient,
    /// Retrying cannot help.
    Terminal,
}

/// Classify a dispatch failure.
#[must_use]
pub fn classify(error: &Error) -> FailureClass {
    if error.is_conflict() {
        FailureClass::Conflict
    } else if error.is_terminal() {
        FailureClass::Terminal
    } else {
        FailureClass::Transient
    }
}

/// Exponential backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    pub initial_interval: Duration,
    pub multiplier: f64,
    /// Caps exponential growth.
    pub max_interval: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(5),
            initial_interval: Duration::from_secs(2),
            multiplier: 1.5,
            max_interval: None,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_attempts = attempts;
        self
    }

    #[must_use]
    pub const fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    #[must_use]
    pub const fn with_max_interval(mut self, interval: Option<Duration>) -> Self {
        self.max_interval = interval;
        self
    }

    /// Failures are recorded but never retried.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: Some(0),
            ..Self::default()
        }
    }

    /// Short delays, for tests and fast-failing collaborators.
    #[must_use]
    pub const fn quick() -> Self {
        Self {
            max_attempts: Some(3),
            initial_interval: Duration::from_millis(10),
            multiplier: 2.0,
            max_interval: Some(Duration::from_millis(100)),
        }
    }

    /// `None` when retries are disabled in settings.
    #[must_use]
    pub fn from_settings(settings: &RetrySettings) -> Option<Self> {
        settings.enabled.then(|| Self {
            max_attempts: settings.max_attempts,
            initial_interval: Duration::from_millis(settings.initial_interval_ms),
            multiplier: settings.multiplier,
            max_interval: settings.max_interval_ms.map(Duration::from_millis),
        })
    }

    /// Delay before retry number `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_interval.as_secs_f64() * self.multiplier.powi(exponent);
        let cap = self.max_interval.unwrap_or(BACKOFF_CEILING);
        if !secs.is_finite() {
            return cap;
        }
        Duration::try_from_secs_f64(secs).map_or(cap, |delay| delay.min(cap))
    }

    /// Start tracking a fresh run of failures.
    #[must_use]
    pub const fn start(self) -> RetryExecution {
        RetryExecution {
            policy: self,
            attempts: 0,
        }
    }
}

/// Retry progress for one identity.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryExecution {
    policy: RetryPolicy,
    attempts: u32,
}

impl RetryExecution {
    /// Consume one attempt from the budget and return its delay, or `None`
    /// once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        self.attempts = self.attempts.saturating_add(1);
        Some(self.policy.delay_for(self.attempts))
    }

    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempts
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.policy
            .max_attempts
            .is_some_and(|max| self.attempts >= max)
    }

    #[must_use]
    pub fn info(&self) -> RetryInfo {
        RetryInfo {
            attempt_count: self.attempts,
            last_attempt: self.is_exhausted(),
        }
    }
}

/// Most recent failure of an identity, kept until the next success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub message: String,
    pub class: FailureClass,
    /// Retry attempts consumed when the failure was recorded.
    pub attempts: u32,
    /// No automatic retry will follow.
    pub terminal: bool,
    pub at: DateTime<Utc>,
}

impl FailureRecord {
    pub(crate) fn new(error: &Error, class: FailureClass, attempts: u32, terminal: bool) -> Self {
        Self {
            message: error.to_string(),
            class,
            attempts,
            terminal,
            at: Utc::now(),
        }
    }
}
