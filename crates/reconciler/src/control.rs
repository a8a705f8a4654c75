//! Outcomes returned by reconcilers and by a single dispatch.

use std::time::Duration;

use serde_json::Value;
use steward_core::{Error, ManagedObject};

/// Write the engine performs after a successful reconcile.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateAction {
    NoUpdate,
    /// Replace the status subresource only.
    PatchStatus(Value),
    /// Replace the spec, and the status when one is given.
    PatchResourceAndStatus { spec: Value, status: Option<Value> },
}

/// Reconciler verdict for an active primary.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateControl {
    pub action: UpdateAction,
    /// Run again after this delay even without a new event.
    pub reschedule: Option<Duration>,
}

impl UpdateControl {
    #[must_use]
    pub const fn no_update() -> Self {
        Self {
            action: UpdateAction::NoUpdate,
            reschedule: None,
        }
    }

    #[must_use]
    pub const fn patch_status(status: Value) -> Self {
        Self {
            action: UpdateAction::PatchStatus(status),
            reschedule: None,
        }
    }

    #[must_use]
    pub const fn patch_resource_and_status(spec: Value, status: Option<Value>) -> Self {
        Self {
            action: UpdateAction::PatchResourceAndStatus { spec, status },
            reschedule: None,
        }
    }

    /// A no-update outcome that only asks to be run again later.
    #[must_use]
    pub const fn reschedule_after(delay: Duration) -> Self {
        Self {
            action: UpdateAction::NoUpdate,
            reschedule: Some(delay),
        }
    }

    #[must_use]
    pub const fn with_reschedule(mut self, delay: Duration) -> Self {
        self.reschedule = Some(delay);
        self
    }

    #[must_use]
    pub const fn is_no_update(&self) -> bool {
        matches!(self.action, UpdateAction::NoUpdate)
    }
}

/// Reconciler verdict for a terminating primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeleteControl {
    /// Cleanup is finished. The finalizer may be removed.
    #[default]
    Proceed,
    /// Keep the finalizer and look again after the delay.
    Reschedule(Duration),
}

/// What to do after a reconcile failed.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorStatusControl {
    /// Status written before the failure is handed to the retry governor.
    pub status: Option<Value>,
    /// `false` stops automatic retries for this failure.
    pub retry: bool,
    /// Run again after this delay. Useful together with `no_retry`.
    pub reschedule: Option<Duration>,
}

impl ErrorStatusControl {
    /// Leave the status alone and retry per policy.
    #[must_use]
    pub const fn default_handling() -> Self {
        Self {
            status: None,
            retry: true,
            reschedule: None,
        }
    }

    #[must_use]
    pub const fn patch_status(status: Value) -> Self {
        Self {
            status: Some(status),
            retry: true,
            reschedule: None,
        }
    }

    #[must_use]
    pub const fn no_retry(mut self) -> Self {
        self.retry = false;
        self
    }

    #[must_use]
    pub const fn with_reschedule(mut self, delay: Duration) -> Self {
        self.reschedule = Some(delay);
        self
    }
}

impl Default for ErrorStatusControl {
    fn default() -> Self {
        Self::default_handling()
    }
}

/// Summary of one dispatch, consumed by the scheduler.
#[derive(Debug, Clone, Default)]
pub struct PostExecutionControl {
    /// Object as last written by this dispatch.
    pub updated: Option<ManagedObject>,
    /// The dispatch only added the finalizer and asks to run again.
    pub finalizer_added: bool,
    /// Cleanup finished and the finalizer is gone.
    pub finalizer_removed: bool,
    pub reschedule: Option<Duration>,
    pub error: Option<Error>,
    /// Set when the error must not be retried.
    pub no_retry: bool,
    /// Nothing ran, e.g. the object had already left the cache.
    pub skipped: bool,
}

impl PostExecutionControl {
    #[must_use]
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn failed(error: Error) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn succeeded(updated: Option<ManagedObject>, reschedule: Option<Duration>) -> Self {
        Self {
            updated,
            reschedule,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn finalizer_added(updated: ManagedObject) -> Self {
        Self {
            updated: Some(updated),
            finalizer_added: true,
            reschedule: Some(Duration::ZERO),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn finalizer_removed(updated: Option<ManagedObject>) -> Self {
        Self {
            updated,
            finalizer_removed: true,
            ..Self::default()
        }
    }
}
