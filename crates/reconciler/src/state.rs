//! Per-identity bookkeeping owned by the scheduler.

use steward_core::TriggerCause;
use tokio::task::JoinHandle;

use crate::retry::{FailureRecord, RetryExecution};

/// What the scheduler knows about events for one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Eventing {
    NoEvent,
    /// A trigger arrived that no dispatch has consumed yet.
    EventPresent,
    /// The object is gone. State is dropped once nothing is in flight.
    DeletePresent,
    /// Our finalizer was removed. Further updates of the terminating object
    /// are ignored until the delete arrives.
    ProcessedMarkForDeletion,
}

/// A pending re-schedule or backoff timer.
#[derive(Debug)]
pub(crate) struct Timer {
    pub token: u64,
    pub handle: JoinHandle<()>,
}

#[derive(Debug)]
pub(crate) struct ResourceState {
    pub under_processing: bool,
    /// The identity sits in the ready queue.
    pub queued: bool,
    pub eventing: Eventing,
    /// Distinct causes waiting for the next dispatch, in arrival order.
    pub causes: Vec<TriggerCause>,
    pub retry: Option<RetryExecution>,
    pub timer: Option<Timer>,
    pub last_failure: Option<FailureRecord>,
}

impl ResourceState {
    pub const fn new() -> Self {
        Self {
            under_processing: false,
            queued: false,
            eventing: Eventing::NoEvent,
            causes: Vec::new(),
            retry: None,
            timer: None,
            last_failure: None,
        }
    }

    /// Record a trigger. Returns `false` when the trigger was ignored.
    pub fn mark_event(&mut self, cause: TriggerCause) -> bool {
        match self.eventing {
            Eventing::DeletePresent | Eventing::ProcessedMarkForDeletion => false,
            Eventing::NoEvent | Eventing::EventPresent => {
                self.eventing = Eventing::EventPresent;
                if !self.causes.contains(&cause) {
                    self.causes.push(cause);
                }
                true
            }
        }
    }

    pub fn is_event_present(&self) -> bool {
        self.eventing == Eventing::EventPresent
    }

    pub fn is_delete_present(&self) -> bool {
        self.eventing == Eventing::DeletePresent
    }

    /// A waiting dispatch that can be handed to a worker right away.
    pub fn is_dispatchable(&self) -> bool {
        self.is_event_present() && !self.under_processing && !self.queued
    }

    /// Take the coalesced causes for a dispatch that is about to start.
    pub fn begin(&mut self) -> Vec<TriggerCause> {
        self.queued = false;
        self.under_processing = true;
        if self.eventing == Eventing::EventPresent {
            self.eventing = Eventing::NoEvent;
        }
        std::mem::take(&mut self.causes)
    }

    pub fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.handle.abort();
        }
    }
}
