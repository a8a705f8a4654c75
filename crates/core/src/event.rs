//! Change notifications and the trigger causes derived from them.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::resource::{ManagedObject, ResourceId};

/// What happened to an object in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeAction {
    Added,
    Updated,
    Deleted,
}

/// One entry of the change feed.
///
/// Deleted events carry the last known state of the object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub action: ChangeAction,
    pub object: ManagedObject,
}

impl ChangeEvent {
    #[must_use]
    pub const fn added(object: ManagedObject) -> Self {
        Self {
            action: ChangeAction::Added,
            object,
        }
    }

    #[must_use]
    pub const fn updated(object: ManagedObject) -> Self {
        Self {
            action: ChangeAction::Updated,
            object,
        }
    }

    #[must_use]
    pub const fn deleted(object: ManagedObject) -> Self {
        Self {
            action: ChangeAction::Deleted,
            object,
        }
    }

    #[must_use]
    pub const fn id(&self) -> &ResourceId {
        &self.object.id
    }
}

/// Why a reconciliation was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerCause {
    Added,
    Updated,
    Deleted,
    /// A re-schedule timer fired.
    Rescheduled,
    /// A backoff timer fired after a failed attempt.
    Retry,
    /// An object owned by the primary changed.
    DependentEvent,
}

impl From<ChangeAction> for TriggerCause {
    fn from(action: ChangeAction) -> Self {
        match action {
            ChangeAction::Added => Self::Added,
            ChangeAction::Updated => Self::Updated,
            ChangeAction::Deleted => Self::Deleted,
        }
    }
}

impl fmt::Display for TriggerCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Added => "added",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
            Self::Rescheduled => "rescheduled",
            Self::Retry => "retry",
            Self::DependentEvent => "dependent-event",
        };
        f.write_str(name)
    }
}

/// A coalesced request to reconcile one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationRequest {
    pub id: ResourceId,
    /// Distinct causes in order of first arrival.
    pub causes: Vec<TriggerCause>,
}

impl ReconciliationRequest {
    #[must_use]
    pub const fn new(id: ResourceId, causes: Vec<TriggerCause>) -> Self {
        Self { id, causes }
    }
}
