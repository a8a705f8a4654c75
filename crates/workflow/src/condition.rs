//! Gating conditions attached to workflow nodes.

use std::fmt;

use serde::{Deserialize, Serialize};
use steward_core::{ManagedObject, Result};

use crate::context::Context;
use crate::dependent::Observed;

/// Where a condition is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConditionKind {
    /// Checked first in both modes. False skips the node and, when
    /// reconciling, everything downstream of it.
    Activation,
    /// Checked before reconciling. False deletes the node and every node
    /// below it instead.
    ReconcilePrecondition,
    /// Checked after the node reconciled. False halts propagation.
    Ready,
    /// Checked before the node is deleted during cleanup.
    CleanupReady,
}

impl fmt::Display for ConditionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Activation => "activation",
            Self::ReconcilePrecondition => "reconcile-precondition",
            Self::Ready => "ready",
            Self::CleanupReady => "cleanup-ready",
        };
        f.write_str(name)
    }
}

/// A predicate over the primary and the observed dependent state.
///
/// An `Err` is treated as "not met" by the executor and recorded on the node.
pub trait Condition<R>: Send + Sync {
    /// # Errors
    ///
    /// Returns an error when the condition cannot be evaluated.
    fn is_met(&self, primary: &ManagedObject, observed: &Observed<R>, ctx: &Context)
    -> Result<bool>;
}

impl<R, F> Condition<R> for F
where
    F: Fn(&ManagedObject, &Observed<R>, &Context) -> Result<bool> + Send + Sync,
{
    fn is_met(
        &self,
        primary: &ManagedObject,
        observed: &Observed<R>,
        ctx: &Context,
    ) -> Result<bool> {
        self(primary, observed, ctx)
    }
}

/// Met once the dependent exists.
#[derive(Debug, Clone, Copy, Default)]
pub struct Exists;

impl<R> Condition<R> for Exists {
    fn is_met(&self, _primary: &ManagedObject, observed: &Observed<R>, _ctx: &Context) -> Result<bool> {
        Ok(observed.is_present())
    }
}

/// Met once the dependent is gone.
#[derive(Debug, Clone, Copy, Default)]
pub struct Absent;

impl<R> Condition<R> for Absent {
    fn is_met(&self, _primary: &ManagedObject, observed: &Observed<R>, _ctx: &Context) -> Result<bool> {
        Ok(!observed.is_present())
    }
}
