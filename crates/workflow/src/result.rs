//! Outcome of one workflow pass.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use steward_core::{DependentFailure, Error, Result};

use crate::dependent::Operations;

/// Direction a workflow runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowMode {
    /// Topological order, creating and updating dependents.
    Reconcile,
    /// Reverse topological order, deleting dependents.
    Cleanup,
}

impl fmt::Display for WorkflowMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reconcile => f.write_str("reconcile"),
            Self::Cleanup => f.write_str("cleanup"),
        }
    }
}

/// What happened to one node.
#[derive(Debug, Clone)]
pub enum NodeOutcome {
    /// Reconciled and ready, or cleaned up.
    Succeeded(Operations),
    /// Activation condition not met. The adapter was not called.
    SkippedInactive,
    /// Reconcile precondition not met on this node or one above it, so the
    /// dependent was deleted instead of reconciled.
    Deleted(Operations),
    /// Ran (or was about to) but a gating condition does not hold yet.
    NotReady {
        operations: Operations,
        reason: String,
    },
    Errored(Error),
}

impl NodeOutcome {
    #[must_use]
    pub const fn is_succeeded(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }

    #[must_use]
    pub const fn is_skipped(&self) -> bool {
        matches!(self, Self::SkippedInactive)
    }

    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        matches!(self, Self::Deleted(_))
    }

    #[must_use]
    pub const fn is_not_ready(&self) -> bool {
        matches!(self, Self::NotReady { .. })
    }

    #[must_use]
    pub const fn is_errored(&self) -> bool {
        matches!(self, Self::Errored(_))
    }

    /// Succeeded, skipped, or deleted: nothing left to do for this node.
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        matches!(
            self,
            Self::Succeeded(_) | Self::SkippedInactive | Self::Deleted(_)
        )
    }

    #[must_use]
    pub const fn operations(&self) -> Option<Operations> {
        match self {
            Self::Succeeded(operations)
            | Self::Deleted(operations)
            | Self::NotReady { operations, .. } => Some(*operations),
            Self::SkippedInactive | Self::Errored(_) => None,
        }
    }
}

/// Per-node outcomes of one pass plus aggregate queries.
///
/// Nodes that were never reached (blocked behind a not-ready or errored
/// dependency) have no outcome.
#[derive(Debug, Clone)]
pub struct WorkflowResult {
    mode: WorkflowMode,
    declared: Vec<String>,
    outcomes: HashMap<String, NodeOutcome>,
    completion_order: Vec<String>,
}

impl WorkflowResult {
    pub(crate) fn new(mode: WorkflowMode, declared: Vec<String>) -> Self {
        Self {
            mode,
            declared,
            outcomes: HashMap::new(),
            completion_order: Vec::new(),
        }
    }

    pub(crate) fn record(&mut self, name: &str, outcome: NodeOutcome) {
        self.completion_order.push(name.to_string());
        self.outcomes.insert(name.to_string(), outcome);
    }

    #[must_use]
    pub const fn mode(&self) -> WorkflowMode {
        self.mode
    }

    #[must_use]
    pub fn outcome(&self, name: &str) -> Option<&NodeOutcome> {
        self.outcomes.get(name)
    }

    /// Node names in the order their outcome was recorded.
    #[must_use]
    pub fn completion_order(&self) -> &[String] {
        &self.completion_order
    }

    /// Nodes whose adapter actually ran to success, in completion order.
    #[must_use]
    pub fn succeeded(&self) -> Vec<&str> {
        self.names_where(NodeOutcome::is_succeeded)
    }

    #[must_use]
    pub fn skipped(&self) -> Vec<&str> {
        self.names_where(NodeOutcome::is_skipped)
    }

    /// Nodes removed because a reconcile precondition did not hold.
    #[must_use]
    pub fn deleted(&self) -> Vec<&str> {
        self.names_where(NodeOutcome::is_deleted)
    }

    #[must_use]
    pub fn not_ready(&self) -> Vec<&str> {
        self.names_where(NodeOutcome::is_not_ready)
    }

    #[must_use]
    pub fn errored(&self) -> Vec<(&str, &Error)> {
        self.completion_order
            .iter()
            .filter_map(|name| match self.outcomes.get(name) {
                Some(NodeOutcome::Errored(error)) => Some((name.as_str(), error)),
                _ => None,
            })
            .collect()
    }

    /// Declared nodes that never got an outcome.
    #[must_use]
    pub fn unreached(&self) -> Vec<&str> {
        self.declared
            .iter()
            .filter(|name| !self.outcomes.contains_key(*name))
            .map(String::as_str)
            .collect()
    }

    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.outcomes.values().any(NodeOutcome::is_errored)
    }

    /// Names of nodes that errored or are not ready.
    #[must_use]
    pub fn errored_or_not_ready(&self) -> Vec<&str> {
        self.names_where(|outcome| outcome.is_errored() || outcome.is_not_ready())
    }

    /// Every declared node is settled.
    #[must_use]
    pub fn all_ready(&self) -> bool {
        self.declared.iter().all(|name| {
            self.outcomes
                .get(name)
                .is_some_and(NodeOutcome::is_settled)
        })
    }

    /// Some node is waiting on a condition and the pass should be retried later.
    #[must_use]
    pub fn requires_reschedule(&self) -> bool {
        self.outcomes.values().any(NodeOutcome::is_not_ready)
    }

    /// Fail with an aggregated error if any node errored.
    ///
    /// # Errors
    ///
    /// Returns `Error::Dependents` listing every errored node.
    pub fn into_error(self) -> Result<Self> {
        let failures: Vec<DependentFailure> = self
            .errored()
            .into_iter()
            .map(|(name, error)| DependentFailure {
                dependent: name.to_string(),
                error: Box::new(error.clone()),
            })
            .collect();
        if failures.is_empty() {
            Ok(self)
        } else {
            Err(Error::dependents(failures))
        }
    }

    fn names_where(&self, predicate: impl Fn(&NodeOutcome) -> bool) -> Vec<&str> {
        self.completion_order
            .iter()
            .filter(|name| self.outcomes.get(*name).is_some_and(&predicate))
            .map(String::as_str)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn declared(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| (*n).to_string()).collect()
    }

    #[test]
    fn test_all_ready_requires_every_node_settled() {
        let mut result = WorkflowResult::new(WorkflowMode::Reconcile, declared(&["a", "b"]));
        result.record("a", NodeOutcome::Succeeded(Operations::created(1)));
        assert!(!result.all_ready());
        assert_eq!(result.unreached(), vec!["b"]);

        result.record("b", NodeOutcome::SkippedInactive);
        assert!(result.all_ready());
        assert!(!result.requires_reschedule());
    }

    #[test]
    fn test_deleted_counts_as_settled() {
        let mut result = WorkflowResult::new(WorkflowMode::Reconcile, declared(&["a", "b"]));
        result.record("b", NodeOutcome::Deleted(Operations::deleted(1)));
        result.record("a", NodeOutcome::Deleted(Operations::default()));
        assert!(result.all_ready());
        assert_eq!(result.deleted(), vec!["b", "a"]);
        assert!(result.succeeded().is_empty());
    }

    #[test]
    fn test_not_ready_requests_reschedule() {
        let mut result = WorkflowResult::new(WorkflowMode::Reconcile, declared(&["a"]));
        result.record(
            "a",
            NodeOutcome::NotReady {
                operations: Operations::created(1),
                reason: "readiness condition not met".into(),
            },
        );
        assert!(result.requires_reschedule());
        assert_eq!(result.errored_or_not_ready(), vec!["a"]);
        assert!(result.into_error().is_ok());
    }

    #[test]
    fn test_into_error_aggregates() {
        let mut result = WorkflowResult::new(WorkflowMode::Cleanup, declared(&["a", "b"]));
        result.record("a", NodeOutcome::Errored(Error::adapter("a", "boom")));
        result.record("b", NodeOutcome::Errored(Error::adapter("b", "bang")));

        let err = result.into_error().err();
        assert!(matches!(
            err,
            Some(Error::Dependents { ref failures }) if failures.len() == 2
        ));
    }
}
