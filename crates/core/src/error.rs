//! Core error types for steward operations.
//!
//! All errors are explicit, typed, and recoverable - no panics allowed.
//! The variants double as the failure taxonomy the retry governor classifies.

use std::fmt;
use std::path::PathBuf;

use itertools::Itertools;
use thiserror::Error;

use crate::resource::{ResourceId, Version};

/// Core error type for steward operations.
#[derive(Debug, Clone, Error)]
pub enum Error {
    // Write-path errors
    #[error("version conflict on {id}: expected {expected}, found {actual}")]
    Conflict {
        id: ResourceId,
        expected: Version,
        actual: Version,
    },

    #[error("object not found: {id}")]
    NotFound { id: ResourceId },

    #[error("object already exists: {id}")]
    AlreadyExists { id: ResourceId },

    // Workflow errors
    #[error("dependent '{dependent}' failed: {reason}")]
    Adapter { dependent: String, reason: String },

    #[error("condition on '{dependent}' could not be evaluated: {reason}")]
    ConditionEvaluation { dependent: String, reason: String },

    #[error("{}", DependentFailures(.failures))]
    Dependents { failures: Vec<DependentFailure> },

    // Reconciler errors
    #[error("reconciler failed: {reason}")]
    Reconciler { reason: String },

    #[error("dispatch for {id} panicked")]
    DispatchPanicked { id: ResourceId },

    // Graph construction errors
    #[error("dependency cycle detected between: {}", .nodes.join(" -> "))]
    CyclicGraph { nodes: Vec<String> },

    #[error("dependent '{name}' declared more than once")]
    DuplicateNode { name: String },

    #[error("dependent '{node}' depends on unknown dependent '{dependency}'")]
    UnknownDependency { node: String, dependency: String },

    // Configuration errors
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("TOML parse error: {reason}")]
    ConfigParse { reason: String },

    #[error("failed to read file '{path}': {reason}")]
    FileReadFailed { path: PathBuf, reason: String },

    // Lifecycle
    #[error("engine is shutting down")]
    ShuttingDown,
}

/// One failed node inside an aggregated workflow error.
#[derive(Debug, Clone)]
pub struct DependentFailure {
    pub dependent: String,
    pub error: Box<Error>,
}

struct DependentFailures<'a>(&'a [DependentFailure]);

impl fmt::Display for DependentFailures<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} dependent resource(s) failed: {}",
            self.0.len(),
            self.0
                .iter()
                .map(|failure| format!("{}: {}", failure.dependent, failure.error))
                .join("; ")
        )
    }
}

impl Error {
    /// Create a version conflict error.
    pub const fn conflict(id: ResourceId, expected: Version, actual: Version) -> Self {
        Self::Conflict {
            id,
            expected,
            actual,
        }
    }

    /// Create a not-found error.
    pub const fn not_found(id: ResourceId) -> Self {
        Self::NotFound { id }
    }

    /// Create an adapter error for a named dependent.
    pub fn adapter(dependent: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Adapter {
            dependent: dependent.into(),
            reason: reason.into(),
        }
    }

    /// Create a condition evaluation error.
    pub fn condition_evaluation(dependent: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConditionEvaluation {
            dependent: dependent.into(),
            reason: reason.into(),
        }
    }

    /// Create a reconciler error.
    pub fn reconciler(reason: impl Into<String>) -> Self {
        Self::Reconciler {
            reason: reason.into(),
        }
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create a TOML parse error.
    pub fn config_parse(reason: impl Into<String>) -> Self {
        Self::ConfigParse {
            reason: reason.into(),
        }
    }

    /// Create a file read error.
    pub fn file_read_failed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::FileReadFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Aggregate per-node failures into one error.
    pub const fn dependents(failures: Vec<DependentFailure>) -> Self {
        Self::Dependents { failures }
    }

    /// True for optimistic-concurrency failures, including an aggregate
    /// made up only of conflicts.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Conflict { .. } => true,
            Self::Dependents { failures } => {
                !failures.is_empty() && failures.iter().all(|f| f.error.is_conflict())
            }
            _ => false,
        }
    }

    /// True for errors that retrying cannot fix.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::CyclicGraph { .. }
                | Self::DuplicateNode { .. }
                | Self::UnknownDependency { .. }
                | Self::InvalidConfig { .. }
                | Self::ConfigParse { .. }
                | Self::DispatchPanicked { .. }
        )
    }
}
