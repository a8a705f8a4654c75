//! Engine settings.
//!
//! # Hierarchy
//!
//! Settings are resolved in this order (later overrides earlier):
//! 1. Built-in defaults
//! 2. A TOML file passed to [`EngineSettings::from_file`]
//! 3. Environment variables: `STEWARD_*` (see [`EngineSettings::apply_env_overrides`])
//!
//! Settings are consumed immutably once the engine is constructed.
//!
//! # Example Config
//!
//! ```toml
//! name = "webapp-controller"
//! kind = "WebApp"
//! workers = 8
//! finalizer = "webapps.steward.io/finalizer"
//! namespaces = ["prod", "staging"]
//!
//! [label_selector]
//! team = "storefront"
//!
//! [retry]
//! max_attempts = 5
//! initial_interval_ms = 2000
//! multiplier = 1.5
//! max_interval_ms = 60000
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::resource::ManagedObject;
use crate::{Error, Result};

// ═══════════════════════════════════════════════════════════════════════════
// CONFIGURATION STRUCTURES
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineSettings {
    /// Controller name, used in logs.
    pub name: String,
    /// Kind of the primary objects this engine reconciles.
    pub kind: String,
    /// Maximum number of concurrent dispatches across all identities.
    pub workers: usize,
    /// Finalizer placed on primaries. `None` disables finalization.
    pub finalizer: Option<String>,
    /// Namespaces to watch. Empty means all.
    pub namespaces: Vec<String>,
    /// Labels a primary must carry to be reconciled.
    pub label_selector: BTreeMap<String, String>,
    /// Backoff for failed dispatches.
    pub retry: RetrySettings,
    /// Dependent workflow execution.
    pub workflow: WorkflowSettings,
    /// Re-sync interval after a successful dispatch that asked for nothing.
    pub max_reconciliation_interval_ms: Option<u64>,
    /// Skip update events that did not change the primary's generation.
    pub generation_aware: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrySettings {
    /// When false, a failed dispatch waits for the next trigger.
    pub enabled: bool,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Delay before the first retry.
    pub initial_interval_ms: u64,
    /// Factor applied to the delay after each retry.
    pub multiplier: f64,
    /// Upper bound on the delay. `None` lets it grow.
    pub max_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkflowSettings {
    /// Sibling dependents allowed to run at once.
    pub max_concurrency: usize,
    /// Delay before re-checking a workflow that is not ready yet.
    pub readiness_recheck_interval_ms: u64,
}

// ═══════════════════════════════════════════════════════════════════════════
// DEFAULT IMPLEMENTATIONS
// ═══════════════════════════════════════════════════════════════════════════

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            name: "steward".to_string(),
            kind: String::new(),
            workers: 10,
            finalizer: None,
            namespaces: Vec::new(),
            label_selector: BTreeMap::new(),
            retry: RetrySettings::default(),
            workflow: WorkflowSettings::default(),
            max_reconciliation_interval_ms: None,
            generation_aware: true,
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: Some(5),
            initial_interval_ms: 2000,
            multiplier: 1.5,
            max_interval_ms: None,
        }
    }
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            readiness_recheck_interval_ms: 5000,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// LOADING AND VALIDATION
// ═══════════════════════════════════════════════════════════════════════════

impl EngineSettings {
    /// Defaults for a controller of `kind`.
    pub fn for_kind(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Self::default()
        }
    }

    /// Parse and validate settings from TOML text.
    ///
    /// # Errors
    ///
    /// Returns `ConfigParse` for malformed TOML and `InvalidConfig` when a
    /// value is out of range.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let settings = Self::parse_toml_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse TOML text without validating, for callers that fill in
    /// defaults before [`Self::validate`] runs.
    ///
    /// # Errors
    ///
    /// Returns `ConfigParse` for malformed TOML.
    pub fn parse_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::config_parse(e.to_string()))
    }

    /// Read, parse, and validate a TOML settings file.
    ///
    /// # Errors
    ///
    /// Returns `FileReadFailed` if the file cannot be read, otherwise as
    /// [`Self::from_toml_str`].
    pub fn from_file(path: &Path) -> Result<Self> {
        let settings = Self::parse_file(path)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Read and parse a TOML settings file without validating it.
    ///
    /// # Errors
    ///
    /// Returns `FileReadFailed` if the file cannot be read and `ConfigParse`
    /// for malformed TOML.
    pub fn parse_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::file_read_failed(path, e.to_string()))?;
        Self::parse_toml_str(&raw)
    }

    /// Override fields from `STEWARD_*` variables looked up through `lookup`.
    ///
    /// Recognised: `STEWARD_WORKERS`, `STEWARD_FINALIZER`, `STEWARD_NAMESPACES`
    /// (comma separated).
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` when a variable cannot be parsed or the result
    /// fails validation.
    pub fn apply_env_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(workers) = lookup("STEWARD_WORKERS") {
            self.workers = workers
                .trim()
                .parse()
                .map_err(|_| Error::invalid_config(format!("STEWARD_WORKERS='{workers}'")))?;
        }
        if let Some(finalizer) = lookup("STEWARD_FINALIZER") {
            self.finalizer = Some(finalizer).filter(|f| !f.is_empty());
        }
        if let Some(namespaces) = lookup("STEWARD_NAMESPACES") {
            self.namespaces = namespaces
                .split(',')
                .map(str::trim)
                .filter(|ns| !ns.is_empty())
                .map(String::from)
                .collect();
        }
        self.validate()?;
        Ok(self)
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.kind.trim().is_empty() {
            return Err(Error::invalid_config("kind must not be empty"));
        }
        if self.workers == 0 {
            return Err(Error::invalid_config("workers must be at least 1"));
        }
        if self.workflow.max_concurrency == 0 {
            return Err(Error::invalid_config(
                "workflow.max_concurrency must be at least 1",
            ));
        }
        if self.finalizer.as_deref().is_some_and(str::is_empty) {
            return Err(Error::invalid_config("finalizer must not be empty"));
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(Error::invalid_config("retry.multiplier must be >= 1.0"));
        }
        if let Some(max) = self.retry.max_interval_ms {
            if max < self.retry.initial_interval_ms {
                return Err(Error::invalid_config(
                    "retry.max_interval_ms must not be below retry.initial_interval_ms",
                ));
            }
        }
        Ok(())
    }

    /// Whether a primary falls inside the namespace and label scope.
    #[must_use]
    pub fn in_scope(&self, object: &ManagedObject) -> bool {
        let namespace_ok = self.namespaces.is_empty()
            || object
                .id
                .namespace
                .as_ref()
                .is_some_and(|ns| self.namespaces.contains(ns));
        let labels_ok = self
            .label_selector
            .iter()
            .all(|(key, value)| object.labels.get(key) == Some(value));
        namespace_ok && labels_ok
    }

    #[must_use]
    pub fn max_reconciliation_interval(&self) -> Option<Duration> {
        self.max_reconciliation_interval_ms
            .map(Duration::from_millis)
    }
}

impl WorkflowSettings {
    #[must_use]
    pub const fn readiness_recheck_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_recheck_interval_ms)
    }
}
