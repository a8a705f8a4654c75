//! Managed object model: identity, version token, lifecycle, and patches.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable identity of a managed object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId {
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceId {
    /// Identity of a cluster-scoped object.
    pub fn cluster_scoped(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            namespace: None,
            name: name.into(),
        }
    }

    /// Identity of a namespaced object.
    pub fn namespaced(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Same namespace, different kind and name. Used for owned objects.
    #[must_use]
    pub fn sibling(&self, kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            namespace: self.namespace.clone(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// Opaque optimistic-concurrency token. Every successful write yields a new one.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Version(u64);

impl Version {
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a managed object.
///
/// `Active` until deletion is requested, `Terminating` from then until the
/// last finalizer is removed and the object disappears.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lifecycle {
    Active,
    Terminating,
}

/// A declaratively managed object as observed from the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedObject {
    pub id: ResourceId,
    /// Desired state, written by users.
    pub spec: Value,
    /// Observed state, written by the engine.
    pub status: Option<Value>,
    pub version: Version,
    /// Incremented on every spec change.
    pub generation: u64,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub owner: Option<ResourceId>,
    #[serde(default)]
    pub finalizers: BTreeSet<String>,
    #[serde(default)]
    pub deletion_requested_at: Option<DateTime<Utc>>,
}

impl ManagedObject {
    /// A fresh object that has never been written.
    pub fn new(id: ResourceId, spec: Value) -> Self {
        Self {
            id,
            spec,
            status: None,
            version: Version::default(),
            generation: 0,
            labels: BTreeMap::new(),
            owner: None,
            finalizers: BTreeSet::new(),
            deletion_requested_at: None,
        }
    }

    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_owner(mut self, owner: ResourceId) -> Self {
        self.owner = Some(owner);
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: Value) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub const fn lifecycle(&self) -> Lifecycle {
        if self.deletion_requested_at.is_some() {
            Lifecycle::Terminating
        } else {
            Lifecycle::Active
        }
    }

    #[must_use]
    pub const fn is_terminating(&self) -> bool {
        matches!(self.lifecycle(), Lifecycle::Terminating)
    }

    #[must_use]
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.contains(finalizer)
    }

    #[must_use]
    pub fn is_owned_by(&self, owner: &ResourceId) -> bool {
        self.owner.as_ref() == Some(owner)
    }
}

/// Delta applied by a version-checked write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectPatch {
    pub spec: Option<Value>,
    pub status: Option<Value>,
    pub add_finalizer: Option<String>,
    pub remove_finalizer: Option<String>,
}

impl ObjectPatch {
    #[must_use]
    pub fn status(status: Value) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn spec_and_status(spec: Value, status: Option<Value>) -> Self {
        Self {
            spec: Some(spec),
            status,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn add_finalizer(finalizer: impl Into<String>) -> Self {
        Self {
            add_finalizer: Some(finalizer.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn remove_finalizer(finalizer: impl Into<String>) -> Self {
        Self {
            remove_finalizer: Some(finalizer.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.spec.is_none()
            && self.status.is_none()
            && self.add_finalizer.is_none()
            && self.remove_finalizer.is_none()
    }

    /// Apply to a copy of `object`. Version bookkeeping is the writer's job.
    #[must_use]
    pub fn apply_to(&self, object: &ManagedObject) -> ManagedObject {
        let mut updated = object.clone();
        if let Some(spec) = &self.spec {
            if *spec != updated.spec {
                updated.generation = updated.generation.saturating_add(1);
            }
            updated.spec = spec.clone();
        }
        if let Some(status) = &self.status {
            updated.status = Some(status.clone());
        }
        if let Some(finalizer) = &self.add_finalizer {
            updated.finalizers.insert(finalizer.clone());
        }
        if let Some(finalizer) = &self.remove_finalizer {
            updated.finalizers.remove(finalizer);
        }
        updated
    }
}
