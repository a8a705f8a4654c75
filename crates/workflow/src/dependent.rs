//! Dependent resource traits.
//!
//! A dependent resource is a secondary object whose desired state is derived
//! from the primary. What the engine may do with it is fixed by which trait
//! the adapter implements:
//!
//! | | read-only | mutating |
//! |---|---|---|
//! | singleton | [`DependentResource`] | [`Mutating`] |
//! | bulk | [`BulkDependentResource`] | [`BulkMutating`] |
//!
//! The capability is recorded when the node is declared (see
//! [`crate::Dependent`]) and never re-derived at run time.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Add;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use steward_core::{ManagedObject, Result};

use crate::context::Context;

/// Whether the engine may write the dependent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Access {
    ReadOnly,
    Mutating,
}

/// One secondary object, or a keyed set of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cardinality {
    Singleton,
    Bulk,
}

/// Capability tag of a declared node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Capability {
    pub access: Access,
    pub cardinality: Cardinality,
}

impl Capability {
    #[must_use]
    pub const fn new(access: Access, cardinality: Cardinality) -> Self {
        Self {
            access,
            cardinality,
        }
    }

    #[must_use]
    pub const fn is_mutating(self) -> bool {
        matches!(self.access, Access::Mutating)
    }

    #[must_use]
    pub const fn is_bulk(self) -> bool {
        matches!(self.cardinality, Cardinality::Bulk)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let access = match self.access {
            Access::ReadOnly => "read-only",
            Access::Mutating => "mutating",
        };
        let cardinality = match self.cardinality {
            Cardinality::Singleton => "singleton",
            Cardinality::Bulk => "bulk",
        };
        write!(f, "{access} {cardinality}")
    }
}

/// Observed state of a dependent as seen by conditions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observed<R> {
    Single(Option<R>),
    Bulk(BTreeMap<String, R>),
}

impl<R> Observed<R> {
    /// Something exists: the singleton is present, or at least one member is.
    pub fn is_present(&self) -> bool {
        match self {
            Self::Single(value) => value.is_some(),
            Self::Bulk(members) => !members.is_empty(),
        }
    }

    pub const fn single(&self) -> Option<&R> {
        match self {
            Self::Single(value) => value.as_ref(),
            Self::Bulk(_) => None,
        }
    }

    pub const fn members(&self) -> Option<&BTreeMap<String, R>> {
        match self {
            Self::Single(_) => None,
            Self::Bulk(members) => Some(members),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Single(value) => usize::from(value.is_some()),
            Self::Bulk(members) => members.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.is_present()
    }
}

/// What a node did during one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operations {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
}

impl Operations {
    #[must_use]
    pub const fn created(count: usize) -> Self {
        Self {
            created: count,
            updated: 0,
            deleted: 0,
            unchanged: 0,
        }
    }

    #[must_use]
    pub const fn updated(count: usize) -> Self {
        Self {
            created: 0,
            updated: count,
            deleted: 0,
            unchanged: 0,
        }
    }

    #[must_use]
    pub const fn deleted(count: usize) -> Self {
        Self {
            created: 0,
            updated: 0,
            deleted: count,
            unchanged: 0,
        }
    }

    #[must_use]
    pub const fn unchanged(count: usize) -> Self {
        Self {
            created: 0,
            updated: 0,
            deleted: 0,
            unchanged: count,
        }
    }

    /// True when the pass wrote something.
    #[must_use]
    pub const fn changed_anything(&self) -> bool {
        self.created > 0 || self.updated > 0 || self.deleted > 0
    }
}

impl Add for Operations {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            created: self.created.saturating_add(rhs.created),
            updated: self.updated.saturating_add(rhs.updated),
            deleted: self.deleted.saturating_add(rhs.deleted),
            unchanged: self.unchanged.saturating_add(rhs.unchanged),
        }
    }
}

/// Read side of a singleton dependent.
#[async_trait]
pub trait DependentResource: Send + Sync + 'static {
    type Resource: Clone + PartialEq + fmt::Debug + Send + Sync + 'static;

    /// Current secondary object for `primary`, if it exists.
    async fn secondary(
        &self,
        primary: &ManagedObject,
        ctx: &Context,
    ) -> Result<Option<Self::Resource>>;
}

/// A singleton dependent the engine creates, updates, and deletes.
#[async_trait]
pub trait Mutating: DependentResource {
    /// Desired secondary state derived from the primary.
    async fn desired(&self, primary: &ManagedObject, ctx: &Context) -> Result<Self::Resource>;

    /// Whether `actual` already satisfies `desired`. Updates are skipped when it does.
    fn matches(&self, actual: &Self::Resource, desired: &Self::Resource) -> bool {
        actual == desired
    }

    async fn create(
        &self,
        desired: Self::Resource,
        primary: &ManagedObject,
        ctx: &Context,
    ) -> Result<Self::Resource>;

    async fn update(
        &self,
        actual: Self::Resource,
        desired: Self::Resource,
        primary: &ManagedObject,
        ctx: &Context,
    ) -> Result<Self::Resource>;

    async fn delete(
        &self,
        actual: Self::Resource,
        primary: &ManagedObject,
        ctx: &Context,
    ) -> Result<()>;
}

/// Read side of a keyed set of secondaries.
#[async_trait]
pub trait BulkDependentResource: Send + Sync + 'static {
    type Resource: Clone + PartialEq + fmt::Debug + Send + Sync + 'static;

    /// Observed members keyed by discriminator.
    async fn secondaries(
        &self,
        primary: &ManagedObject,
        ctx: &Context,
    ) -> Result<BTreeMap<String, Self::Resource>>;
}

/// A keyed set of secondaries reconciled member by member.
#[async_trait]
pub trait BulkMutating: BulkDependentResource {
    /// Desired members keyed by discriminator.
    async fn desired(
        &self,
        primary: &ManagedObject,
        ctx: &Context,
    ) -> Result<BTreeMap<String, Self::Resource>>;

    fn matches(&self, actual: &Self::Resource, desired: &Self::Resource) -> bool {
        actual == desired
    }

    async fn create(
        &self,
        key: &str,
        desired: Self::Resource,
        primary: &ManagedObject,
        ctx: &Context,
    ) -> Result<Self::Resource>;

    async fn update(
        &self,
        key: &str,
        actual: Self::Resource,
        desired: Self::Resource,
        primary: &ManagedObject,
        ctx: &Context,
    ) -> Result<Self::Resource>;

    async fn delete(
        &self,
        key: &str,
        actual: Self::Resource,
        primary: &ManagedObject,
        ctx: &Context,
    ) -> Result<()>;
}
