//! Node declarations and their type-erased runtime form.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use steward_core::{Error, ManagedObject, Result};

use crate::bulk;
use crate::condition::{Condition, ConditionKind};
use crate::context::Context;
use crate::dependent::{
    Access, BulkDependentResource, BulkMutating, Capability, Cardinality, DependentResource,
    Mutating, Observed, Operations,
};

/// Capability-specific operations over a dependent with resource type `R`.
#[async_trait]
trait Adapter<R>: Send + Sync
where
    R: Send + Sync + 'static,
{
    fn capability(&self) -> Capability;

    async fn observe(&self, primary: &ManagedObject, ctx: &Context) -> Result<Observed<R>>;

    async fn reconcile(&self, name: &str, primary: &ManagedObject, ctx: &Context)
    -> Result<Operations>;

    async fn delete(&self, name: &str, primary: &ManagedObject, ctx: &Context)
    -> Result<Operations>;
}

struct ReadOnlySingleton<D>(D);
struct MutatingSingleton<D>(D);
struct ReadOnlyBulk<D>(D);
struct MutatingBulk<D>(D);

#[async_trait]
impl<D: DependentResource> Adapter<D::Resource> for ReadOnlySingleton<D> {
    fn capability(&self) -> Capability {
        Capability::new(Access::ReadOnly, Cardinality::Singleton)
    }

    async fn observe(
        &self,
        primary: &ManagedObject,
        ctx: &Context,
    ) -> Result<Observed<D::Resource>> {
        self.0.secondary(primary, ctx).await.map(Observed::Single)
    }

    async fn reconcile(
        &self,
        _name: &str,
        primary: &ManagedObject,
        ctx: &Context,
    ) -> Result<Operations> {
        let observed = self.0.secondary(primary, ctx).await?;
        Ok(Operations::unchanged(usize::from(observed.is_some())))
    }

    async fn delete(
        &self,
        _name: &str,
        _primary: &ManagedObject,
        _ctx: &Context,
    ) -> Result<Operations> {
        Ok(Operations::default())
    }
}

#[async_trait]
impl<D: Mutating> Adapter<D::Resource> for MutatingSingleton<D> {
    fn capability(&self) -> Capability {
        Capability::new(Access::Mutating, Cardinality::Singleton)
    }

    async fn observe(
        &self,
        primary: &ManagedObject,
        ctx: &Context,
    ) -> Result<Observed<D::Resource>> {
        self.0.secondary(primary, ctx).await.map(Observed::Single)
    }

    async fn reconcile(
        &self,
        name: &str,
        primary: &ManagedObject,
        ctx: &Context,
    ) -> Result<Operations> {
        let desired = self.0.desired(primary, ctx).await?;
        match self.0.secondary(primary, ctx).await? {
            None => {
                tracing::debug!(dependent = name, "Creating dependent");
                self.0.create(desired, primary, ctx).await?;
                Ok(Operations::created(1))
            }
            Some(actual) if self.0.matches(&actual, &desired) => Ok(Operations::unchanged(1)),
            Some(actual) => {
                tracing::debug!(dependent = name, "Updating dependent");
                self.0.update(actual, desired, primary, ctx).await?;
                Ok(Operations::updated(1))
            }
        }
    }

    async fn delete(
        &self,
        name: &str,
        primary: &ManagedObject,
        ctx: &Context,
    ) -> Result<Operations> {
        match self.0.secondary(primary, ctx).await? {
            Some(actual) => {
                tracing::debug!(dependent = name, "Deleting dependent");
                self.0.delete(actual, primary, ctx).await?;
                Ok(Operations::deleted(1))
            }
            None => Ok(Operations::default()),
        }
    }
}

#[async_trait]
impl<D: BulkDependentResource> Adapter<D::Resource> for ReadOnlyBulk<D> {
    fn capability(&self) -> Capability {
        Capability::new(Access::ReadOnly, Cardinality::Bulk)
    }

    async fn observe(
        &self,
        primary: &ManagedObject,
        ctx: &Context,
    ) -> Result<Observed<D::Resource>> {
        self.0.secondaries(primary, ctx).await.map(Observed::Bulk)
    }

    async fn reconcile(
        &self,
        _name: &str,
        primary: &ManagedObject,
        ctx: &Context,
    ) -> Result<Operations> {
        let observed = self.0.secondaries(primary, ctx).await?;
        Ok(Operations::unchanged(observed.len()))
    }

    async fn delete(
        &self,
        _name: &str,
        _primary: &ManagedObject,
        _ctx: &Context,
    ) -> Result<Operations> {
        Ok(Operations::default())
    }
}

#[async_trait]
impl<D: BulkMutating> Adapter<D::Resource> for MutatingBulk<D> {
    fn capability(&self) -> Capability {
        Capability::new(Access::Mutating, Cardinality::Bulk)
    }

    async fn observe(
        &self,
        primary: &ManagedObject,
        ctx: &Context,
    ) -> Result<Observed<D::Resource>> {
        self.0.secondaries(primary, ctx).await.map(Observed::Bulk)
    }

    async fn reconcile(
        &self,
        name: &str,
        primary: &ManagedObject,
        ctx: &Context,
    ) -> Result<Operations> {
        let desired = self.0.desired(primary, ctx).await?;
        let actual = self.0.secondaries(primary, ctx).await?;
        let plan = bulk::plan(actual, desired, |a, d| self.0.matches(a, d));
        bulk::apply(name, &self.0, plan, primary, ctx).await
    }

    async fn delete(
        &self,
        name: &str,
        primary: &ManagedObject,
        ctx: &Context,
    ) -> Result<Operations> {
        bulk::delete_all(name, &self.0, primary, ctx).await
    }
}

type SharedCondition<R> = Arc<dyn Condition<R>>;

/// Declaration of one workflow node over resource type `R`.
///
/// ```ignore
/// let config = Dependent::mutating("config", ConfigMapDependent)
///     .ready_when(|_, observed, _| Ok(observed.is_present()));
/// let pods = Dependent::bulk("pods", PodSet).depends_on("config");
/// ```
pub struct Dependent<R> {
    name: String,
    adapter: Arc<dyn Adapter<R>>,
    depends_on: Vec<String>,
    conditions: BTreeMap<ConditionKind, SharedCondition<R>>,
}

impl<R> Dependent<R>
where
    R: Send + Sync + 'static,
{
    fn with_adapter(name: impl Into<String>, adapter: Arc<dyn Adapter<R>>) -> Self {
        Self {
            name: name.into(),
            adapter,
            depends_on: Vec::new(),
            conditions: BTreeMap::new(),
        }
    }

    /// A singleton the engine only reads.
    pub fn read_only<D>(name: impl Into<String>, dependent: D) -> Self
    where
        D: DependentResource<Resource = R>,
    {
        Self::with_adapter(name, Arc::new(ReadOnlySingleton(dependent)))
    }

    /// A singleton the engine creates, updates, and deletes.
    pub fn mutating<D>(name: impl Into<String>, dependent: D) -> Self
    where
        D: Mutating<Resource = R>,
    {
        Self::with_adapter(name, Arc::new(MutatingSingleton(dependent)))
    }

    /// A keyed set the engine only reads.
    pub fn bulk_read_only<D>(name: impl Into<String>, dependent: D) -> Self
    where
        D: BulkDependentResource<Resource = R>,
    {
        Self::with_adapter(name, Arc::new(ReadOnlyBulk(dependent)))
    }

    /// A keyed set diffed and written member by member.
    pub fn bulk<D>(name: impl Into<String>, dependent: D) -> Self
    where
        D: BulkMutating<Resource = R>,
    {
        Self::with_adapter(name, Arc::new(MutatingBulk(dependent)))
    }

    #[must_use]
    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        self.depends_on.push(dependency.into());
        self
    }

    #[must_use]
    pub fn with_condition(mut self, kind: ConditionKind, condition: impl Condition<R> + 'static) -> Self {
        self.conditions.insert(kind, Arc::new(condition));
        self
    }

    #[must_use]
    pub fn activate_when<F>(self, condition: F) -> Self
    where
        F: Fn(&ManagedObject, &Observed<R>, &Context) -> Result<bool> + Send + Sync + 'static,
    {
        self.with_condition(ConditionKind::Activation, condition)
    }

    /// Reconcile only while `condition` holds. Otherwise the dependent is
    /// deleted, and so is everything that depends on it.
    #[must_use]
    pub fn reconcile_when<F>(self, condition: F) -> Self
    where
        F: Fn(&ManagedObject, &Observed<R>, &Context) -> Result<bool> + Send + Sync + 'static,
    {
        self.with_condition(ConditionKind::ReconcilePrecondition, condition)
    }

    #[must_use]
    pub fn ready_when<F>(self, condition: F) -> Self
    where
        F: Fn(&ManagedObject, &Observed<R>, &Context) -> Result<bool> + Send + Sync + 'static,
    {
        self.with_condition(ConditionKind::Ready, condition)
    }

    #[must_use]
    pub fn cleanup_when<F>(self, condition: F) -> Self
    where
        F: Fn(&ManagedObject, &Observed<R>, &Context) -> Result<bool> + Send + Sync + 'static,
    {
        self.with_condition(ConditionKind::CleanupReady, condition)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capability(&self) -> Capability {
        self.adapter.capability()
    }

    pub(crate) fn into_parts(self) -> (String, Vec<String>, Arc<dyn NodeRuntime>) {
        let runtime = TypedNode {
            name: self.name.clone(),
            adapter: self.adapter,
            conditions: self.conditions,
        };
        (self.name, self.depends_on, Arc::new(runtime))
    }
}

/// Resource-type-erased node as stored in a built workflow.
#[async_trait]
pub(crate) trait NodeRuntime: Send + Sync {
    fn capability(&self) -> Capability;

    /// `None` when no condition of `kind` is attached.
    async fn evaluate(
        &self,
        kind: ConditionKind,
        primary: &ManagedObject,
        ctx: &Context,
    ) -> Option<Result<bool>>;

    async fn reconcile(&self, primary: &ManagedObject, ctx: &Context) -> Result<Operations>;

    async fn delete(&self, primary: &ManagedObject, ctx: &Context) -> Result<Operations>;
}

struct TypedNode<R> {
    name: String,
    adapter: Arc<dyn Adapter<R>>,
    conditions: BTreeMap<ConditionKind, SharedCondition<R>>,
}

#[async_trait]
impl<R> NodeRuntime for TypedNode<R>
where
    R: Send + Sync + 'static,
{
    fn capability(&self) -> Capability {
        self.adapter.capability()
    }

    async fn evaluate(
        &self,
        kind: ConditionKind,
        primary: &ManagedObject,
        ctx: &Context,
    ) -> Option<Result<bool>> {
        let condition = self.conditions.get(&kind)?;
        let outcome = match self.adapter.observe(primary, ctx).await {
            Ok(observed) => condition.is_met(primary, &observed, ctx),
            Err(e) => Err(e),
        };
        Some(outcome.map_err(|e| match e {
            Error::ConditionEvaluation { .. } => e,
            other => Error::condition_evaluation(&self.name, format!("{kind}: {other}")),
        }))
    }

    async fn reconcile(&self, primary: &ManagedObject, ctx: &Context) -> Result<Operations> {
        self.adapter.reconcile(&self.name, primary, ctx).await
    }

    async fn delete(&self, primary: &ManagedObject, ctx: &Context) -> Result<Operations> {
        self.adapter.delete(&self.name, primary, ctx).await
    }
}
