//! Dependents backed by cluster objects owned by the primary.
//!
//! Desired objects get an owner reference to the primary. Matching compares
//! specs only: versions, status and bookkeeping fields are the cluster's.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use steward_core::{ManagedObject, ObjectPatch, Result, ResultExt};
use tracing::debug;

use crate::context::Context;
use crate::dependent::{BulkDependentResource, BulkMutating, DependentResource, Mutating};

type SingleTemplate = dyn Fn(&ManagedObject) -> Result<(String, Value)> + Send + Sync;
type SetTemplate = dyn Fn(&ManagedObject) -> Result<BTreeMap<String, Value>> + Send + Sync;

/// One owned object of `kind`, named and shaped by a template.
#[derive(Clone)]
pub struct OwnedObject {
    kind: String,
    template: Arc<SingleTemplate>,
}

impl OwnedObject {
    /// `template` returns the object's name and spec for a primary.
    pub fn new<F>(kind: impl Into<String>, template: F) -> Self
    where
        F: Fn(&ManagedObject) -> Result<(String, Value)> + Send + Sync + 'static,
    {
        Self {
            kind: kind.into(),
            template: Arc::new(template),
        }
    }

    fn render(&self, primary: &ManagedObject) -> Result<ManagedObject> {
        let (name, spec) = (self.template)(primary)?;
        Ok(ManagedObject::new(primary.id.sibling(&self.kind, name), spec)
            .with_owner(primary.id.clone()))
    }
}

#[async_trait]
impl DependentResource for OwnedObject {
    type Resource = ManagedObject;

    async fn secondary(
        &self,
        primary: &ManagedObject,
        ctx: &Context,
    ) -> Result<Option<ManagedObject>> {
        let id = self.render(primary)?.id;
        Ok(ctx.cache().get(&id).await)
    }
}

#[async_trait]
impl Mutating for OwnedObject {
    async fn desired(&self, primary: &ManagedObject, _ctx: &Context) -> Result<ManagedObject> {
        self.render(primary)
    }

    fn matches(&self, actual: &ManagedObject, desired: &ManagedObject) -> bool {
        actual.spec == desired.spec
    }

    async fn create(
        &self,
        desired: ManagedObject,
        _primary: &ManagedObject,
        ctx: &Context,
    ) -> Result<ManagedObject> {
        debug!(id = %desired.id, "Creating owned object");
        ctx.client().create(desired).await
    }

    async fn update(
        &self,
        actual: ManagedObject,
        desired: ManagedObject,
        _primary: &ManagedObject,
        ctx: &Context,
    ) -> Result<ManagedObject> {
        ctx.client()
            .patch(
                &actual.id,
                actual.version,
                ObjectPatch::spec_and_status(desired.spec, None),
            )
            .await
    }

    async fn delete(
        &self,
        actual: ManagedObject,
        _primary: &ManagedObject,
        ctx: &Context,
    ) -> Result<()> {
        ctx.client()
            .delete(&actual.id)
            .await
            .ignore_not_found()
            .map(drop)
    }
}

/// A set of owned objects of `kind`, keyed by object name.
#[derive(Clone)]
pub struct OwnedObjects {
    kind: String,
    template: Arc<SetTemplate>,
}

impl OwnedObjects {
    /// `template` returns the spec of every desired object keyed by name.
    pub fn new<F>(kind: impl Into<String>, template: F) -> Self
    where
        F: Fn(&ManagedObject) -> Result<BTreeMap<String, Value>> + Send + Sync + 'static,
    {
        Self {
            kind: kind.into(),
            template: Arc::new(template),
        }
    }
}

#[async_trait]
impl BulkDependentResource for OwnedObjects {
    type Resource = ManagedObject;

    async fn secondaries(
        &self,
        primary: &ManagedObject,
        ctx: &Context,
    ) -> Result<BTreeMap<String, ManagedObject>> {
        Ok(ctx
            .cache()
            .owned_by(&primary.id, &self.kind)
            .await
            .into_iter()
            .map(|object| (object.id.name.clone(), object))
            .collect())
    }
}

#[async_trait]
impl BulkMutating for OwnedObjects {
    async fn desired(
        &self,
        primary: &ManagedObject,
        _ctx: &Context,
    ) -> Result<BTreeMap<String, ManagedObject>> {
        Ok((self.template)(primary)?
            .into_iter()
            .map(|(name, spec)| {
                let object = ManagedObject::new(primary.id.sibling(&self.kind, name.clone()), spec)
                    .with_owner(primary.id.clone());
                (name, object)
            })
            .collect())
    }

    fn matches(&self, actual: &ManagedObject, desired: &ManagedObject) -> bool {
        actual.spec == desired.spec
    }

    async fn create(
        &self,
        _key: &str,
        desired: ManagedObject,
        _primary: &ManagedObject,
        ctx: &Context,
    ) -> Result<ManagedObject> {
        ctx.client().create(desired).await
    }

    async fn update(
        &self,
        _key: &str,
        actual: ManagedObject,
        desired: ManagedObject,
        _primary: &ManagedObject,
        ctx: &Context,
    ) -> Result<ManagedObject> {
        ctx.client()
            .patch(
                &actual.id,
                actual.version,
                ObjectPatch::spec_and_status(desired.spec, None),
            )
            .await
    }

    async fn delete(
        &self,
        _key: &str,
        actual: ManagedObject,
        _primary: &ManagedObject,
        ctx: &Context,
    ) -> Result<()> {
        ctx.client()
            .delete(&actual.id)
            .await
            .ignore_not_found()
            .map(drop)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use serde_json::json;
    use steward_core::{ApiClient, InMemoryCluster, ResourceId};

    use super::*;

    fn primary() -> ManagedObject {
        ManagedObject::new(
            ResourceId::namespaced("WebApp", "default", "shop"),
            json!({"replicas": 2, "greeting": "hi"}),
        )
    }

    #[tokio::test]
    async fn test_owned_object_round_trip() {
        let cluster = InMemoryCluster::new_arc();
        let ctx = Context::new(primary().id, cluster.clone(), cluster.clone());
        let config = OwnedObject::new("ConfigMap", |p: &ManagedObject| {
            Ok((format!("{}-config", p.id.name), json!({"greeting": p.spec["greeting"]})))
        });

        assert!(config.secondary(&primary(), &ctx).await.unwrap().is_none());
        let desired = config.desired(&primary(), &ctx).await.unwrap();
        let created = config.create(desired.clone(), &primary(), &ctx).await.unwrap();

        assert_eq!(created.id.name, "shop-config");
        assert_eq!(created.owner, Some(primary().id));
        assert!(config.matches(&created, &desired));

        config.delete(created.clone(), &primary(), &ctx).await.unwrap();
        assert!(cluster.get_current(&created.id).await.is_err());
        // Deleting twice is fine.
        config.delete(created, &primary(), &ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_owned_objects_lists_only_owned_members() {
        let cluster = InMemoryCluster::new_arc();
        let ctx = Context::new(primary().id, cluster.clone(), cluster.clone());
        let stranger = ManagedObject::new(
            ResourceId::namespaced("Pod", "default", "stranger"),
            json!({}),
        );
        cluster.create(stranger).await.unwrap();
        let pods = OwnedObjects::new("Pod", |p: &ManagedObject| {
            Ok(BTreeMap::from([(format!("{}-0", p.id.name), json!({"index": 0}))]))
        });

        let desired = pods.desired(&primary(), &ctx).await.unwrap();
        let member = desired.get("shop-0").cloned().unwrap();
        pods.create("shop-0", member, &primary(), &ctx).await.unwrap();

        let observed = pods.secondaries(&primary(), &ctx).await.unwrap();
        assert_eq!(observed.keys().collect::<Vec<_>>(), vec!["shop-0"]);
    }
}
