//! Collaborator interfaces: the cluster API client and the read-through object cache.

use async_trait::async_trait;

use crate::Result;
use crate::resource::{ManagedObject, ObjectPatch, ResourceId, Version};

/// Write access to the cluster.
///
/// Every mutating call is version-checked: a write whose `expected` version
/// no longer matches the stored object fails with [`crate::Error::Conflict`].
#[async_trait]
pub trait ApiClient: Send + Sync {
    /// Fetch the authoritative current state.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the object does not exist.
    async fn get_current(&self, id: &ResourceId) -> Result<ManagedObject>;

    /// Create a new object. Its version is assigned by the cluster.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if an object with the same identity exists.
    async fn create(&self, object: ManagedObject) -> Result<ManagedObject>;

    /// Apply `patch` if the stored version equals `expected`.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` on a version mismatch and `NotFound` if the object is gone.
    async fn patch(
        &self,
        id: &ResourceId,
        expected: Version,
        patch: ObjectPatch,
    ) -> Result<ManagedObject>;

    /// Request deletion. Objects holding finalizers become terminating instead
    /// of disappearing.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the object does not exist.
    async fn delete(&self, id: &ResourceId) -> Result<()>;
}

/// Read-only, eventually consistent view of the cluster.
#[async_trait]
pub trait ObjectCache: Send + Sync {
    async fn get(&self, id: &ResourceId) -> Option<ManagedObject>;

    async fn list(&self, kind: &str) -> Vec<ManagedObject>;

    /// Objects of `kind` whose owner reference points at `owner`.
    async fn owned_by(&self, owner: &ResourceId, kind: &str) -> Vec<ManagedObject> {
        self.list(kind)
            .await
            .into_iter()
            .filter(|object| object.is_owned_by(owner))
            .collect()
    }
}
