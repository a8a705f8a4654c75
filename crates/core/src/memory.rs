//! In-memory cluster for tests and demos.
//!
//! Implements both [`ApiClient`] and [`ObjectCache`] over one map and
//! broadcasts every committed change. Semantics follow a real control plane:
//! versions are assigned from one global counter, writes are version-checked,
//! and deletion of an object that still carries finalizers only marks it
//! terminating.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use serde_json::Value;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, warn};

use crate::api::{ApiClient, ObjectCache};
use crate::event::ChangeEvent;
use crate::resource::{ManagedObject, ObjectPatch, ResourceId, Version};
use crate::{Error, Result};

const FEED_CAPACITY: usize = 1024;

/// In-memory cluster store.
pub struct InMemoryCluster {
    objects: RwLock<HashMap<ResourceId, ManagedObject>>,
    last_version: AtomicU64,
    writes: AtomicUsize,
    injected_conflicts: RwLock<HashMap<ResourceId, usize>>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        let (changes, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            objects: RwLock::new(HashMap::new()),
            last_version: AtomicU64::new(0),
            writes: AtomicUsize::new(0),
            injected_conflicts: RwLock::new(HashMap::new()),
            changes,
        }
    }
}

impl InMemoryCluster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Receive every change committed after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    /// The change feed as a stream. Ends when the cluster is dropped.
    #[must_use]
    pub fn watch(&self) -> BoxStream<'static, ChangeEvent> {
        change_stream(self.subscribe())
    }

    /// Number of successful writes (create, patch, delete) so far.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make the next `count` patches of `id` fail with a conflict.
    pub async fn inject_conflicts(&self, id: &ResourceId, count: usize) {
        self.injected_conflicts
            .write()
            .await
            .insert(id.clone(), count);
    }

    /// Replace the spec of an object the way a user edit would, without a
    /// version check.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the object does not exist.
    pub async fn update_spec(&self, id: &ResourceId, spec: Value) -> Result<ManagedObject> {
        let mut objects = self.objects.write().await;
        let current = objects
            .get(id)
            .ok_or_else(|| Error::not_found(id.clone()))?;
        let mut updated = ObjectPatch::spec_and_status(spec, None).apply_to(current);
        updated.version = self.next_version();
        objects.insert(id.clone(), updated.clone());
        self.commit(ChangeEvent::updated(updated.clone()));
        Ok(updated)
    }

    fn next_version(&self) -> Version {
        Version::new(self.last_version.fetch_add(1, Ordering::SeqCst).saturating_add(1))
    }

    fn commit(&self, event: ChangeEvent) {
        self.writes.fetch_add(1, Ordering::SeqCst);
        debug!(id = %event.id(), action = ?event.action, version = %event.object.version, "Committed change");
        // No subscribers is fine.
        let _ = self.changes.send(event);
    }

    async fn take_injected_conflict(&self, id: &ResourceId) -> bool {
        let mut injected = self.injected_conflicts.write().await;
        match injected.get_mut(id) {
            Some(remaining) if *remaining > 0 => {
                *remaining = remaining.saturating_sub(1);
                true
            }
            _ => false,
        }
    }
}

/// Adapt a broadcast receiver into a change stream, skipping lagged gaps.
#[must_use]
pub fn change_stream(receiver: broadcast::Receiver<ChangeEvent>) -> BoxStream<'static, ChangeEvent> {
    Box::pin(futures::stream::unfold(receiver, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => return Some((event, rx)),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Change feed lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }))
}

#[async_trait]
impl ApiClient for InMemoryCluster {
    async fn get_current(&self, id: &ResourceId) -> Result<ManagedObject> {
        self.objects
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(id.clone()))
    }

    async fn create(&self, object: ManagedObject) -> Result<ManagedObject> {
        let mut objects = self.objects.write().await;
        if objects.contains_key(&object.id) {
            return Err(Error::AlreadyExists { id: object.id });
        }
        let mut created = object;
        created.version = self.next_version();
        created.generation = 1;
        created.deletion_requested_at = None;
        objects.insert(created.id.clone(), created.clone());
        self.commit(ChangeEvent::added(created.clone()));
        Ok(created)
    }

    async fn patch(
        &self,
        id: &ResourceId,
        expected: Version,
        patch: ObjectPatch,
    ) -> Result<ManagedObject> {
        if self.take_injected_conflict(id).await {
            let actual = self
                .objects
                .read()
                .await
                .get(id)
                .map_or(expected, |object| object.version);
            return Err(Error::conflict(id.clone(), expected, actual.next()));
        }

        let mut objects = self.objects.write().await;
        let current = objects
            .get(id)
            .ok_or_else(|| Error::not_found(id.clone()))?;
        if current.version != expected {
            return Err(Error::conflict(id.clone(), expected, current.version));
        }

        let mut updated = patch.apply_to(current);
        updated.version = self.next_version();

        if updated.is_terminating() && updated.finalizers.is_empty() {
            objects.remove(id);
            self.commit(ChangeEvent::deleted(updated.clone()));
        } else {
            objects.insert(id.clone(), updated.clone());
            self.commit(ChangeEvent::updated(updated.clone()));
        }
        Ok(updated)
    }

    async fn delete(&self, id: &ResourceId) -> Result<()> {
        let mut objects = self.objects.write().await;
        let current = objects
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(id.clone()))?;

        if current.finalizers.is_empty() {
            objects.remove(id);
            self.commit(ChangeEvent::deleted(current));
        } else if !current.is_terminating() {
            let mut terminating = current;
            terminating.deletion_requested_at = Some(Utc::now());
            terminating.version = self.next_version();
            objects.insert(id.clone(), terminating.clone());
            self.commit(ChangeEvent::updated(terminating));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectCache for InMemoryCluster {
    async fn get(&self, id: &ResourceId) -> Option<ManagedObject> {
        self.objects.read().await.get(id).cloned()
    }

    async fn list(&self, kind: &str) -> Vec<ManagedObject> {
        let mut objects: Vec<ManagedObject> = self
            .objects
            .read()
            .await
            .values()
            .filter(|object| object.id.kind == kind)
            .cloned()
            .collect();
        objects.sort_by(|a, b| a.id.cmp(&b.id));
        objects
    }
}
