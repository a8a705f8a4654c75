//! Shared fixtures: recording dependents backed by in-process state.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use steward_core::{Error, InMemoryCluster, ManagedObject, ResourceId, Result};
use steward_workflow::{BulkDependentResource, BulkMutating, Context, DependentResource, Mutating};

/// Ordered record of adapter calls, shared by every fixture in a test.
#[derive(Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<String>>>,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.entries.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    pub fn with_prefix(&self, prefix: &str) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|entry| entry.starts_with(prefix))
            .collect()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Singleton dependent holding one `u32`.
#[derive(Clone)]
pub struct Tracked {
    pub name: String,
    pub journal: Journal,
    pub stored: Arc<Mutex<Option<u32>>>,
    pub desired: u32,
    pub fail_with: Option<Error>,
    pub delay: Duration,
}

impl Tracked {
    pub fn new(name: &str, journal: &Journal) -> Self {
        Self {
            name: name.to_string(),
            journal: journal.clone(),
            stored: Arc::new(Mutex::new(None)),
            desired: 1,
            fail_with: None,
            delay: Duration::ZERO,
        }
    }

    pub fn failing(mut self, error: Error) -> Self {
        self.fail_with = Some(error);
        self
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn existing(self, value: u32) -> Self {
        *self.stored.lock().unwrap() = Some(value);
        self
    }

    pub fn current(&self) -> Option<u32> {
        *self.stored.lock().unwrap()
    }

    async fn work(&self, verb: &str) -> Result<()> {
        self.journal.enter();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.journal.exit();
        if let Some(error) = &self.fail_with {
            self.journal.push(format!("fail:{}", self.name));
            return Err(error.clone());
        }
        self.journal.push(format!("{verb}:{}", self.name));
        Ok(())
    }
}

#[async_trait]
impl DependentResource for Tracked {
    type Resource = u32;

    async fn secondary(&self, _primary: &ManagedObject, _ctx: &Context) -> Result<Option<u32>> {
        Ok(self.current())
    }
}

#[async_trait]
impl Mutating for Tracked {
    async fn desired(&self, _primary: &ManagedObject, _ctx: &Context) -> Result<u32> {
        Ok(self.desired)
    }

    async fn create(&self, desired: u32, _primary: &ManagedObject, _ctx: &Context) -> Result<u32> {
        self.work("create").await?;
        *self.stored.lock().unwrap() = Some(desired);
        Ok(desired)
    }

    async fn update(
        &self,
        _actual: u32,
        desired: u32,
        _primary: &ManagedObject,
        _ctx: &Context,
    ) -> Result<u32> {
        self.work("update").await?;
        *self.stored.lock().unwrap() = Some(desired);
        Ok(desired)
    }

    async fn delete(&self, _actual: u32, _primary: &ManagedObject, _ctx: &Context) -> Result<()> {
        self.work("delete").await?;
        *self.stored.lock().unwrap() = None;
        Ok(())
    }
}

/// Bulk dependent over a keyed map of `u32`.
#[derive(Clone)]
pub struct Members {
    pub journal: Journal,
    pub stored: Arc<Mutex<BTreeMap<String, u32>>>,
    pub desired: BTreeMap<String, u32>,
    pub failing_key: Option<String>,
}

impl Members {
    pub fn new(journal: &Journal, existing: &[(&str, u32)], desired: &[(&str, u32)]) -> Self {
        let to_map = |entries: &[(&str, u32)]| {
            entries
                .iter()
                .map(|(key, value)| ((*key).to_string(), *value))
                .collect::<BTreeMap<_, _>>()
        };
        Self {
            journal: journal.clone(),
            stored: Arc::new(Mutex::new(to_map(existing))),
            desired: to_map(desired),
            failing_key: None,
        }
    }

    pub fn current(&self) -> BTreeMap<String, u32> {
        self.stored.lock().unwrap().clone()
    }

    fn check(&self, key: &str) -> Result<()> {
        if self.failing_key.as_deref() == Some(key) {
            return Err(Error::adapter("members", format!("member {key} rejected")));
        }
        Ok(())
    }
}

#[async_trait]
impl BulkDependentResource for Members {
    type Resource = u32;

    async fn secondaries(
        &self,
        _primary: &ManagedObject,
        _ctx: &Context,
    ) -> Result<BTreeMap<String, u32>> {
        Ok(self.current())
    }
}

#[async_trait]
impl BulkMutating for Members {
    async fn desired(
        &self,
        _primary: &ManagedObject,
        _ctx: &Context,
    ) -> Result<BTreeMap<String, u32>> {
        Ok(self.desired.clone())
    }

    async fn create(
        &self,
        key: &str,
        desired: u32,
        _primary: &ManagedObject,
        _ctx: &Context,
    ) -> Result<u32> {
        self.check(key)?;
        self.journal.push(format!("create:{key}"));
        self.stored.lock().unwrap().insert(key.to_string(), desired);
        Ok(desired)
    }

    async fn update(
        &self,
        key: &str,
        _actual: u32,
        desired: u32,
        _primary: &ManagedObject,
        _ctx: &Context,
    ) -> Result<u32> {
        self.check(key)?;
        self.journal.push(format!("update:{key}"));
        self.stored.lock().unwrap().insert(key.to_string(), desired);
        Ok(desired)
    }

    async fn delete(
        &self,
        key: &str,
        _actual: u32,
        _primary: &ManagedObject,
        _ctx: &Context,
    ) -> Result<()> {
        self.check(key)?;
        self.journal.push(format!("delete:{key}"));
        self.stored.lock().unwrap().remove(key);
        Ok(())
    }
}

pub fn primary() -> ManagedObject {
    ManagedObject::new(
        ResourceId::namespaced("WebApp", "default", "shop"),
        json!({"replicas": 2}),
    )
}

pub fn context() -> Context {
    let cluster = InMemoryCluster::new_arc();
    Context::new(primary().id, cluster.clone(), cluster)
}
