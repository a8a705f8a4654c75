//! Shared fixtures: a scripted dispatcher and polling helpers.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use steward_core::{
    Error, ManagedObject, ReconciliationRequest, ResourceId, TriggerCause, Version,
};
use steward_reconciler::{Dispatch, PostExecutionControl, Scheduler};
use steward_workflow::RetryInfo;
use tokio::sync::Semaphore;
use tokio::time::Instant;

/// What the next dispatch of an identity does.
#[derive(Debug, Clone)]
pub enum Step {
    Succeed,
    Reschedule(Duration),
    Fail(Error),
    FailWithoutRetry(Error, Option<Duration>),
    AddFinalizer,
    RemoveFinalizer,
    /// The object left the cache before the dispatch could read it.
    Skip,
    Panic,
}

#[derive(Debug, Clone)]
pub struct Call {
    pub id: ResourceId,
    pub causes: Vec<TriggerCause>,
    pub retry: Option<RetryInfo>,
    pub at: Instant,
}

/// Dispatcher that follows a per-identity script and records every call.
#[derive(Clone, Default)]
pub struct Scripted {
    calls: Arc<Mutex<Vec<Call>>>,
    steps: Arc<Mutex<HashMap<ResourceId, VecDeque<Step>>>>,
    gate: Option<Arc<Semaphore>>,
    active: Arc<Mutex<HashMap<ResourceId, usize>>>,
    overlapped: Arc<AtomicBool>,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl Scripted {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every dispatch blocks until a permit is added to the returned gate.
    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let scripted = Self {
            gate: Some(Arc::clone(&gate)),
            ..Self::default()
        };
        (scripted, gate)
    }

    pub fn script(&self, id: &ResourceId, steps: impl IntoIterator<Item = Step>) {
        self.steps
            .lock()
            .unwrap()
            .entry(id.clone())
            .or_default()
            .extend(steps);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, id: &ResourceId) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| &call.id == id)
            .collect()
    }

    /// Two dispatches of the same identity ran at once.
    pub fn overlapped(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn enter(&self, id: &ResourceId) {
        let mut active = self.active.lock().unwrap();
        let count = active.entry(id.clone()).or_default();
        *count += 1;
        if *count > 1 {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self, id: &ResourceId) {
        if let Some(count) = self.active.lock().unwrap().get_mut(id) {
            *count -= 1;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Dispatch for Scripted {
    async fn dispatch(
        &self,
        request: ReconciliationRequest,
        retry: Option<RetryInfo>,
    ) -> PostExecutionControl {
        let id = request.id.clone();
        self.calls.lock().unwrap().push(Call {
            id: id.clone(),
            causes: request.causes,
            retry,
            at: Instant::now(),
        });

        self.enter(&id);
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        self.exit(&id);

        let step = self
            .steps
            .lock()
            .unwrap()
            .get_mut(&id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Step::Succeed);
        match step {
            Step::Succeed => PostExecutionControl::succeeded(None, None),
            Step::Reschedule(delay) => PostExecutionControl::succeeded(None, Some(delay)),
            Step::Fail(error) => PostExecutionControl::failed(error),
            Step::FailWithoutRetry(error, reschedule) => PostExecutionControl {
                no_retry: true,
                reschedule,
                ..PostExecutionControl::failed(error)
            },
            Step::AddFinalizer => {
                PostExecutionControl::finalizer_added(ManagedObject::new(id, json!({})))
            }
            Step::RemoveFinalizer => PostExecutionControl::finalizer_removed(None),
            Step::Skip => PostExecutionControl::skipped(),
            Step::Panic => panic!("scripted panic"),
        }
    }
}

pub fn app(name: &str) -> ResourceId {
    ResourceId::namespaced("WebApp", "default", name)
}

pub fn conflict(id: &ResourceId) -> Error {
    Error::conflict(id.clone(), Version::new(1), Version::new(2))
}

pub fn transient() -> Error {
    Error::reconciler("backend unavailable")
}

pub fn start(scheduler: &Scheduler<Scripted>) -> tokio::task::JoinHandle<steward_core::Result<()>> {
    let scheduler = scheduler.clone();
    tokio::spawn(async move { scheduler.run().await })
}

/// Poll `check` until it holds, failing the test after ten virtual seconds.
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached in time");
}

/// Let queued work, timers and retries run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}
