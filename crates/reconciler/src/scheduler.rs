//! Per-object scheduling.
//!
//! The scheduler guarantees at most one in-flight dispatch per identity.
//! Triggers that arrive while a dispatch runs are coalesced into a single
//! follow-up dispatch. Dispatches run on a bounded pool of workers, and
//! failures are routed through the retry governor.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use steward_core::{EngineSettings, Error, ReconciliationRequest, ResourceId, Result, TriggerCause};
use steward_workflow::RetryInfo;
use tokio::sync::{Mutex, Semaphore, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::control::PostExecutionControl;
use crate::retry::{FailureClass, FailureRecord, RetryPolicy, classify};
use crate::state::{Eventing, ResourceState, Timer};

/// Runs one reconciliation for one identity.
#[async_trait]
pub trait Dispatch: Send + Sync + 'static {
    async fn dispatch(
        &self,
        request: ReconciliationRequest,
        retry: Option<RetryInfo>,
    ) -> PostExecutionControl;
}

/// Scheduler tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub workers: usize,
    /// `None` disables retries. Failures are still recorded.
    pub retry: Option<RetryPolicy>,
    /// Re-run every identity at least this often after a success.
    pub max_reconciliation_interval: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            retry: Some(RetryPolicy::default()),
            max_reconciliation_interval: None,
        }
    }
}

impl SchedulerConfig {
    #[must_use]
    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self {
            workers: settings.workers.max(1),
            retry: RetryPolicy::from_settings(&settings.retry),
            max_reconciliation_interval: settings.max_reconciliation_interval(),
        }
    }

    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    #[must_use]
    pub const fn with_retry(mut self, retry: Option<RetryPolicy>) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub const fn with_max_reconciliation_interval(mut self, interval: Option<Duration>) -> Self {
        self.max_reconciliation_interval = interval;
        self
    }
}

/// Counters since the scheduler was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// Dispatches started.
    pub dispatched: u64,
    /// Dispatches that finished without error. Skipped dispatches are not counted.
    pub succeeded: u64,
    /// Dispatches that finished with an error, including conflicts and panics.
    pub failed: u64,
    /// Failures classified as optimistic-concurrency conflicts.
    pub conflicts: u64,
    /// Retry timers armed after a transient failure.
    pub retries_scheduled: u64,
    /// Transient failures that found the retry budget spent.
    pub retries_exhausted: u64,
    /// Dispatches that panicked.
    pub panicked: u64,
    /// Dispatches that only added the finalizer.
    pub finalizers_added: u64,
    /// Cleanups that ended by removing the finalizer.
    pub finalizers_removed: u64,
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    conflicts: AtomicU64,
    retries_scheduled: AtomicU64,
    retries_exhausted: AtomicU64,
    panicked: AtomicU64,
    finalizers_added: AtomicU64,
    finalizers_removed: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SchedulerStats {
        SchedulerStats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            retries_exhausted: self.retries_exhausted.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
            finalizers_added: self.finalizers_added.load(Ordering::Relaxed),
            finalizers_removed: self.finalizers_removed.load(Ordering::Relaxed),
        }
    }
}

struct Shared<D> {
    dispatcher: D,
    config: SchedulerConfig,
    states: Mutex<HashMap<ResourceId, ResourceState>>,
    ready_tx: mpsc::UnboundedSender<ResourceId>,
    ready_rx: Mutex<Option<mpsc::UnboundedReceiver<ResourceId>>>,
    workers: Arc<Semaphore>,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
    timer_seq: AtomicU64,
    counters: Counters,
}

/// Cheap to clone. All clones drive the same scheduler.
pub struct Scheduler<D> {
    shared: Arc<Shared<D>>,
}

impl<D> Clone for Scheduler<D> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<D: Dispatch> Scheduler<D> {
    pub fn new(dispatcher: D, config: SchedulerConfig) -> Self {
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let workers = Arc::new(Semaphore::new(config.workers.max(1)));
        Self {
            shared: Arc::new(Shared {
                dispatcher,
                config,
                states: Mutex::new(HashMap::new()),
                ready_tx,
                ready_rx: Mutex::new(Some(ready_rx)),
                workers,
                running: AtomicBool::new(false),
                shutdown,
                timer_seq: AtomicU64::new(0),
                counters: Counters::default(),
            }),
        }
    }

    pub fn dispatcher(&self) -> &D {
        &self.shared.dispatcher
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// Record a trigger for `id`. Dispatches immediately when the identity is
    /// idle and a worker is free, otherwise coalesces into the next dispatch.
    ///
    /// A [`TriggerCause::Deleted`] cancels timers and drops all state for the
    /// identity once nothing is in flight.
    pub async fn submit(&self, id: ResourceId, cause: TriggerCause) {
        self.shared.trigger(id, cause, false).await;
    }

    /// Like [`Scheduler::submit`] for an object that is being deleted.
    pub async fn submit_terminating(&self, id: ResourceId, cause: TriggerCause) {
        self.shared.trigger(id, cause, true).await;
    }

    /// Arm the re-schedule timer for `id`. A later call replaces an earlier
    /// one.
    pub async fn reschedule(&self, id: &ResourceId, delay: Duration) {
        let mut states = self.shared.states.lock().await;
        let state = states.entry(id.clone()).or_insert_with(ResourceState::new);
        if state.is_delete_present() {
            return;
        }
        self.shared
            .arm_timer(id, state, delay, TriggerCause::Rescheduled);
    }

    /// Process the ready queue until [`Scheduler::stop`] is called.
    ///
    /// Triggers recorded before the call are dispatched right away. In-flight
    /// dispatches are awaited before this returns.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the scheduler is already running.
    pub async fn run(&self) -> Result<()> {
        let Some(mut ready) = self.shared.ready_rx.lock().await.take() else {
            return Err(Error::invalid_config("scheduler is already running"));
        };
        self.shared.shutdown.send_replace(false);
        self.shared.running.store(true, Ordering::Release);
        self.shared.enqueue_pending().await;
        info!(workers = self.shared.config.workers, "Scheduler started");

        let mut stop = self.shared.shutdown.subscribe();
        let mut tasks = JoinSet::new();
        loop {
            while let Some(joined) = tasks.try_join_next() {
                log_join(joined);
            }

            let permit = tokio::select! {
                biased;
                _ = stop.wait_for(|stopped| *stopped) => break,
                permit = Arc::clone(&self.shared.workers).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let id = tokio::select! {
                biased;
                _ = stop.wait_for(|stopped| *stopped) => break,
                next = ready.recv() => match next {
                    Some(id) => id,
                    None => break,
                },
            };

            let Some((request, retry)) = self.shared.begin(&id).await else {
                continue;
            };
            let shared = Arc::clone(&self.shared);
            tasks.spawn(async move {
                let control = shared.dispatch_guarded(request.clone(), retry).await;
                shared.finished(&request.id, control).await;
                drop(permit);
            });
        }

        info!(in_flight = tasks.len(), "Scheduler stopping, draining in-flight dispatches");
        while let Some(joined) = tasks.join_next().await {
            log_join(joined);
        }
        let cancelled = self.shared.cancel_timers().await;
        debug!(cancelled, "Pending timers cancelled");
        *self.shared.ready_rx.lock().await = Some(ready);
        info!("Scheduler stopped");
        Ok(())
    }

    /// Stop accepting new dispatches. Once in-flight dispatches drain,
    /// pending re-schedule and retry timers are cancelled. Triggers recorded
    /// while stopped are dispatched on the next [`Scheduler::run`].
    pub fn stop(&self) {
        if self.shared.running.swap(false, Ordering::AcqRel) {
            info!("Scheduler stop requested");
        }
        self.shared.shutdown.send_replace(true);
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub async fn is_under_processing(&self, id: &ResourceId) -> bool {
        self.shared
            .states
            .lock()
            .await
            .get(id)
            .is_some_and(|state| state.under_processing)
    }

    /// Retry progress of `id`. `None` when the last dispatch succeeded or no
    /// failure has happened yet.
    pub async fn retry_info(&self, id: &ResourceId) -> Option<RetryInfo> {
        self.shared
            .states
            .lock()
            .await
            .get(id)
            .and_then(|state| state.retry.as_ref().map(|retry| retry.info()))
    }

    /// Most recent failure of `id`, kept until the next success.
    pub async fn failure(&self, id: &ResourceId) -> Option<FailureRecord> {
        self.shared
            .states
            .lock()
            .await
            .get(id)
            .and_then(|state| state.last_failure.clone())
    }

    /// Whether a re-schedule or backoff timer is armed for `id`.
    pub async fn has_timer(&self, id: &ResourceId) -> bool {
        self.shared
            .states
            .lock()
            .await
            .get(id)
            .is_some_and(|state| state.timer.is_some())
    }

    /// Number of identities with scheduler state.
    pub async fn tracked_count(&self) -> usize {
        self.shared.states.lock().await.len()
    }

    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        self.shared.counters.snapshot()
    }
}

impl<D: Dispatch> Shared<D> {
    async fn trigger(self: &Arc<Self>, id: ResourceId, cause: TriggerCause, terminating: bool) {
        let mut states = self.states.lock().await;

        if cause == TriggerCause::Deleted {
            let Some(state) = states.get_mut(&id) else {
                return;
            };
            state.cancel_timer();
            if state.under_processing {
                debug!(id = %id, "Delete arrived during dispatch, dropping state afterwards");
                state.eventing = Eventing::DeletePresent;
            } else {
                debug!(id = %id, "Delete arrived, dropping state");
                states.remove(&id);
            }
            return;
        }

        let state = states.entry(id.clone()).or_insert_with(ResourceState::new);
        if state.eventing == Eventing::ProcessedMarkForDeletion {
            if terminating {
                debug!(id = %id, cause = %cause, "Ignoring event for object already cleaned up");
                return;
            }
            state.eventing = Eventing::NoEvent;
        }
        if !state.mark_event(cause) {
            return;
        }
        debug!(id = %id, cause = %cause, in_flight = state.under_processing, "Trigger recorded");
        if state.is_dispatchable() {
            state.cancel_timer();
            self.enqueue(&id, state);
        }
    }

    fn enqueue(&self, id: &ResourceId, state: &mut ResourceState) {
        if !self.running.load(Ordering::Acquire) || state.queued || state.under_processing {
            return;
        }
        if self.ready_tx.send(id.clone()).is_ok() {
            state.queued = true;
        }
    }

    async fn enqueue_pending(&self) {
        let mut states = self.states.lock().await;
        for (id, state) in states.iter_mut() {
            if state.is_dispatchable() {
                self.enqueue(id, state);
            }
        }
    }

    async fn begin(&self, id: &ResourceId) -> Option<(ReconciliationRequest, Option<RetryInfo>)> {
        let mut states = self.states.lock().await;
        let state = states.get_mut(id)?;
        if !state.queued || state.under_processing {
            return None;
        }
        let causes = state.begin();
        let retry = state.retry.as_ref().map(|retry| retry.info());
        Counters::bump(&self.counters.dispatched);
        debug!(id = %id, ?causes, ?retry, "Dispatching");
        Some((ReconciliationRequest::new(id.clone(), causes), retry))
    }

    async fn dispatch_guarded(
        &self,
        request: ReconciliationRequest,
        retry: Option<RetryInfo>,
    ) -> PostExecutionControl {
        let id = request.id.clone();
        match AssertUnwindSafe(self.dispatcher.dispatch(request, retry))
            .catch_unwind()
            .await
        {
            Ok(control) => control,
            Err(_) => {
                Counters::bump(&self.counters.panicked);
                error!(id = %id, "Dispatch panicked");
                PostExecutionControl::failed(Error::DispatchPanicked { id })
            }
        }
    }

    async fn finished(self: &Arc<Self>, id: &ResourceId, control: PostExecutionControl) {
        let mut states = self.states.lock().await;
        let Some(state) = states.get_mut(id) else {
            return;
        };
        state.under_processing = false;
        if let Some(updated) = &control.updated {
            debug!(id = %id, version = %updated.version, "Dispatch wrote object");
        }

        let remove = match control.error {
            Some(ref error) => self.on_failure(id, state, error, &control),
            None => self.on_success(id, state, &control),
        };
        if remove {
            states.remove(id);
        }
    }

    /// Returns `true` when the state should be dropped.
    fn on_failure(
        self: &Arc<Self>,
        id: &ResourceId,
        state: &mut ResourceState,
        error: &Error,
        control: &PostExecutionControl,
    ) -> bool {
        Counters::bump(&self.counters.failed);
        if state.is_delete_present() {
            debug!(id = %id, error = %error, "Dispatch failed for deleted object, dropping state");
            return true;
        }

        let class = if control.no_retry {
            FailureClass::Terminal
        } else {
            classify(error)
        };
        match class {
            FailureClass::Conflict => {
                Counters::bump(&self.counters.conflicts);
                info!(id = %id, error = %error, "Conflict, re-dispatching");
                state.mark_event(TriggerCause::Retry);
                self.enqueue(id, state);
            }
            FailureClass::Terminal => {
                let attempts = state.retry.as_ref().map_or(0, |retry| retry.attempt_count());
                warn!(id = %id, error = %error, "Terminal failure, not retrying");
                state.last_failure = Some(FailureRecord::new(error, class, attempts, true));
                if state.is_event_present() {
                    self.enqueue(id, state);
                } else if let Some(delay) = control.reschedule {
                    self.arm_timer(id, state, delay, TriggerCause::Rescheduled);
                }
            }
            FailureClass::Transient => {
                let Some(policy) = self.config.retry else {
                    warn!(id = %id, error = %error, "Dispatch failed, retries disabled");
                    state.last_failure = Some(FailureRecord::new(error, class, 0, true));
                    if state.is_event_present() {
                        self.enqueue(id, state);
                    }
                    return false;
                };
                let execution = state.retry.get_or_insert_with(|| policy.start());
                if state.eventing == Eventing::EventPresent {
                    let attempts = execution.attempt_count();
                    info!(id = %id, error = %error, "Dispatch failed, new event present, re-dispatching");
                    state.last_failure = Some(FailureRecord::new(error, class, attempts, false));
                    self.enqueue(id, state);
                    return false;
                }
                match execution.next_delay() {
                    Some(delay) => {
                        let attempts = execution.attempt_count();
                        Counters::bump(&self.counters.retries_scheduled);
                        warn!(
                            id = %id,
                            error = %error,
                            attempt = attempts,
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            "Dispatch failed, retry scheduled"
                        );
                        state.last_failure = Some(FailureRecord::new(error, class, attempts, false));
                        self.arm_timer(id, state, delay, TriggerCause::Retry);
                    }
                    None => {
                        let attempts = execution.attempt_count();
                        Counters::bump(&self.counters.retries_exhausted);
                        error!(id = %id, error = %error, attempts, "Retries exhausted");
                        state.last_failure = Some(FailureRecord::new(error, class, attempts, true));
                        if let Some(interval) = self.config.max_reconciliation_interval {
                            self.arm_timer(id, state, interval, TriggerCause::Rescheduled);
                        }
                    }
                }
            }
        }
        false
    }

    /// Returns `true` when the state should be dropped.
    fn on_success(
        self: &Arc<Self>,
        id: &ResourceId,
        state: &mut ResourceState,
        control: &PostExecutionControl,
    ) -> bool {
        if !control.skipped {
            Counters::bump(&self.counters.succeeded);
        }
        if control.finalizer_added {
            Counters::bump(&self.counters.finalizers_added);
        }
        state.retry = None;
        state.last_failure = None;
        state.cancel_timer();

        if state.is_delete_present() {
            debug!(id = %id, "Object deleted, dropping state");
            return true;
        }
        if control.finalizer_removed {
            Counters::bump(&self.counters.finalizers_removed);
            debug!(id = %id, "Finalizer removed, waiting for delete");
            state.eventing = Eventing::ProcessedMarkForDeletion;
            state.causes.clear();
            return false;
        }
        if state.is_event_present() {
            self.enqueue(id, state);
            return false;
        }
        if control.skipped {
            debug!(id = %id, "Object no longer cached, dropping state");
            return true;
        }
        if let Some(delay) = control.reschedule {
            if delay.is_zero() {
                state.mark_event(TriggerCause::Rescheduled);
                self.enqueue(id, state);
            } else {
                self.arm_timer(id, state, delay, TriggerCause::Rescheduled);
            }
        } else if let Some(interval) = self.config.max_reconciliation_interval {
            self.arm_timer(id, state, interval, TriggerCause::Rescheduled);
        }
        false
    }

    fn arm_timer(
        self: &Arc<Self>,
        id: &ResourceId,
        state: &mut ResourceState,
        delay: Duration,
        cause: TriggerCause,
    ) {
        state.cancel_timer();
        let token = self.timer_seq.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(self);
        let timer_id = id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = weak.upgrade() {
                shared.timer_fired(timer_id, token, cause).await;
            }
        });
        debug!(id = %id, delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), %cause, "Timer armed");
        state.timer = Some(Timer { token, handle });
    }

    /// Abort every armed timer. Returns how many were cancelled.
    async fn cancel_timers(&self) -> usize {
        let mut states = self.states.lock().await;
        let mut cancelled = 0;
        for state in states.values_mut().filter(|state| state.timer.is_some()) {
            state.cancel_timer();
            cancelled += 1;
        }
        cancelled
    }

    async fn timer_fired(self: &Arc<Self>, id: ResourceId, token: u64, cause: TriggerCause) {
        let mut states = self.states.lock().await;
        let Some(state) = states.get_mut(&id) else {
            return;
        };
        if state.timer.as_ref().is_none_or(|timer| timer.token != token) {
            return;
        }
        // Dropping the handle of the running task detaches it.
        state.timer = None;
        if state.mark_event(cause) {
            debug!(id = %id, %cause, "Timer fired");
            self.enqueue(&id, state);
        }
    }
}

fn log_join(joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(error = %e, "Dispatch task panicked outside the dispatcher");
        }
    }
}
