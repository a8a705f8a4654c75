//! Wiring of a change feed into the scheduler for one primary kind.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::{Stream, StreamExt};
use steward_core::{
    ApiClient, ChangeAction, ChangeEvent, EngineSettings, Error, ManagedObject, ObjectCache,
    ResourceId, Result, TriggerCause,
};
use steward_workflow::WorkflowBuilder;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::dispatcher::ReconciliationDispatcher;
use crate::reconciler::Reconciler;
use crate::retry::RetryPolicy;
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::shutdown::{Shutdown, ShutdownSignal};

/// Scheduler type driven by a [`Controller`].
pub type ControllerScheduler<R> = Scheduler<ReconciliationDispatcher<R>>;

/// Routes change events for one kind of primary into a [`Scheduler`].
pub struct Controller<R: Reconciler> {
    settings: EngineSettings,
    scheduler: ControllerScheduler<R>,
    cache: Arc<dyn ObjectCache>,
    /// Last generation seen per primary, for generation-aware filtering.
    generations: Mutex<HashMap<ResourceId, u64>>,
    shutdown: Shutdown,
    /// Set by the first [`Controller::run`]. A controller runs at most once.
    started: AtomicBool,
}

impl<R: Reconciler> Controller<R> {
    pub fn builder(reconciler: R, settings: EngineSettings) -> ControllerBuilder<R> {
        ControllerBuilder {
            reconciler: Arc::new(reconciler),
            settings,
            client: None,
            cache: None,
            workflow: None,
            retry: None,
            shutdown: None,
        }
    }

    pub const fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub const fn scheduler(&self) -> &ControllerScheduler<R> {
        &self.scheduler
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Request a graceful stop of [`Controller::run`].
    pub fn shutdown(&self) {
        self.shutdown.trigger(ShutdownSignal::Programmatic);
    }

    /// Translate one change into scheduler triggers.
    ///
    /// Primaries outside the configured scope are ignored. Changes to objects
    /// owned by a primary trigger that primary.
    pub async fn handle_event(&self, event: ChangeEvent) {
        let object = &event.object;
        if object.id.kind == self.settings.kind {
            self.handle_primary(event).await;
        } else if let Some(owner) = object.owner.as_ref().filter(|o| o.kind == self.settings.kind) {
            self.handle_secondary(owner.clone(), &event).await;
        }
    }

    async fn handle_primary(&self, event: ChangeEvent) {
        let ChangeEvent { action, object } = event;
        if !self.settings.in_scope(&object) {
            debug!(id = %object.id, "Primary out of scope, ignoring");
            return;
        }

        match action {
            ChangeAction::Deleted => {
                self.generations.lock().await.remove(&object.id);
                self.scheduler.submit(object.id, TriggerCause::Deleted).await;
            }
            ChangeAction::Added | ChangeAction::Updated => {
                if action == ChangeAction::Updated && self.is_stale_update(&object).await {
                    debug!(id = %object.id, generation = object.generation, "Generation unchanged, ignoring");
                    return;
                }
                self.generations
                    .lock()
                    .await
                    .insert(object.id.clone(), object.generation);
                self.submit(&object, TriggerCause::from(action)).await;
            }
        }
    }

    async fn handle_secondary(&self, owner: ResourceId, event: &ChangeEvent) {
        let Some(primary) = self.cache.get(&owner).await else {
            debug!(owner = %owner, secondary = %event.id(), "Owner not cached, ignoring");
            return;
        };
        if !self.settings.in_scope(&primary) {
            return;
        }
        debug!(owner = %owner, secondary = %event.id(), action = ?event.action, "Dependent changed");
        self.submit(&primary, TriggerCause::DependentEvent).await;
    }

    async fn is_stale_update(&self, object: &ManagedObject) -> bool {
        self.settings.generation_aware
            && !object.is_terminating()
            && self.generations.lock().await.get(&object.id) == Some(&object.generation)
    }

    async fn submit(&self, object: &ManagedObject, cause: TriggerCause) {
        if object.is_terminating() {
            self.scheduler
                .submit_terminating(object.id.clone(), cause)
                .await;
        } else {
            self.scheduler.submit(object.id.clone(), cause).await;
        }
    }

    /// Consume `feed` until it ends or shutdown is triggered, then wait for
    /// in-flight dispatches.
    ///
    /// Returns right away when shutdown was triggered before the first call.
    ///
    /// # Errors
    ///
    /// Returns `ShuttingDown` if the controller already ran and
    /// `InvalidConfig` if the scheduler is already running.
    pub async fn run<S>(&self, feed: S) -> Result<()>
    where
        S: Stream<Item = ChangeEvent> + Send,
    {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(Error::ShuttingDown);
        }
        if let Some(signal) = self.shutdown.signal() {
            info!(controller = %self.settings.name, %signal, "Controller stopped before starting");
            self.scheduler.stop();
            return Ok(());
        }
        info!(
            controller = %self.settings.name,
            kind = %self.settings.kind,
            workers = self.settings.workers,
            "Controller starting"
        );
        let pump = async {
            let mut feed = std::pin::pin!(feed);
            loop {
                tokio::select! {
                    biased;
                    signal = self.shutdown.wait() => {
                        info!(%signal, "Controller stopping");
                        break;
                    }
                    next = feed.next() => match next {
                        Some(event) => self.handle_event(event).await,
                        None => {
                            warn!("Change feed closed");
                            self.shutdown.trigger(ShutdownSignal::FeedClosed);
                            break;
                        }
                    },
                }
            }
            self.scheduler.stop();
        };

        let (outcome, ()) = tokio::join!(self.scheduler.run(), pump);
        info!(controller = %self.settings.name, stats = ?self.scheduler.stats(), "Controller stopped");
        outcome
    }
}

pub struct ControllerBuilder<R> {
    reconciler: Arc<R>,
    settings: EngineSettings,
    client: Option<Arc<dyn ApiClient>>,
    cache: Option<Arc<dyn ObjectCache>>,
    workflow: Option<WorkflowBuilder>,
    retry: Option<Option<RetryPolicy>>,
    shutdown: Option<Shutdown>,
}

impl<R: Reconciler> ControllerBuilder<R> {
    #[must_use]
    pub fn client(mut self, client: Arc<dyn ApiClient>) -> Self {
        self.client = Some(client);
        self
    }

    #[must_use]
    pub fn cache(mut self, cache: Arc<dyn ObjectCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Use one backend as both client and cache.
    #[must_use]
    pub fn cluster<C>(self, cluster: Arc<C>) -> Self
    where
        C: ApiClient + ObjectCache + 'static,
    {
        let client: Arc<dyn ApiClient> = cluster.clone();
        let cache: Arc<dyn ObjectCache> = cluster;
        self.client(client).cache(cache)
    }

    /// Dependents to reconcile before the reconciler runs. Sibling
    /// concurrency comes from the settings.
    #[must_use]
    pub fn with_workflow(mut self, workflow: WorkflowBuilder) -> Self {
        self.workflow = Some(workflow);
        self
    }

    /// Replace the retry policy derived from the settings.
    #[must_use]
    pub const fn with_retry_policy(mut self, policy: Option<RetryPolicy>) -> Self {
        self.retry = Some(policy);
        self
    }

    #[must_use]
    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// # Errors
    ///
    /// - `InvalidConfig` if the settings are invalid or no client or cache
    ///   was given
    /// - Graph errors from the workflow (`CyclicGraph`, `DuplicateNode`,
    ///   `UnknownDependency`)
    pub fn build(self) -> Result<Controller<R>> {
        self.settings.validate()?;
        let client = self
            .client
            .ok_or_else(|| Error::invalid_config("controller needs an API client"))?;
        let cache = self
            .cache
            .ok_or_else(|| Error::invalid_config("controller needs an object cache"))?;

        let mut dispatcher = ReconciliationDispatcher::new(
            self.reconciler,
            client,
            Arc::clone(&cache),
            &self.settings,
        );
        if let Some(workflow) = self.workflow {
            let workflow = workflow
                .with_max_concurrency(self.settings.workflow.max_concurrency)
                .build()?;
            dispatcher = dispatcher.with_workflow(Arc::new(workflow));
        }

        let mut config = SchedulerConfig::from_settings(&self.settings);
        if let Some(retry) = self.retry {
            config = config.with_retry(retry);
        }

        Ok(Controller {
            scheduler: Scheduler::new(dispatcher, config),
            cache,
            generations: Mutex::new(HashMap::new()),
            started: AtomicBool::new(false),
            shutdown: self.shutdown.unwrap_or_default(),
            settings: self.settings,
        })
    }
}
