//! One reconciliation of one primary: finalizer handling, workflow, the
//! user reconciler, and the version-checked writes that follow.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use steward_core::{
    ApiClient, EngineSettings, Error, ManagedObject, ObjectCache, ObjectPatch,
    ReconciliationRequest, Result, ResultExt,
};
use steward_workflow::{Context, RetryInfo, Workflow};
use tracing::{debug, info};

use crate::control::{DeleteControl, PostExecutionControl, UpdateAction, UpdateControl};
use crate::reconciler::Reconciler;
use crate::scheduler::Dispatch;

/// Interprets reconciler outcomes into writes against the cluster.
pub struct ReconciliationDispatcher<R> {
    reconciler: Arc<R>,
    client: Arc<dyn ApiClient>,
    cache: Arc<dyn ObjectCache>,
    finalizer: Option<String>,
    readiness_recheck: Duration,
    workflow: Option<Arc<Workflow>>,
}

impl<R: Reconciler> ReconciliationDispatcher<R> {
    /// Dispatcher without dependents. The finalizer and the readiness
    /// re-check delay come from `settings`.
    pub fn new(
        reconciler: Arc<R>,
        client: Arc<dyn ApiClient>,
        cache: Arc<dyn ObjectCache>,
        settings: &EngineSettings,
    ) -> Self {
        Self {
            reconciler,
            client,
            cache,
            finalizer: settings.finalizer.clone(),
            readiness_recheck: settings.workflow.readiness_recheck_interval(),
            workflow: None,
        }
    }

    #[must_use]
    pub fn with_workflow(mut self, workflow: Arc<Workflow>) -> Self {
        self.workflow = Some(workflow);
        self
    }

    /// The user reconciler every dispatch calls into.
    pub fn reconciler(&self) -> &R {
        &self.reconciler
    }

    /// Dependents reconciled before, and cleaned up before, the reconciler runs.
    pub fn workflow(&self) -> Option<&Workflow> {
        self.workflow.as_deref()
    }

    fn context(&self, request: &ReconciliationRequest, retry: Option<RetryInfo>) -> Context {
        Context::new(
            request.id.clone(),
            Arc::clone(&self.client),
            Arc::clone(&self.cache),
        )
        .with_retry(retry)
        .with_causes(request.causes.clone())
    }

    async fn reconcile_active(&self, primary: ManagedObject, ctx: Context) -> PostExecutionControl {
        if let Some(finalizer) = self.finalizer.as_deref() {
            if !primary.has_finalizer(finalizer) {
                return self.add_finalizer(&primary, finalizer).await;
            }
        }

        let (outcome, ctx, not_ready) = self.run_reconcile(&primary, ctx).await;
        match outcome {
            Ok(control) => {
                let readiness = not_ready.then_some(self.readiness_recheck);
                self.apply_update(&primary, control, readiness).await
            }
            Err(error) if error.is_conflict() => PostExecutionControl::failed(error),
            Err(error) => self.handle_error(&primary, &ctx, error).await,
        }
    }

    /// Workflow first, then the reconciler. Returns the context so the error
    /// handler sees the same workflow result.
    async fn run_reconcile(
        &self,
        primary: &ManagedObject,
        ctx: Context,
    ) -> (Result<UpdateControl>, Context, bool) {
        let mut ctx = ctx;
        let mut not_ready = false;
        if let Some(workflow) = &self.workflow {
            let result = workflow.reconcile(primary, &ctx).await;
            not_ready = result.requires_reschedule();
            match result.into_error() {
                Ok(result) => ctx = ctx.with_workflow_result(result),
                Err(error) => return (Err(error), ctx, not_ready),
            }
        }
        let outcome = self.reconciler.reconcile(primary, &ctx).await;
        (outcome, ctx, not_ready)
    }

    async fn apply_update(
        &self,
        primary: &ManagedObject,
        control: UpdateControl,
        readiness: Option<Duration>,
    ) -> PostExecutionControl {
        let patch = match control.action {
            UpdateAction::NoUpdate => None,
            UpdateAction::PatchStatus(status) => {
                (primary.status.as_ref() != Some(&status)).then(|| ObjectPatch::status(status))
            }
            UpdateAction::PatchResourceAndStatus { spec, status } => {
                let spec_changed = spec != primary.spec;
                let status_changed = status.is_some() && status.as_ref() != primary.status.as_ref();
                (spec_changed || status_changed).then(|| ObjectPatch::spec_and_status(spec, status))
            }
        };

        let updated = match patch {
            Some(patch) => match self.client.patch(&primary.id, primary.version, patch).await {
                Ok(updated) => {
                    debug!(id = %primary.id, version = %updated.version, "Primary patched");
                    Some(updated)
                }
                Err(error) => return PostExecutionControl::failed(error),
            },
            None => None,
        };
        PostExecutionControl::succeeded(updated, control.reschedule.or(readiness))
    }

    async fn handle_error(
        &self,
        primary: &ManagedObject,
        ctx: &Context,
        error: Error,
    ) -> PostExecutionControl {
        let decision = self
            .reconciler
            .update_error_status(primary, ctx, &error)
            .await;

        let mut control = PostExecutionControl::failed(error);
        if let Some(status) = decision.status {
            control.updated = self
                .client
                .patch(&primary.id, primary.version, ObjectPatch::status(status))
                .await
                .ok_logged(&primary.id, "Failed to record error status");
        }
        control.no_retry = !decision.retry;
        control.reschedule = decision.reschedule;
        control
    }

    async fn add_finalizer(&self, primary: &ManagedObject, finalizer: &str) -> PostExecutionControl {
        match self
            .client
            .patch(
                &primary.id,
                primary.version,
                ObjectPatch::add_finalizer(finalizer),
            )
            .await
        {
            Ok(updated) => {
                info!(id = %primary.id, finalizer, "Finalizer added");
                PostExecutionControl::finalizer_added(updated)
            }
            Err(error) => PostExecutionControl::failed(error),
        }
    }

    async fn cleanup_terminating(
        &self,
        primary: ManagedObject,
        ctx: Context,
    ) -> PostExecutionControl {
        if let Some(finalizer) = self.finalizer.as_deref() {
            if !primary.has_finalizer(finalizer) {
                debug!(id = %primary.id, "Terminating without our finalizer, skipping cleanup");
                return PostExecutionControl::skipped();
            }
        }

        let mut ctx = ctx;
        if let Some(workflow) = &self.workflow {
            let result = match workflow.cleanup(&primary, &ctx).await.into_error() {
                Ok(result) => result,
                Err(error) => return PostExecutionControl::failed(error),
            };
            if !result.all_ready() {
                debug!(
                    id = %primary.id,
                    pending = ?result.errored_or_not_ready(),
                    "Dependents not cleaned up yet"
                );
                return PostExecutionControl::succeeded(None, Some(self.readiness_recheck));
            }
            ctx = ctx.with_workflow_result(result);
        }

        match self.reconciler.cleanup(&primary, &ctx).await {
            Ok(DeleteControl::Proceed) => match self.finalizer.as_deref() {
                Some(finalizer) => self.remove_finalizer(&primary, finalizer).await,
                None => PostExecutionControl::succeeded(None, None),
            },
            Ok(DeleteControl::Reschedule(delay)) => PostExecutionControl::succeeded(None, Some(delay)),
            Err(error) => PostExecutionControl::failed(error),
        }
    }

    async fn remove_finalizer(&self, primary: &ManagedObject, finalizer: &str) -> PostExecutionControl {
        match self
            .client
            .patch(
                &primary.id,
                primary.version,
                ObjectPatch::remove_finalizer(finalizer),
            )
            .await
            .ignore_not_found()
        {
            Ok(updated) => {
                info!(id = %primary.id, finalizer, "Finalizer removed");
                PostExecutionControl::finalizer_removed(updated)
            }
            Err(error) => PostExecutionControl::failed(error),
        }
    }
}

#[async_trait]
impl<R: Reconciler> Dispatch for ReconciliationDispatcher<R> {
    async fn dispatch(
        &self,
        request: ReconciliationRequest,
        retry: Option<RetryInfo>,
    ) -> PostExecutionControl {
        let Some(primary) = self.cache.get(&request.id).await else {
            debug!(id = %request.id, "Primary no longer cached, skipping");
            return PostExecutionControl::skipped();
        };
        let ctx = self.context(&request, retry);
        if primary.is_terminating() {
            self.cleanup_terminating(primary, ctx).await
        } else {
            self.reconcile_active(primary, ctx).await
        }
    }
}
