//! The user-supplied reconciliation logic.

use async_trait::async_trait;
use steward_core::{Error, ManagedObject, Result};
use steward_workflow::Context;

use crate::control::{DeleteControl, ErrorStatusControl, UpdateControl};

/// Drives one kind of primary object towards its declared state.
///
/// Called at most once at a time per identity. When a workflow is attached,
/// it runs first and its result is available through
/// [`Context::workflow_result`].
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Reconcile an active primary.
    ///
    /// # Errors
    ///
    /// Any error is handed to [`Reconciler::update_error_status`] and then to
    /// the retry governor.
    async fn reconcile(&self, primary: &ManagedObject, ctx: &Context) -> Result<UpdateControl>;

    /// Release external state of a terminating primary. Only called while the
    /// engine's finalizer is present.
    ///
    /// # Errors
    ///
    /// Errors keep the finalizer in place and are retried.
    async fn cleanup(&self, _primary: &ManagedObject, _ctx: &Context) -> Result<DeleteControl> {
        Ok(DeleteControl::Proceed)
    }

    /// Decide what to record after [`Reconciler::reconcile`] failed.
    ///
    /// `ctx.retry_info()` tells whether this was the last attempt.
    async fn update_error_status(
        &self,
        _primary: &ManagedObject,
        _ctx: &Context,
        _error: &Error,
    ) -> ErrorStatusControl {
        ErrorStatusControl::default_handling()
    }
}
