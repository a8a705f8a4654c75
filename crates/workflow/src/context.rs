//! Per-dispatch context handed to adapters, conditions, and reconcilers.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use steward_core::{ApiClient, ManagedObject, ObjectCache, ResourceId, TriggerCause};

use crate::result::WorkflowResult;

/// Snapshot of the retry state for the identity being reconciled.
///
/// Absent on a first attempt. Read-only: the governor owns the counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryInfo {
    /// Failed attempts so far.
    pub attempt_count: u32,
    /// The next failure will not be retried.
    pub last_attempt: bool,
}

/// Everything a dispatch may look at besides the primary object itself.
#[derive(Clone)]
pub struct Context {
    primary: ResourceId,
    client: Arc<dyn ApiClient>,
    cache: Arc<dyn ObjectCache>,
    retry: Option<RetryInfo>,
    causes: Vec<TriggerCause>,
    workflow_result: Option<Arc<WorkflowResult>>,
}

impl Context {
    pub fn new(primary: ResourceId, client: Arc<dyn ApiClient>, cache: Arc<dyn ObjectCache>) -> Self {
        Self {
            primary,
            client,
            cache,
            retry: None,
            causes: Vec::new(),
            workflow_result: None,
        }
    }

    #[must_use]
    pub const fn with_retry(mut self, retry: Option<RetryInfo>) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_causes(mut self, causes: Vec<TriggerCause>) -> Self {
        self.causes = causes;
        self
    }

    #[must_use]
    pub fn with_workflow_result(mut self, result: WorkflowResult) -> Self {
        self.workflow_result = Some(Arc::new(result));
        self
    }

    pub const fn primary_id(&self) -> &ResourceId {
        &self.primary
    }

    pub fn client(&self) -> &dyn ApiClient {
        self.client.as_ref()
    }

    pub fn cache(&self) -> &dyn ObjectCache {
        self.cache.as_ref()
    }

    pub const fn retry_info(&self) -> Option<RetryInfo> {
        self.retry
    }

    pub fn is_last_attempt(&self) -> bool {
        self.retry.is_some_and(|info| info.last_attempt)
    }

    /// Trigger causes coalesced into this dispatch, in arrival order.
    pub fn causes(&self) -> &[TriggerCause] {
        &self.causes
    }

    /// Result of the workflow that ran before the reconciler, if any.
    pub fn workflow_result(&self) -> Option<&WorkflowResult> {
        self.workflow_result.as_deref()
    }

    /// Cached objects of `kind` owned by the primary.
    pub async fn secondaries(&self, kind: &str) -> Vec<ManagedObject> {
        self.cache.owned_by(&self.primary, kind).await
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("primary", &self.primary)
            .field("retry", &self.retry)
            .field("causes", &self.causes)
            .field("has_workflow_result", &self.workflow_result.is_some())
            .finish_non_exhaustive()
    }
}
