//! Dependent-resource workflows for the steward reconciliation engine.
//!
//! A workflow is a DAG of dependent resources derived from one primary
//! object. This crate provides:
//!
//! - **Capability-tagged adapters**: singleton or bulk, read-only or
//!   mutating, fixed when the node is declared.
//! - **Validated construction**: duplicate names, dangling dependencies, and
//!   cycles are rejected by [`WorkflowBuilder::build`].
//! - **Gated execution**: activation, readiness, and cleanup-readiness
//!   conditions decide how far a pass propagates. A failed reconcile
//!   precondition deletes the node and everything below it.
//! - **Bulk diffing**: keyed members are created, updated, or deleted
//!   individually.
//!
//! # Example
//!
//! ```ignore
//! use steward_workflow::{Dependent, WorkflowBuilder};
//!
//! let workflow = WorkflowBuilder::new("webapp")
//!     .add(Dependent::mutating("config", ConfigMapDependent)
//!         .ready_when(|_, observed, _| Ok(observed.is_present())))
//!     .add(Dependent::bulk("pods", PodSet).depends_on("config"))
//!     .build()?;
//!
//! let result = workflow.reconcile(&primary, &ctx).await;
//! if result.requires_reschedule() {
//!     // come back later
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod bulk;
pub mod condition;
pub mod context;
pub mod dependent;
mod executor;
pub mod graph;
pub mod node;
pub mod owned;
pub mod result;

pub use bulk::{BulkPlan, plan as plan_bulk};
pub use condition::{Absent, Condition, ConditionKind, Exists};
pub use context::{Context, RetryInfo};
pub use dependent::{
    Access, BulkDependentResource, BulkMutating, Capability, Cardinality, DependentResource,
    Mutating, Observed, Operations,
};
pub use graph::{DEFAULT_MAX_CONCURRENCY, Workflow, WorkflowBuilder};
pub use node::Dependent;
pub use owned::{OwnedObject, OwnedObjects};
pub use result::{NodeOutcome, WorkflowMode, WorkflowResult};
