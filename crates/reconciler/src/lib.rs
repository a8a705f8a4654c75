//! Reconciliation runtime for steward.
//!
//! This crate turns a change feed into reconciliations:
//!
//! - **Scheduling**: at most one in-flight dispatch per identity, coalescing
//!   of triggers that arrive meanwhile, and a bounded worker pool.
//! - **Retry governance**: conflicts re-dispatch immediately, other failures
//!   back off exponentially until the budget is spent.
//! - **Outcome interpretation**: finalizer handling, workflow execution and
//!   version-checked writes of what the reconciler returned.
//!
//! # Example
//!
//! ```ignore
//! use steward_reconciler::{Controller, Reconciler, UpdateControl};
//!
//! let controller = Controller::builder(WebAppReconciler, settings)
//!     .cluster(cluster.clone())
//!     .with_workflow(workflow)
//!     .build()?;
//!
//! controller.run(cluster.watch()).await?;
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod control;
pub mod controller;
pub mod dispatcher;
pub mod reconciler;
pub mod retry;
pub mod scheduler;
pub mod shutdown;
mod state;

pub use control::{
    DeleteControl, ErrorStatusControl, PostExecutionControl, UpdateAction, UpdateControl,
};
pub use controller::{Controller, ControllerBuilder, ControllerScheduler};
pub use dispatcher::ReconciliationDispatcher;
pub use reconciler::Reconciler;
pub use retry::{FailureClass, FailureRecord, RetryExecution, RetryPolicy, classify};
pub use scheduler::{Dispatch, Scheduler, SchedulerConfig, SchedulerStats};
pub use shutdown::{Shutdown, ShutdownSignal, install_signal_handlers};
