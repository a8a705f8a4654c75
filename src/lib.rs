//! # Steward
//!
//! Per-object reconciliation engine with dependent-resource workflows.
//!
//! This library re-exports the workspace crates and ships a sample `WebApp`
//! controller used by the `steward` binary.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub use steward_core;
pub use steward_reconciler;
pub use steward_workflow;

pub mod sample;
