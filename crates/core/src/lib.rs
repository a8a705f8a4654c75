//! Steward Core
//!
//! Shared vocabulary for the steward reconciliation engine:
//! - Managed object model with a two-state lifecycle and version tokens
//! - Change feed events and trigger causes
//! - Collaborator traits (`ApiClient`, `ObjectCache`) and an in-memory cluster
//! - Engine settings loaded from TOML
//! - The error taxonomy shared by every crate

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod api;
pub mod config;
pub mod error;
pub mod event;
pub mod memory;
pub mod resource;
pub mod result;

pub use api::{ApiClient, ObjectCache};
pub use config::{EngineSettings, RetrySettings, WorkflowSettings};
pub use error::{DependentFailure, Error};
pub use event::{ChangeAction, ChangeEvent, ReconciliationRequest, TriggerCause};
pub use memory::InMemoryCluster;
pub use resource::{Lifecycle, ManagedObject, ObjectPatch, ResourceId, Version};
pub use result::{Result, ResultExt};
