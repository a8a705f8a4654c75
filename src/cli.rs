//! CLI command definitions using clap.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Steward - per-object reconciliation engine
#[derive(Parser, Debug)]
#[command(name = "steward")]
#[command(version)]
#[command(about = "Reconcile declarative resources one object at a time")]
#[command(
    long_about = "Steward drives declarative objects toward their desired state: one dispatch per object at a time, dependents reconciled as a DAG, conflicts and failures retried with backoff."
)]
pub struct Cli {
    /// Settings file (TOML). STEWARD_* environment variables override it.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the sample WebApp controller against an in-memory cluster
    Demo {
        /// Number of WebApps to create
        #[arg(long, default_value_t = 3)]
        apps: usize,

        /// Initial replicas per WebApp
        #[arg(long, default_value_t = 2)]
        replicas: u64,

        /// Pause between scripted edits, in milliseconds
        #[arg(long, default_value_t = 500)]
        settle_ms: u64,
    },

    /// Print the effective settings as TOML
    Config,
}
