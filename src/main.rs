//! # Steward - sample controller entry point
//!
//! `steward demo` runs the sample `WebApp` controller against an in-memory
//! cluster and prints a JSON report of the final state.
//! `steward config` prints the effective settings.
//!
//! ## Shutdown
//!
//! SIGTERM/SIGINT stop the demo early; in-flight dispatches finish before
//! the report is printed.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![deny(clippy::expect_used)]

mod cli;

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use steward::sample::{self, DemoOptions};
use steward_reconciler::{Shutdown, install_signal_handlers};

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let settings = sample::load_settings(cli.config.as_deref(), |key| std::env::var(key).ok())
        .context("Failed to load settings")?;

    match cli.command {
        Commands::Demo {
            apps,
            replicas,
            settle_ms,
        } => {
            let start_time = Instant::now();
            let shutdown = Shutdown::new();
            let signals = install_signal_handlers(shutdown.clone());
            let options = DemoOptions {
                apps,
                replicas,
                settle: Duration::from_millis(settle_ms),
            };

            info!(controller = %settings.name, apps, replicas, "Starting demo");
            let report = sample::run_demo(settings, options, shutdown)
                .await
                .context("Demo failed")?;
            signals.abort();
            info!("Demo finished in {:?}", start_time.elapsed());

            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("Failed to render report")?
            );
        }
        Commands::Config => {
            println!(
                "{}",
                toml::to_string_pretty(&settings).context("Failed to render settings")?
            );
        }
    }
    Ok(())
}

/// Initialize tracing subscriber with environment filter.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
