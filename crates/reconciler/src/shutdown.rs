//! Cooperative shutdown.
//!
//! A [`Shutdown`] handle is shared by the controller, the scheduler loop and
//! the OS signal listener. Triggering it stops new dispatches; in-flight
//! dispatches run to completion.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info};

/// What asked the engine to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownSignal {
    Sigterm,
    /// Ctrl+C
    Sigint,
    Programmatic,
    /// The change feed ended.
    FeedClosed,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sigterm => write!(f, "SIGTERM"),
            Self::Sigint => write!(f, "SIGINT"),
            Self::Programmatic => write!(f, "PROGRAMMATIC"),
            Self::FeedClosed => write!(f, "FEED_CLOSED"),
        }
    }
}

/// Clonable shutdown trigger. The first signal wins.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<Option<ShutdownSignal>>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Returns `false` if shutdown was already triggered.
    pub fn trigger(&self, signal: ShutdownSignal) -> bool {
        let first = self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(signal);
            true
        });
        if first {
            info!(signal = %signal, "Initiating graceful shutdown");
        } else {
            info!(signal = %signal, "Shutdown already in progress, ignoring duplicate signal");
        }
        first
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.tx.borrow().is_some()
    }

    #[must_use]
    pub fn signal(&self) -> Option<ShutdownSignal> {
        *self.tx.borrow()
    }

    /// Resolves once shutdown is triggered.
    pub async fn wait(&self) -> ShutdownSignal {
        let mut rx = self.tx.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(signal) => (*signal).unwrap_or(ShutdownSignal::Programmatic),
            // The sender lives in `self`, so this cannot close while we wait.
            Err(_) => ShutdownSignal::Programmatic,
        }
    }
}

/// Trigger `shutdown` on SIGTERM or SIGINT (Ctrl+C elsewhere).
pub fn install_signal_handlers(shutdown: Shutdown) -> tokio::task::JoinHandle<()> {
    info!("Installing OS signal handlers");

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    return;
                }
            };
            let mut sigint = match signal(SignalKind::interrupt()) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "Failed to install SIGINT handler");
                    return;
                }
            };

            tokio::select! {
                _ = sigterm.recv() => {
                    shutdown.trigger(ShutdownSignal::Sigterm);
                }
                _ = sigint.recv() => {
                    shutdown.trigger(ShutdownSignal::Sigint);
                }
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl+C");
                return;
            }
            shutdown.trigger(ShutdownSignal::Sigint);
        }
    })
}
