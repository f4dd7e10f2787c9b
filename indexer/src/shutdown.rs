//! Graceful Shutdown Handler
//!
//! Handles Ctrl+C for clean shutdown: the poll loop stops between runs, the
//! gateway stops serving, and the database is closed by the caller.

use std::sync::Arc;

use tokio::signal;
use tokio::sync::watch;

/// Shared shutdown signal
#[derive(Clone)]
pub struct ShutdownSignal {
    shutdown: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            shutdown: Arc::new(tx),
        }
    }

    /// Check if shutdown has been requested
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Request shutdown
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Resolves once shutdown has been requested.
    pub async fn wait(&self) {
        let mut rx = self.shutdown.subscribe();
        let _ = rx.wait_for(|requested| *requested).await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for shutdown signal (Ctrl+C)
pub async fn wait_for_shutdown() {
    match signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received shutdown signal, cleaning up...");
        }
        Err(e) => {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        }
    }
}

/// Run shutdown handler in background
/// Returns a ShutdownSignal that will be triggered on Ctrl+C
pub fn spawn_shutdown_handler() -> ShutdownSignal {
    let signal = ShutdownSignal::new();
    let signal_clone = signal.clone();

    tokio::spawn(async move {
        wait_for_shutdown().await;
        signal_clone.shutdown();
    });

    signal
}
