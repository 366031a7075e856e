//! Graceful shutdown plumbing.
//!
//! A single `watch::channel(false)` is the root cancellation signal: the
//! sender flips it to `true` on SIGINT/SIGTERM (or programmatically), and
//! every task selects on `changed()` at its blocking points. Task groups
//! are drained with a bounded grace window; stragglers are abandoned and
//! logged rather than awaited forever.

use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Grace window for draining task groups on shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub type ShutdownRx = watch::Receiver<bool>;
pub type ShutdownTx = watch::Sender<bool>;

/// Create an unsignalled shutdown channel.
pub fn channel() -> (ShutdownTx, ShutdownRx) {
    watch::channel(false)
}

/// Whether shutdown has already been requested.
pub fn is_shutdown(rx: &ShutdownRx) -> bool {
    *rx.borrow()
}

/// Wait until shutdown is signalled.
pub async fn wait(rx: &mut ShutdownRx) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            // Sender dropped: treat as shutdown.
            return;
        }
    }
}

/// Install SIGINT/SIGTERM handlers and return the root shutdown receiver.
pub fn install_signal_handlers() -> Result<ShutdownRx> {
    let (tx, rx) = channel();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    warn!("failed to install SIGTERM handler: {}", e);
                    let _ = ctrl_c.await;
                    let _ = tx.send(true);
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => info!("SIGINT received, shutting down"),
                _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("Ctrl+C received, shutting down");
        }

        let _ = tx.send(true);
    });

    Ok(rx)
}

/// Await a group of named tasks, giving each whatever remains of the
/// grace window. Tasks that do not finish in time are abandoned.
pub async fn join_with_grace(tasks: Vec<(String, JoinHandle<()>)>, grace: Duration) {
    let deadline = tokio::time::Instant::now() + grace;
    for (name, handle) in tasks {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(task = %name, "task panicked during shutdown: {}", e),
            Err(_) => warn!(task = %name, "task did not stop within grace window, abandoning"),
        }
    }
}
