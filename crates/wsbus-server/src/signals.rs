//! Shutdown signalling.
//!
//! SIGTERM and SIGINT trigger a graceful shutdown. The same trigger can be
//! fired programmatically, which is how tests stop a running server.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

/// Shared shutdown trigger. Cloning yields another handle to the same flag.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Triggers a shutdown.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Returns true if shutdown has been triggered.
    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }

    /// Returns a future that completes once shutdown is triggered.
    pub fn wait(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.tx.subscribe();
        async move {
            // An error means every sender is gone, so nothing can trigger anymore.
            let _ = rx.wait_for(|down| *down).await;
        }
    }

    /// Spawns a task that triggers shutdown on SIGTERM or SIGINT.
    pub fn listen_for_signals(&self) {
        let handle = self.clone();
        tokio::spawn(async move {
            match wait_for_signal().await {
                Ok(name) => info!(signal = name, "initiating shutdown"),
                Err(e) => {
                    warn!(error = %e, "failed to install signal handlers");
                    return;
                }
            }
            handle.trigger();
        });
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => Ok("SIGTERM"),
        _ = sigint.recv() => Ok("SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn trigger_sets_flag() {
        let handle = ShutdownHandle::new();
        assert!(!handle.is_shutdown());

        handle.clone().trigger();
        assert!(handle.is_shutdown());
    }

    #[tokio::test]
    async fn wait_completes_after_trigger() {
        let handle = ShutdownHandle::new();
        let wait = tokio::spawn(handle.wait());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!wait.is_finished());

        handle.trigger();
        let result = tokio::time::timeout(Duration::from_millis(100), wait).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn wait_after_trigger_is_immediate() {
        let handle = ShutdownHandle::new();
        handle.trigger();
        let result = tokio::time::timeout(Duration::from_millis(50), handle.wait()).await;
        assert!(result.is_ok());
    }
}
