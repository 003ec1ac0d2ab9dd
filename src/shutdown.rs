//! Cooperative cancellation for the batch loops.
//!
//! State is only persisted at batch/item boundaries, so a stop request may
//! drop the unit in flight as well as cut pacing waits short.

use std::time::Duration;
use tokio::sync::watch;
use tracing::warn;

#[derive(Clone)]
pub struct Shutdown {
    tx: std::sync::Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: std::sync::Arc::new(tx),
            rx,
        }
    }

    /// Handle that trips on the first Ctrl+C. A second Ctrl+C exits at once.
    pub fn on_ctrl_c() -> Self {
        let shutdown = Self::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            warn!("⚠️ Process interrupted. Saving progress and exiting gracefully...");
            trigger.trigger();

            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Second interrupt, exiting immediately");
                std::process::exit(130);
            }
        });
        shutdown
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been requested.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|stop| *stop).await.is_err() {
            // sender lives in `self`, so this never resolves spuriously
            std::future::pending::<()>().await;
        }
    }

    /// Sleep for `duration` unless shutdown fires first.
    /// Returns `false` when the wait was cut short.
    pub async fn pause(&self, duration: Duration) -> bool {
        if self.is_triggered() {
            return false;
        }
        if duration.is_zero() {
            return true;
        }

        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.cancelled() => false,
        }
    }
}
