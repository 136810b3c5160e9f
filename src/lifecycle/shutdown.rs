//! Shutdown coordination for the proxy.

use tokio::sync::{broadcast, watch};

/// Coordinator for graceful shutdown.
///
/// Provides a broadcast channel that all long-running tasks can subscribe to.
pub struct Shutdown {
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Trigger the shutdown signal.
    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives the two shutdown phases seen by the data path.
#[derive(Debug)]
pub struct DrainController {
    draining: watch::Sender<bool>,
    cancelled: watch::Sender<bool>,
}

impl DrainController {
    pub fn new() -> Self {
        let (draining, _) = watch::channel(false);
        let (cancelled, _) = watch::channel(false);
        Self {
            draining,
            cancelled,
        }
    }

    pub fn watcher(&self) -> DrainWatch {
        DrainWatch {
            draining: self.draining.subscribe(),
            cancelled: self.cancelled.subscribe(),
        }
    }

    /// Refuse new exchanges; in-flight ones continue.
    pub fn start_draining(&self) {
        self.draining.send_replace(true);
    }

    /// Abort every exchange still in flight.
    pub fn cancel(&self) {
        self.draining.send_replace(true);
        self.cancelled.send_replace(true);
    }

    pub fn is_draining(&self) -> bool {
        *self.draining.borrow()
    }
}

impl Default for DrainController {
    fn default() -> Self {
        Self::new()
    }
}

/// Read side of a [`DrainController`].
#[derive(Debug, Clone)]
pub struct DrainWatch {
    draining: watch::Receiver<bool>,
    cancelled: watch::Receiver<bool>,
}

impl DrainWatch {
    pub fn is_draining(&self) -> bool {
        *self.draining.borrow()
    }

    /// Resolves once draining starts. Never resolves if the controller is gone.
    pub async fn draining(self) {
        wait_until_set(self.draining).await
    }

    /// Resolves once in-flight exchanges must be cancelled.
    pub async fn cancelled(self) {
        wait_until_set(self.cancelled).await
    }
}

async fn wait_until_set(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
