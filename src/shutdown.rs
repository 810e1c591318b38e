// =============================================================================
// Shutdown signal — one watch channel every long-running task listens to
// =============================================================================

use tokio::sync::watch;
use tracing::warn;

/// Broadcast shutdown flag. Components subscribe once at spawn time; the
/// orchestrator triggers it exactly once.
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn trigger(&self) {
        warn!("shutdown signal raised");
        let _ = self.tx.send(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_observe_trigger() {
        let shutdown = Shutdown::new();
        let mut rx = shutdown.subscribe();
        assert!(!*rx.borrow());
        shutdown.trigger();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        assert!(shutdown.is_triggered());
    }
}
