// =============================================================================
// Supervisor — restart panicked background tasks with exponential backoff
// =============================================================================
//
// Business errors are typed results and never panic; a panic in a
// background task is a bug, not a reason to take the process down. The
// supervisor logs it and restarts the task (base 1 s, factor 2, cap 60 s),
// resetting the backoff after a clean run.
// =============================================================================

use std::future::Future;

use tokio::sync::watch;
use tracing::{error, info};

use crate::lp::Backoff;

/// Spawn `factory()` under supervision. The task is restarted only when it
/// panics; normal completion ends supervision.
pub fn spawn_supervised<F, Fut>(name: &'static str, mut shutdown: watch::Receiver<bool>, factory: F)
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut backoff = Backoff::new();
        loop {
            if *shutdown.borrow() {
                break;
            }
            let handle = tokio::spawn(factory());
            match handle.await {
                Ok(()) => {
                    info!(task = name, "supervised task completed");
                    break;
                }
                Err(e) if e.is_panic() => {
                    error!(task = name, "supervised task panicked, restarting");
                    let delay = backoff.next_delay();
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
                Err(_) => break, // cancelled
            }
        }
    });
}
