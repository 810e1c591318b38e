// =============================================================================
// LpAdapter — the capability seam every liquidity provider implements
// =============================================================================
//
// Adapters translate LP-native transports into the unified `Quote` shape and
// push them onto the manager's merge channel. Each variant owns its network
// task and reconnects with exponential backoff on transport loss.
// =============================================================================

use async_trait::async_trait;

use crate::error::CoreResult;

#[async_trait]
pub trait LpAdapter: Send + Sync {
    fn lp_id(&self) -> &str;

    /// Establish the transport. Idempotent when already connected.
    async fn connect(&self) -> CoreResult<()>;

    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Begin producing quotes for `symbols` onto the merge channel.
    async fn start_streaming(&self, symbols: &[String]) -> CoreResult<()>;

    async fn stop_streaming(&self, symbols: &[String]) -> CoreResult<()>;
}

// =============================================================================
// Reconnect backoff
// =============================================================================

/// Exponential backoff: base 1 s, factor 2, cap 60 s, jitter ±20 %.
#[derive(Debug)]
pub struct Backoff {
    current_ms: u64,
    base_ms: u64,
    cap_ms: u64,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            current_ms: 1_000,
            base_ms: 1_000,
            cap_ms: 60_000,
        }
    }

    /// The next delay, advancing the schedule.
    pub fn next_delay(&mut self) -> std::time::Duration {
        let jitter = self.current_ms / 5;
        let delay = self.current_ms - jitter + rand::random::<u64>() % (2 * jitter + 1);
        self.current_ms = (self.current_ms * 2).min(self.cap_ms);
        std::time::Duration::from_millis(delay)
    }

    /// Call after a successful connection to restart the schedule.
    pub fn reset(&mut self) {
        self.current_ms = self.base_ms;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
