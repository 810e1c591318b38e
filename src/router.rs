// =============================================================================
// Router — A-Book / B-Book routing decision
// =============================================================================
//
// A pure decision over (order, account, rules). Rules match on symbol,
// account group and volume bounds; the first match by ascending priority
// wins, falling back to the runtime-mutable default execution mode
// (INTERNAL unless an operator changes it). Rule updates install an atomic
// snapshot; in-flight orders keep the snapshot they were decided with.
// =============================================================================

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::ExecutionMode;

/// One routing rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    pub priority: i32,
    #[serde(default)]
    pub symbols: Option<Vec<String>>,
    #[serde(default)]
    pub account_group: Option<String>,
    #[serde(default)]
    pub min_volume: Option<f64>,
    #[serde(default)]
    pub max_volume: Option<f64>,
    pub action: ExecutionMode,
}

impl RoutingRule {
    fn matches(&self, symbol: &str, group: &str, volume: f64) -> bool {
        if let Some(symbols) = &self.symbols {
            if !symbols.iter().any(|s| s == symbol) {
                return false;
            }
        }
        if let Some(rule_group) = &self.account_group {
            if rule_group != group {
                return false;
            }
        }
        if let Some(min) = self.min_volume {
            if volume < min {
                return false;
            }
        }
        if let Some(max) = self.max_volume {
            if volume > max {
                return false;
            }
        }
        true
    }
}

pub struct Router {
    rules: RwLock<Arc<Vec<RoutingRule>>>,
    default_mode: RwLock<ExecutionMode>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(Arc::new(Vec::new())),
            default_mode: RwLock::new(ExecutionMode::Internal),
        }
    }

    /// Install a new rule set as one atomic snapshot, sorted by ascending
    /// priority.
    pub fn set_rules(&self, mut rules: Vec<RoutingRule>) {
        rules.sort_by_key(|r| r.priority);
        info!(count = rules.len(), "routing rules installed");
        *self.rules.write() = Arc::new(rules);
    }

    /// The snapshot an order should be decided with, captured at
    /// submission time.
    pub fn snapshot(&self) -> Arc<Vec<RoutingRule>> {
        self.rules.read().clone()
    }

    pub fn default_mode(&self) -> ExecutionMode {
        self.default_mode.read().clone()
    }

    pub fn set_default_mode(&self, mode: ExecutionMode) {
        info!(mode = %mode, "default execution mode changed");
        *self.default_mode.write() = mode;
    }

    /// Decide a venue for `(symbol, account group, volume)` against the
    /// given snapshot.
    pub fn decide_with(
        &self,
        snapshot: &[RoutingRule],
        symbol: &str,
        group: &str,
        volume: f64,
    ) -> ExecutionMode {
        for rule in snapshot {
            if rule.matches(symbol, group, volume) {
                return rule.action.clone();
            }
        }
        self.default_mode()
    }

    /// Decide with a freshly captured snapshot.
    pub fn decide(&self, symbol: &str, group: &str, volume: f64) -> ExecutionMode {
        let snapshot = self.snapshot();
        self.decide_with(&snapshot, symbol, group, volume)
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}
