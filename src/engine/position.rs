// =============================================================================
// Positions — lifecycle Open -> Closed, unrealised PnL, trailing config
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Open,
    Closed,
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "OPEN"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Trailing-stop behaviour attached to a position. The scheduler owns the
/// runtime tracking state (best favourable price); this is the config.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum TrailingConfig {
    /// SL follows at a fixed distance from the best favourable price.
    Fixed { distance: f64 },
    /// As Fixed, but the SL only moves once the improvement exceeds
    /// `step_size`.
    Step { distance: f64, step_size: f64 },
    /// Distance is `k * ATR(symbol, window)`, recomputed on each bar close.
    Atr { k: f64, window: usize, timeframe_s: u32 },
}

/// A single tracked position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: u64,
    pub account_id: u64,
    pub symbol: String,
    pub side: Side,
    /// Remaining open volume in lots (reduced on partial close).
    pub volume: f64,
    pub open_price: f64,
    #[serde(default)]
    pub current_price: f64,
    #[serde(default)]
    pub unrealized_pnl: f64,
    #[serde(default)]
    pub sl: Option<f64>,
    #[serde(default)]
    pub tp: Option<f64>,
    #[serde(default)]
    pub trailing: Option<TrailingConfig>,
    /// Accumulated overnight financing.
    #[serde(default)]
    pub swap: f64,
    #[serde(default)]
    pub commission: f64,
    /// Margin reserved when the position opened; released proportionally.
    #[serde(default)]
    pub margin: f64,
    pub opened_at: i64,
    pub status: PositionStatus,
    #[serde(default)]
    pub close_price: Option<f64>,
    #[serde(default)]
    pub closed_at: Option<i64>,
    #[serde(default)]
    pub close_reason: Option<String>,
    #[serde(default)]
    pub realized_pnl: f64,
}

impl Position {
    /// Unrealised PnL against the given book, in account currency.
    ///
    /// BUY marks against the bid, SELL against the ask (the side a close
    /// would fill at). Quote-to-account conversion is 1 for USD-quoted
    /// symbols on USD accounts.
    pub fn unrealized(&self, bid: f64, ask: f64, contract_size: f64) -> f64 {
        match self.side {
            Side::Buy => (bid - self.open_price) * self.volume * contract_size,
            Side::Sell => (self.open_price - ask) * self.volume * contract_size,
        }
    }

    /// The price a close fills at on the given book.
    pub fn close_side_price(&self, bid: f64, ask: f64) -> f64 {
        match self.side {
            Side::Buy => bid,
            Side::Sell => ask,
        }
    }

    /// Whether this tick's book triggers the stop-loss. Exact equality
    /// triggers.
    pub fn sl_hit(&self, bid: f64, ask: f64) -> bool {
        match (self.side, self.sl) {
            (Side::Buy, Some(sl)) => bid <= sl,
            (Side::Sell, Some(sl)) => ask >= sl,
            _ => false,
        }
    }

    /// Whether this tick's book triggers the take-profit. Exact equality
    /// triggers.
    pub fn tp_hit(&self, bid: f64, ask: f64) -> bool {
        match (self.side, self.tp) {
            (Side::Buy, Some(tp)) => bid >= tp,
            (Side::Sell, Some(tp)) => ask <= tp,
            _ => false,
        }
    }
}
