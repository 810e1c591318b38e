// =============================================================================
// Market data model — ticks, quotes, symbol specifications
// =============================================================================

pub mod ohlc;
pub mod tick_store;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Validate a symbol name against `[A-Z0-9]{1,20}` before it is used as a
/// map key or, critically, a path component.
pub fn validate_symbol(symbol: &str) -> CoreResult<()> {
    let ok = !symbol.is_empty()
        && symbol.len() <= 20
        && symbol.bytes().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit());
    if ok {
        Ok(())
    } else {
        Err(CoreError::InvalidSymbol(symbol.to_string()))
    }
}

// =============================================================================
// Tick
// =============================================================================

/// A canonical bid/ask quote accepted into the engine's tick stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    /// Milliseconds since the UNIX epoch.
    #[serde(rename = "ts")]
    pub timestamp_ms: i64,
    /// Identifier of the liquidity provider that produced the quote.
    #[serde(rename = "lp")]
    pub lp_id: String,
}

impl Tick {
    /// Derived, never stored.
    pub fn spread(&self) -> f64 {
        self.ask - self.bid
    }

    /// Mid price, the input to OHLC aggregation.
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    /// A tick is valid when both sides are finite and the book is not
    /// crossed. Zero spread (`ask == bid`) is accepted.
    pub fn is_valid(&self) -> bool {
        self.bid.is_finite() && self.ask.is_finite() && self.ask >= self.bid
    }
}

// =============================================================================
// Quote
// =============================================================================

/// An LP-scoped pre-aggregation quote. The LP manager's selection policy
/// converts the surviving quotes into [`Tick`]s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub lp_id: String,
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub timestamp_ms: i64,
}

impl Quote {
    pub fn into_tick(self) -> Tick {
        Tick {
            symbol: self.symbol,
            bid: self.bid,
            ask: self.ask,
            timestamp_ms: self.timestamp_ms,
            lp_id: self.lp_id,
        }
    }
}

// =============================================================================
// SymbolSpec
// =============================================================================

/// Contract specification for a tradable instrument. Immutable once
/// registered; re-registration with a different spec is rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolSpec {
    pub symbol: String,
    /// Base-currency units per 1.0 lot.
    pub contract_size: f64,
    /// Price decimal places.
    pub digits: u32,
    pub min_volume: f64,
    pub max_volume: f64,
    pub volume_step: f64,
    /// Effective margin fraction of contract value (0.01 = 100:1).
    pub margin_rate: f64,
    /// Overnight financing per lot, long / short.
    #[serde(default)]
    pub swap_long: f64,
    #[serde(default)]
    pub swap_short: f64,
    /// Commission charged per lot on open, in account currency.
    #[serde(default)]
    pub commission_per_lot: f64,
    pub base_currency: String,
    pub quote_currency: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl SymbolSpec {
    /// Check a requested volume against min/max/step. Step conformance uses
    /// a small epsilon to absorb f64 representation error.
    pub fn validate_volume(&self, volume: f64) -> CoreResult<()> {
        let out_of_range = volume < self.min_volume - 1e-9 || volume > self.max_volume + 1e-9;
        let steps = (volume / self.volume_step).round();
        let off_step = (steps * self.volume_step - volume).abs() > 1e-9;
        if out_of_range || off_step {
            return Err(crate::error::BusinessRule::VolumeOutOfRange {
                volume,
                min: self.min_volume,
                max: self.max_volume,
                step: self.volume_step,
            }
            .into());
        }
        Ok(())
    }
}
