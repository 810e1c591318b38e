// =============================================================================
// Core error taxonomy
// =============================================================================
//
// Every business outcome of the engine is a typed `Result<T, CoreError>`.
// Collaborators (the REST/WS layer) map these kinds onto transport codes;
// the core itself never panics on a business error.
// =============================================================================

use thiserror::Error;

/// Central error type for the Meridian engine core.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
    /// Malformed field, unknown symbol, bad lot step, date out of range.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A symbol name failed the `[A-Z0-9]{{1,20}}` check before path use.
    #[error("invalid symbol: '{0}'")]
    InvalidSymbol(String),

    /// Missing credentials or a failed credential check.
    #[error("unauthorized")]
    Unauthorized,

    /// Authenticated but not allowed to perform the operation.
    #[error("forbidden")]
    Forbidden,

    /// Unknown account / position / order.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// Duplicate ClOrdID, status-transition violation, frozen position mode.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A business rule refused the operation.
    #[error("{0}")]
    BusinessRule(BusinessRule),

    /// Token bucket exhausted on a history endpoint.
    #[error("rate limited, retry after {retry_after_s}s")]
    RateLimited { retry_after_s: u64 },

    /// LP connect/reject, FIX session down.
    #[error("upstream unavailable: {0}")]
    Upstream(String),

    /// A retryable I/O failure; no partial state was left behind.
    #[error("transient i/o failure: {0}")]
    Retryable(String),

    /// Invariant violation (ledger mismatch, sequence corruption).
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

/// Business-rule rejections surfaced to the client with a readable reason.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BusinessRule {
    #[error("insufficient margin: required {required:.2}, free {free:.2}")]
    InsufficientMargin { required: f64, free: f64 },

    #[error("volume {volume} outside [{min}, {max}] step {step}")]
    VolumeOutOfRange {
        volume: f64,
        min: f64,
        max: f64,
        step: f64,
    },

    #[error("symbol {0} is disabled")]
    SymbolDisabled(String),

    #[error("account {0} is suspended")]
    AccountSuspended(u64),

    #[error("no price available for {0}")]
    NoPrice(String),

    #[error("stop loss {sl} on wrong side of price {price}")]
    InvalidStopLoss { sl: f64, price: f64 },

    #[error("take profit {tp} on wrong side of price {price}")]
    InvalidTakeProfit { tp: f64, price: f64 },

    #[error("ledger invariant violated for account {0}")]
    LedgerInvariantViolated(u64),
}

impl CoreError {
    /// Stable machine-readable code for the `{error, code}` JSON body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::InvalidSymbol(_) => "invalid_symbol",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::NotFound { .. } => "not_found",
            Self::Conflict(_) => "conflict",
            Self::BusinessRule(rule) => match rule {
                BusinessRule::InsufficientMargin { .. } => "insufficient_margin",
                BusinessRule::VolumeOutOfRange { .. } => "volume_out_of_range",
                BusinessRule::SymbolDisabled(_) => "symbol_disabled",
                BusinessRule::AccountSuspended(_) => "account_suspended",
                BusinessRule::NoPrice(_) => "no_price",
                BusinessRule::InvalidStopLoss { .. } => "invalid_stop_loss",
                BusinessRule::InvalidTakeProfit { .. } => "invalid_take_profit",
                BusinessRule::LedgerInvariantViolated(_) => "ledger_invariant",
            },
            Self::RateLimited { .. } => "rate_limited",
            Self::Upstream(_) => "upstream",
            Self::Retryable(_) => "retryable",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<BusinessRule> for CoreError {
    fn from(rule: BusinessRule) -> Self {
        Self::BusinessRule(rule)
    }
}

/// Shorthand used throughout the core.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(CoreError::Unauthorized.code(), "unauthorized");
        assert_eq!(
            CoreError::from(BusinessRule::NoPrice("EURUSD".into())).code(),
            "no_price"
        );
        assert_eq!(
            CoreError::RateLimited { retry_after_s: 10 }.code(),
            "rate_limited"
        );
    }

    #[test]
    fn messages_are_human_readable() {
        let e = CoreError::from(BusinessRule::InsufficientMargin {
            required: 110.02,
            free: 50.0,
        });
        let msg = e.to_string();
        assert!(msg.contains("110.02"));
        assert!(msg.contains("insufficient margin"));
    }
}
