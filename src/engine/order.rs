// =============================================================================
// Orders — status machine and model
// =============================================================================
//
// Status transitions are acyclic:
//
//   PENDING -> ACTIVATED -> FILLED | PARTIAL | REJECTED
//   PENDING -> CANCELED | REJECTED
//   ACTIVATED -> CANCELED
//   PARTIAL -> FILLED | CANCELED
//
// FILLED, CANCELED and REJECTED are terminal. Market orders are created
// directly in FILLED (or REJECTED) and never persist in PENDING.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::{OrderType, Side, TimeInForce};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    Pending,
    Activated,
    Filled,
    Partial,
    Canceled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Canceled | Self::Rejected)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition(self, next: Self) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Pending, Activated)
                | (Pending, Canceled)
                | (Pending, Rejected)
                | (Activated, Filled)
                | (Activated, Partial)
                | (Activated, Canceled)
                | (Activated, Rejected)
                | (Partial, Filled)
                | (Partial, Canceled)
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "PENDING",
            Self::Activated => "ACTIVATED",
            Self::Filled => "FILLED",
            Self::Partial => "PARTIAL",
            Self::Canceled => "CANCELED",
            Self::Rejected => "REJECTED",
        };
        write!(f, "{name}")
    }
}

/// A client order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: u64,
    pub account_id: u64,
    pub symbol: String,
    pub side: Side,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub volume: f64,
    /// Limit price (LIMIT and STOP_LIMIT).
    #[serde(default)]
    pub price: Option<f64>,
    /// Stop trigger (STOP and STOP_LIMIT).
    #[serde(default)]
    pub trigger_price: Option<f64>,
    #[serde(default)]
    pub sl: Option<f64>,
    #[serde(default)]
    pub tp: Option<f64>,
    #[serde(default)]
    pub tif: TimeInForce,
    pub status: OrderStatus,
    pub placed_at: i64,
    #[serde(default)]
    pub fill_price: Option<f64>,
    #[serde(default)]
    pub filled_at: Option<i64>,
    /// Client-supplied reference; doubles as ClOrdID on FIX routes.
    pub client_ref: String,
    #[serde(default)]
    pub lp_order_id: Option<String>,
    #[serde(default)]
    pub reject_reason: Option<String>,
}

impl Order {
    /// STOP_LIMIT orders become plain LIMIT orders once the stop trigger
    /// fires; the remaining activation logic then treats them as LIMIT.
    pub fn effective_type(&self) -> OrderType {
        match (self.order_type, self.status) {
            (OrderType::StopLimit, OrderStatus::Activated) => OrderType::Limit,
            (t, _) => t,
        }
    }
}
