// =============================================================================
// Accounts — status, margin bookkeeping, derived snapshot
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::PositionMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccountStatus {
    Active,
    Suspended,
    Closed,
}

impl std::fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::Suspended => write!(f, "SUSPENDED"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

/// A trading account. Balance is authoritative from the ledger; only margin
/// bookkeeping lives here. Accounts are never destroyed, only CLOSED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: u64,
    pub owner: String,
    pub leverage: u32,
    pub margin_used: f64,
    pub status: AccountStatus,
    pub is_demo: bool,
    /// Netting or hedging; frozen once the first position has opened.
    pub mode: PositionMode,
    #[serde(default)]
    pub mode_frozen: bool,
    /// Routing group, matched by routing rules.
    #[serde(default)]
    pub group: String,
    /// Opaque credential blob (hex SHA-256). Never serialized outward.
    #[serde(skip_serializing)]
    pub credential_hash: String,
    pub created_at: i64,
}

/// Derived view of an account at a consistent snapshot:
/// `equity = balance + unrealized`, `free_margin = equity - margin_used`,
/// `margin_level = equity / margin_used` (absent when no margin is used).
#[derive(Debug, Clone, Serialize)]
pub struct AccountSnapshot {
    pub id: u64,
    pub owner: String,
    pub balance: f64,
    pub equity: f64,
    pub margin_used: f64,
    pub free_margin: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub margin_level: Option<f64>,
    pub leverage: u32,
    pub status: AccountStatus,
    pub is_demo: bool,
    pub mode: PositionMode,
}

impl AccountSnapshot {
    pub fn derive(account: &Account, balance: f64, unrealized: f64) -> Self {
        let equity = balance + unrealized;
        let margin_level = if account.margin_used > 0.0 {
            Some(equity / account.margin_used)
        } else {
            None
        };
        Self {
            id: account.id,
            owner: account.owner.clone(),
            balance,
            equity,
            margin_used: account.margin_used,
            free_margin: equity - account.margin_used,
            margin_level,
            leverage: account.leverage,
            status: account.status,
            is_demo: account.is_demo,
            mode: account.mode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> Account {
        Account {
            id: 1,
            owner: "trader".into(),
            leverage: 100,
            margin_used: 0.0,
            status: AccountStatus::Active,
            is_demo: false,
            mode: PositionMode::Hedging,
            mode_frozen: false,
            group: String::new(),
            credential_hash: "ab".repeat(32),
            created_at: 0,
        }
    }

    #[test]
    fn snapshot_derivation() {
        let mut acc = account();
        acc.margin_used = 110.02;
        let snap = AccountSnapshot::derive(&acc, 10_000.0, 8.0);
        assert_eq!(snap.equity, 10_008.0);
        assert_eq!(snap.free_margin, 10_008.0 - 110.02);
        let level = snap.margin_level.unwrap();
        assert!((level - 10_008.0 / 110.02).abs() < 1e-9);
    }

    #[test]
    fn zero_margin_means_no_level() {
        let snap = AccountSnapshot::derive(&account(), 100.0, 0.0);
        assert!(snap.margin_level.is_none());
        assert_eq!(snap.free_margin, 100.0);
    }

    #[test]
    fn credential_hash_never_serialized() {
        let json = serde_json::to_string(&account()).unwrap();
        assert!(!json.contains("credential_hash"));
        assert!(!json.contains(&"ab".repeat(32)));
    }
}
