// =============================================================================
// Ledger — append-only journal of balance-changing entries
// =============================================================================
//
// Every balance mutation is one journal line (newline-delimited JSON) plus an
// in-memory balance-cache update. The journal write happens first; an I/O
// failure leaves the cache untouched and returns a retryable error, so no
// half-applied state is ever observable. On load the cache is rebuilt
// deterministically by replaying entries in id order, verifying each stored
// `balance_after` against the running sum.
// =============================================================================

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::{Clock, IdGen};
use crate::error::{BusinessRule, CoreError, CoreResult};

// ---------------------------------------------------------------------------
// Entry model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerEntryType {
    Deposit,
    Withdrawal,
    Commission,
    Swap,
    Pnl,
    Adjustment,
    Bonus,
}

impl std::fmt::Display for LedgerEntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Deposit => "DEPOSIT",
            Self::Withdrawal => "WITHDRAWAL",
            Self::Commission => "COMMISSION",
            Self::Swap => "SWAP",
            Self::Pnl => "PNL",
            Self::Adjustment => "ADJUSTMENT",
            Self::Bonus => "BONUS",
        };
        write!(f, "{name}")
    }
}

/// One journal line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: u64,
    pub account_id: u64,
    #[serde(rename = "type")]
    pub entry_type: LedgerEntryType,
    pub amount_signed: f64,
    pub balance_after: f64,
    /// Cross-reference: position id, payment method, external txn id.
    #[serde(default)]
    pub reference: String,
    #[serde(default)]
    pub note: String,
    /// Who initiated the change (user name, "system", admin id).
    #[serde(default)]
    pub actor: String,
    pub ts: i64,
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

struct LedgerInner {
    balances: HashMap<u64, f64>,
    entries: Vec<LedgerEntry>,
}

pub struct Ledger {
    journal_path: PathBuf,
    ids: Arc<IdGen>,
    clock: Arc<Clock>,
    inner: Mutex<LedgerInner>,
}

impl Ledger {
    pub fn new(journal_path: impl Into<PathBuf>, ids: Arc<IdGen>, clock: Arc<Clock>) -> Self {
        Self {
            journal_path: journal_path.into(),
            ids,
            clock,
            inner: Mutex::new(LedgerInner {
                balances: HashMap::new(),
                entries: Vec::new(),
            }),
        }
    }

    /// Rebuild the balance cache from the journal. Replays entries in id
    /// order and verifies each stored `balance_after` against the running
    /// balance; any disagreement is a fatal invariant violation.
    pub fn load(&self) -> CoreResult<usize> {
        let content = match std::fs::read_to_string(&self.journal_path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(CoreError::Retryable(e.to_string())),
        };

        let mut entries: Vec<LedgerEntry> = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: LedgerEntry = serde_json::from_str(line).map_err(|e| {
                CoreError::Internal(format!(
                    "corrupt journal line {} in {}: {e}",
                    lineno + 1,
                    self.journal_path.display()
                ))
            })?;
            entries.push(entry);
        }
        entries.sort_by_key(|e| e.id);

        let mut balances: HashMap<u64, f64> = HashMap::new();
        let mut max_id = 0;
        for entry in &entries {
            let balance = balances.entry(entry.account_id).or_insert(0.0);
            let expected = *balance + entry.amount_signed;
            if (expected - entry.balance_after).abs() > 1e-6 {
                return Err(CoreError::Internal(format!(
                    "journal entry {} balance_after {} disagrees with running balance {}",
                    entry.id, entry.balance_after, expected
                )));
            }
            *balance = entry.balance_after;
            max_id = max_id.max(entry.id);
        }
        self.ids.bump_ledger_entry(max_id);

        let count = entries.len();
        let mut inner = self.inner.lock();
        inner.balances = balances;
        inner.entries = entries;
        info!(count, path = %self.journal_path.display(), "ledger journal replayed");
        Ok(count)
    }

    /// Cached balance for `account`. Missing accounts read as zero.
    pub fn balance(&self, account_id: u64) -> f64 {
        self.inner
            .lock()
            .balances
            .get(&account_id)
            .copied()
            .unwrap_or(0.0)
    }

    /// Most recent `limit` entries for `account`, newest first.
    pub fn entries(&self, account_id: u64, limit: usize) -> Vec<LedgerEntry> {
        let inner = self.inner.lock();
        inner
            .entries
            .iter()
            .rev()
            .filter(|e| e.account_id == account_id)
            .take(limit)
            .cloned()
            .collect()
    }

    // -------------------------------------------------------------------------
    // Core append path
    // -------------------------------------------------------------------------

    /// Append one entry: journal first, cache second. The lock spans both so
    /// per-account entry order equals call order.
    fn apply(
        &self,
        account_id: u64,
        entry_type: LedgerEntryType,
        amount_signed: f64,
        reference: &str,
        note: &str,
        actor: &str,
    ) -> CoreResult<LedgerEntry> {
        if !amount_signed.is_finite() {
            return Err(CoreError::InvalidInput("non-finite ledger amount".into()));
        }

        let mut inner = self.inner.lock();
        let prior = inner.balances.get(&account_id).copied().unwrap_or(0.0);
        let balance_after = prior + amount_signed;
        if !balance_after.is_finite() {
            return Err(BusinessRule::LedgerInvariantViolated(account_id).into());
        }

        let entry = LedgerEntry {
            id: self.ids.next_ledger_entry(),
            account_id,
            entry_type,
            amount_signed,
            balance_after,
            reference: reference.to_string(),
            note: note.to_string(),
            actor: actor.to_string(),
            ts: self.clock.now_ms(),
        };

        if let Err(e) = self.append_line(&entry) {
            warn!(account = account_id, error = %e, "journal append failed, rolling back");
            return Err(CoreError::Retryable(format!("journal append failed: {e}")));
        }

        inner.balances.insert(account_id, balance_after);
        inner.entries.push(entry.clone());
        Ok(entry)
    }

    fn append_line(&self, entry: &LedgerEntry) -> anyhow::Result<()> {
        if let Some(parent) = self.journal_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.journal_path)?;
        let line = serde_json::to_string(entry)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Operations
    // -------------------------------------------------------------------------

    pub fn deposit(
        &self,
        account_id: u64,
        amount: f64,
        method: &str,
        reference: &str,
        note: &str,
        actor: &str,
    ) -> CoreResult<LedgerEntry> {
        if amount <= 0.0 {
            return Err(CoreError::InvalidInput("deposit amount must be > 0".into()));
        }
        let note = if note.is_empty() {
            format!("deposit via {method}")
        } else {
            note.to_string()
        };
        self.apply(account_id, LedgerEntryType::Deposit, amount, reference, &note, actor)
    }

    /// Debit a withdrawal. The free-margin precondition is checked by the
    /// engine, which sees equity and margin; the ledger only guards the sign.
    pub fn withdraw(
        &self,
        account_id: u64,
        amount: f64,
        reference: &str,
        note: &str,
        actor: &str,
    ) -> CoreResult<LedgerEntry> {
        if amount <= 0.0 {
            return Err(CoreError::InvalidInput(
                "withdrawal amount must be > 0".into(),
            ));
        }
        self.apply(
            account_id,
            LedgerEntryType::Withdrawal,
            -amount,
            reference,
            note,
            actor,
        )
    }

    pub fn commission(&self, account_id: u64, amount: f64, position_id: u64) -> CoreResult<LedgerEntry> {
        self.apply(
            account_id,
            LedgerEntryType::Commission,
            -amount.abs(),
            &position_id.to_string(),
            "commission",
            "system",
        )
    }

    pub fn swap(&self, account_id: u64, amount_signed: f64, position_id: u64) -> CoreResult<LedgerEntry> {
        self.apply(
            account_id,
            LedgerEntryType::Swap,
            amount_signed,
            &position_id.to_string(),
            "swap",
            "system",
        )
    }

    pub fn realized_pnl(
        &self,
        account_id: u64,
        amount_signed: f64,
        position_id: u64,
    ) -> CoreResult<LedgerEntry> {
        self.apply(
            account_id,
            LedgerEntryType::Pnl,
            amount_signed,
            &position_id.to_string(),
            "realized pnl",
            "system",
        )
    }

    pub fn adjust(
        &self,
        account_id: u64,
        amount_signed: f64,
        reason: &str,
        actor: &str,
    ) -> CoreResult<LedgerEntry> {
        self.apply(
            account_id,
            LedgerEntryType::Adjustment,
            amount_signed,
            "",
            reason,
            actor,
        )
    }

    pub fn bonus(
        &self,
        account_id: u64,
        amount: f64,
        reason: &str,
        actor: &str,
    ) -> CoreResult<LedgerEntry> {
        if amount <= 0.0 {
            return Err(CoreError::InvalidInput("bonus amount must be > 0".into()));
        }
        self.apply(account_id, LedgerEntryType::Bonus, amount, "", reason, actor)
    }
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Ledger")
            .field("journal", &self.journal_path)
            .field("accounts", &inner.balances.len())
            .field("entries", &inner.entries.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn ledger(dir: &std::path::Path) -> Ledger {
        Ledger::new(
            dir.join("ledger.jsonl"),
            Arc::new(IdGen::new()),
            Arc::new(Clock::new()),
        )
    }

    #[test]
    fn deposit_then_withdraw_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let l = ledger(dir.path());
        l.deposit(1, 10_000.0, "wire", "tx1", "", "admin").unwrap();
        assert_eq!(l.balance(1), 10_000.0);
        l.withdraw(1, 10_000.0, "tx2", "", "admin").unwrap();
        assert_eq!(l.balance(1), 0.0);
    }

    #[test]
    fn sum_of_entries_equals_cache() {
        let dir = tempfile::tempdir().unwrap();
        let l = ledger(dir.path());
        l.deposit(7, 1_000.0, "card", "", "", "admin").unwrap();
        l.commission(7, 3.5, 42).unwrap();
        l.realized_pnl(7, 12.25, 42).unwrap();
        l.swap(7, -0.75, 42).unwrap();
        l.adjust(7, -8.0, "correction", "admin").unwrap();

        let total: f64 = l.entries(7, 100).iter().map(|e| e.amount_signed).sum();
        assert!((total - l.balance(7)).abs() < 1e-9);
    }

    #[test]
    fn rejects_non_positive_amounts() {
        let dir = tempfile::tempdir().unwrap();
        let l = ledger(dir.path());
        assert!(l.deposit(1, 0.0, "wire", "", "", "admin").is_err());
        assert!(l.deposit(1, -5.0, "wire", "", "", "admin").is_err());
        assert!(l.withdraw(1, -5.0, "", "", "admin").is_err());
        assert!(l.bonus(1, 0.0, "", "admin").is_err());
    }

    #[test]
    fn balance_after_recorded_per_entry() {
        let dir = tempfile::tempdir().unwrap();
        let l = ledger(dir.path());
        let e1 = l.deposit(1, 500.0, "wire", "", "", "admin").unwrap();
        assert_eq!(e1.balance_after, 500.0);
        let e2 = l.withdraw(1, 200.0, "", "", "admin").unwrap();
        assert_eq!(e2.balance_after, 300.0);
        assert!(e2.id > e1.id);
    }

    #[test]
    fn reload_rebuilds_cache_deterministically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        {
            let l = Ledger::new(&path, Arc::new(IdGen::new()), Arc::new(Clock::new()));
            l.deposit(1, 100.0, "wire", "", "", "admin").unwrap();
            l.deposit(2, 50.0, "wire", "", "", "admin").unwrap();
            l.withdraw(1, 25.0, "", "", "admin").unwrap();
        }
        let ids = Arc::new(IdGen::new());
        let l = Ledger::new(&path, ids.clone(), Arc::new(Clock::new()));
        assert_eq!(l.load().unwrap(), 3);
        assert_eq!(l.balance(1), 75.0);
        assert_eq!(l.balance(2), 50.0);
        // Fresh ids continue past the replayed maximum.
        assert_eq!(ids.next_ledger_entry(), 4);
    }

    #[test]
    fn load_detects_tampered_balance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        {
            let l = Ledger::new(&path, Arc::new(IdGen::new()), Arc::new(Clock::new()));
            l.deposit(1, 100.0, "wire", "", "", "admin").unwrap();
        }
        // Tamper: rewrite the entry with a wrong balance_after.
        let line = std::fs::read_to_string(&path).unwrap();
        let tampered = line.replace("100.0", "999.0");
        std::fs::write(&path, tampered).unwrap();

        let l = Ledger::new(&path, Arc::new(IdGen::new()), Arc::new(Clock::new()));
        match l.load() {
            Err(CoreError::Internal(_)) => {}
            other => panic!("expected internal error, got {other:?}"),
        }
    }

    #[test]
    fn missing_journal_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let l = ledger(dir.path());
        assert_eq!(l.load().unwrap(), 0);
        assert_eq!(l.balance(1), 0.0);
    }
}
