// =============================================================================
// FIX session store — sequence numbers and sent-message retention
// =============================================================================
//
// Layout under `fixstore/{session_id}/`:
//   seqnums           "out,in" — written atomically (tmp + rename)
//   messages/{seq}.msg  raw bytes of each sent message, kept for
//                       ResendRequest replay until the TTL expires
// =============================================================================

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tracing::{debug, warn};

pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(fixstore_dir: impl Into<PathBuf>, session_id: &str) -> Self {
        Self {
            dir: fixstore_dir.into().join(session_id),
        }
    }

    fn seq_path(&self) -> PathBuf {
        self.dir.join("seqnums")
    }

    fn messages_dir(&self) -> PathBuf {
        self.dir.join("messages")
    }

    /// `(out_seq, in_seq)` — the last sent and last accepted sequence
    /// numbers. A missing file reads as `(0, 0)` (fresh session).
    pub fn load_seqs(&self) -> (u64, u64) {
        let content = match std::fs::read_to_string(self.seq_path()) {
            Ok(c) => c,
            Err(_) => return (0, 0),
        };
        let mut parts = content.trim().split(',');
        let out = parts.next().and_then(|s| s.trim().parse().ok());
        let inc = parts.next().and_then(|s| s.trim().parse().ok());
        match (out, inc) {
            (Some(o), Some(i)) => (o, i),
            _ => {
                warn!(path = %self.seq_path().display(), "unreadable seqnums file, starting fresh");
                (0, 0)
            }
        }
    }

    /// Atomic write of both counters.
    pub fn save_seqs(&self, out_seq: u64, in_seq: u64) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let path = self.seq_path();
        let tmp = self.dir.join("seqnums.tmp");
        std::fs::write(&tmp, format!("{out_seq},{in_seq}"))
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("failed to rename {}", tmp.display()))?;
        Ok(())
    }

    /// Retain a sent message for resend, keyed by its sequence number.
    pub fn store_message(&self, seq: u64, bytes: &[u8]) -> Result<()> {
        let dir = self.messages_dir();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        std::fs::write(dir.join(format!("{seq}.msg")), bytes)
            .with_context(|| format!("failed to store message {seq}"))?;
        Ok(())
    }

    pub fn load_message(&self, seq: u64) -> Option<Vec<u8>> {
        std::fs::read(self.messages_dir().join(format!("{seq}.msg"))).ok()
    }

    /// Delete stored messages older than `ttl_days`. Returns how many were
    /// removed.
    pub fn purge_expired(&self, ttl_days: u32) -> usize {
        let Ok(entries) = std::fs::read_dir(self.messages_dir()) else {
            return 0;
        };
        let ttl = Duration::from_secs(u64::from(ttl_days) * 86_400);
        let now = SystemTime::now();

        let mut removed = 0;
        for entry in entries.filter_map(|e| e.ok()) {
            let expired = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|mtime| now.duration_since(mtime).ok())
                .map(|age| age > ttl)
                .unwrap_or(false);
            if expired {
                if std::fs::remove_file(entry.path()).is_ok() {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            debug!(removed, "expired fix messages purged");
        }
        removed
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_store_reads_zero() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path(), "lp-bank");
        assert_eq!(store.load_seqs(), (0, 0));
    }

    #[test]
    fn seqs_roundtrip_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path(), "lp-bank");
        store.save_seqs(17, 42).unwrap();
        assert_eq!(store.load_seqs(), (17, 42));
        store.save_seqs(18, 42).unwrap();
        assert_eq!(store.load_seqs(), (18, 42));
        // No tmp file left behind.
        assert!(!dir.path().join("lp-bank").join("seqnums.tmp").exists());
    }

    #[test]
    fn corrupt_seq_file_reads_zero() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path(), "lp-bank");
        store.save_seqs(1, 1).unwrap();
        std::fs::write(dir.path().join("lp-bank").join("seqnums"), "nonsense").unwrap();
        assert_eq!(store.load_seqs(), (0, 0));
    }

    #[test]
    fn message_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path(), "lp-bank");
        store.store_message(5, b"8=FIX.4.4...").unwrap();
        assert_eq!(store.load_message(5).unwrap(), b"8=FIX.4.4...");
        assert!(store.load_message(6).is_none());
    }

    #[test]
    fn purge_with_long_ttl_keeps_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path(), "lp-bank");
        store.store_message(1, b"x").unwrap();
        assert_eq!(store.purge_expired(7), 0);
        assert!(store.load_message(1).is_some());
    }
}
