// =============================================================================
// Engine Configuration — JSON file + environment overrides, atomic save
// =============================================================================
//
// Central configuration hub for the Meridian engine. Process-wide settings
// live in one immutable `EngineConfig` value built at startup; the only
// runtime-mutable toggles (execution mode, MT5 mode) are atomic cells held by
// the components that read them.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_tickstore_dir() -> String {
    "./data/ticks".to_string()
}

fn default_ohlc_dir() -> String {
    "./data/ohlc".to_string()
}

fn default_fixstore_dir() -> String {
    "./fixstore".to_string()
}

fn default_ledger_journal() -> String {
    "./data/ledger.jsonl".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_hub_throttle_ms() -> u64 {
    40
}

fn default_tick_ring_capacity() -> usize {
    50_000
}

fn default_flush_interval_s() -> u64 {
    30
}

fn default_fix_heartbeat_s() -> u64 {
    30
}

fn default_fix_gap_grace_ms() -> u64 {
    500
}

fn default_fix_message_ttl_days() -> u32 {
    7
}

fn default_stop_out_level() -> f64 {
    0.50
}

fn default_lp_staleness_ms() -> i64 {
    2_000
}

fn default_ohlc_bar_capacity() -> usize {
    500
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration for the Meridian engine.
///
/// Every field has a serde default so that older JSON files missing new
/// fields still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // --- Storage paths -------------------------------------------------------
    /// Directory holding per-symbol tick day files.
    #[serde(default = "default_tickstore_dir")]
    pub tickstore_dir: String,

    /// Directory holding per-symbol OHLC files.
    #[serde(default = "default_ohlc_dir")]
    pub ohlc_dir: String,

    /// Directory holding FIX session sequence/message stores.
    #[serde(default = "default_fixstore_dir")]
    pub fixstore_dir: String,

    /// Path of the append-only ledger journal.
    #[serde(default = "default_ledger_journal")]
    pub ledger_journal: String,

    // --- Market data ---------------------------------------------------------
    /// Ticks kept in the in-memory ring per symbol.
    #[serde(default = "default_tick_ring_capacity")]
    pub tick_ring_capacity: usize,

    /// Day files strictly older than this many days are deleted on cleanup.
    /// 0 keeps everything forever.
    #[serde(default)]
    pub tickstore_max_days: u32,

    /// Interval between persistence flushes, in seconds.
    #[serde(default = "default_flush_interval_s")]
    pub flush_interval_s: u64,

    /// Finalized bars retained per (symbol, timeframe).
    #[serde(default = "default_ohlc_bar_capacity")]
    pub ohlc_bar_capacity: usize,

    // --- Hub -----------------------------------------------------------------
    /// Per-subscriber per-symbol broadcast throttle.
    #[serde(default = "default_hub_throttle_ms")]
    pub hub_throttle_ms: u64,

    /// Disable throttling globally (every accepted tick is broadcast).
    #[serde(default)]
    pub mt5_mode: bool,

    // --- LP aggregation ------------------------------------------------------
    /// A higher-priority quote older than this no longer shadows lower
    /// priorities.
    #[serde(default = "default_lp_staleness_ms")]
    pub lp_staleness_ms: i64,

    // --- FIX -----------------------------------------------------------------
    /// Heartbeat interval in seconds (tag 108 on Logon).
    #[serde(default = "default_fix_heartbeat_s")]
    pub fix_heartbeat_s: u64,

    /// Grace window before a ResendRequest is issued for a detected gap.
    #[serde(default = "default_fix_gap_grace_ms")]
    pub fix_gap_grace_ms: u64,

    /// Days a sent message is retained for ResendRequest replay.
    #[serde(default = "default_fix_message_ttl_days")]
    pub fix_message_ttl_days: u32,

    // --- Engine --------------------------------------------------------------
    /// Margin level below which forced liquidation begins.
    #[serde(default = "default_stop_out_level")]
    pub stop_out_level: f64,

    // --- API -----------------------------------------------------------------
    /// Bind address of the HTTP/WS server.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tickstore_dir: default_tickstore_dir(),
            ohlc_dir: default_ohlc_dir(),
            fixstore_dir: default_fixstore_dir(),
            ledger_journal: default_ledger_journal(),
            tick_ring_capacity: default_tick_ring_capacity(),
            tickstore_max_days: 0,
            flush_interval_s: default_flush_interval_s(),
            ohlc_bar_capacity: default_ohlc_bar_capacity(),
            hub_throttle_ms: default_hub_throttle_ms(),
            mt5_mode: false,
            lp_staleness_ms: default_lp_staleness_ms(),
            fix_heartbeat_s: default_fix_heartbeat_s(),
            fix_gap_grace_ms: default_fix_gap_grace_ms(),
            fix_message_ttl_days: default_fix_message_ttl_days(),
            stop_out_level: default_stop_out_level(),
            bind_addr: default_bind_addr(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(path = %path.display(), "engine config loaded");
        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise engine config")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }

    /// Apply recognised environment-variable overrides on top of the loaded
    /// (or default) configuration.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("MT5_MODE") {
            self.mt5_mode = matches!(v.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Ok(v) = std::env::var("TICKSTORE_DIR") {
            self.tickstore_dir = v;
        }
        if let Ok(v) = std::env::var("FIXSTORE_DIR") {
            self.fixstore_dir = v;
        }
        if let Ok(v) = std::env::var("LEDGER_JOURNAL") {
            self.ledger_journal = v;
        }
        if let Ok(v) = std::env::var("TICKSTORE_MAX_DAYS") {
            if let Ok(n) = v.parse() {
                self.tickstore_max_days = n;
            }
        }
        if let Ok(v) = std::env::var("HUB_THROTTLE_MS") {
            if let Ok(n) = v.parse() {
                self.hub_throttle_ms = n;
            }
        }
        if let Ok(v) = std::env::var("FIX_HEARTBEAT_S") {
            if let Ok(n) = v.parse() {
                self.fix_heartbeat_s = n;
            }
        }
        if let Ok(v) = std::env::var("FIX_GAP_GRACE_MS") {
            if let Ok(n) = v.parse() {
                self.fix_gap_grace_ms = n;
            }
        }
        if let Ok(v) = std::env::var("MERIDIAN_BIND_ADDR") {
            self.bind_addr = v;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.hub_throttle_ms, 40);
        assert_eq!(cfg.fix_heartbeat_s, 30);
        assert_eq!(cfg.fix_gap_grace_ms, 500);
        assert_eq!(cfg.tickstore_max_days, 0);
        assert_eq!(cfg.tick_ring_capacity, 50_000);
        assert!((cfg.stop_out_level - 0.50).abs() < f64::EPSILON);
        assert!(!cfg.mt5_mode);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.tickstore_dir, "./data/ticks");
        assert_eq!(cfg.fix_message_ttl_days, 7);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "mt5_mode": true, "hub_throttle_ms": 10 }"#;
        let cfg: EngineConfig = serde_json::from_str(json).unwrap();
        assert!(cfg.mt5_mode);
        assert_eq!(cfg.hub_throttle_ms, 10);
        assert_eq!(cfg.fix_heartbeat_s, 30);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = EngineConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.tickstore_dir, cfg2.tickstore_dir);
        assert_eq!(cfg.hub_throttle_ms, cfg2.hub_throttle_ms);
    }

    #[test]
    fn save_and_load_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        let cfg = EngineConfig::default();
        cfg.save(&path).unwrap();
        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.bind_addr, cfg.bind_addr);
    }
}
