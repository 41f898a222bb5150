// sharewatch/src/config.rs
//
// Process configuration — built once at startup and shared read-only.
//
// Resolution order:
//   1. Config::default()
//   2. JSON file given with --config (missing fields fall back to defaults)
//   3. individual CLI flags (see main.rs)
//
// Durations are kept in the units operators think in (minutes / hours) and
// converted at the edges. A non-positive ban duration means bans never
// expire; a non-positive retention means activity is never evicted.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use chrono::{Duration, FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const BUFFER_FILE:     &str = "access_buffer.log";
pub const CHECKPOINT_FILE: &str = "access_buffer.offset";
pub const LEDGER_FILE:     &str = "bans.json";
pub const OUTBOX_FILE:     &str = "notifications.jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FirewallBackendKind {
    #[default]
    Iptables,
    Noop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub max_addresses_per_account:    usize,  // distinct addresses allowed per account
    pub save_interval_minutes:        u64,    // accumulator period
    pub check_interval_minutes:       u64,    // reconciliation period
    pub ban_duration_minutes:         i64,    // <= 0: permanent
    pub activity_retention_minutes:   i64,    // <= 0: never evicted
    pub cleanup_interval_hours:       u64,    // buffer pruning period
    pub cleanup_initial_delay_minutes: u64,

    pub source_log_path:  PathBuf,            // external rotating access log
    pub data_dir:         PathBuf,            // buffer, checkpoint, ledger, outbox
    pub registry_path:    PathBuf,            // file-backed provisioner state

    pub ignored_addresses:      Vec<String>,  // management / loopback sources
    pub log_utc_offset_minutes: i32,          // zone of the access log timestamps

    pub firewall_backend: FirewallBackendKind,
    pub firewall_chain:   String,

    pub admin_listen:        Option<SocketAddr>,
    pub resync_pause_millis: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_addresses_per_account:     1,
            save_interval_minutes:         25,
            check_interval_minutes:        25,
            ban_duration_minutes:          120,
            activity_retention_minutes:    90,
            cleanup_interval_hours:        1,
            cleanup_initial_delay_minutes: 30,
            source_log_path:  PathBuf::from("/usr/local/x-ui/access.log"),
            data_dir:         PathBuf::from("/var/lib/sharewatch"),
            registry_path:    PathBuf::from("/var/lib/sharewatch/accounts.json"),
            ignored_addresses:      vec!["127.0.0.1".to_string(), "::1".to_string()],
            log_utc_offset_minutes: 0,
            firewall_backend: FirewallBackendKind::Iptables,
            firewall_chain:   "INPUT".to_string(),
            admin_listen:        None,
            resync_pause_millis: 1500,
        }
    }
}

impl Config {
    /// Load a JSON config file on top of the defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        serde_json::from_str(&raw)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.save_interval_minutes == 0 {
            return Err(ConfigError::NonPositive { field: "save_interval_minutes" });
        }
        if self.check_interval_minutes == 0 {
            return Err(ConfigError::NonPositive { field: "check_interval_minutes" });
        }
        if self.cleanup_interval_hours == 0 {
            return Err(ConfigError::NonPositive { field: "cleanup_interval_hours" });
        }
        if self.log_utc_offset_minutes.abs() >= 24 * 60 {
            return Err(ConfigError::BadOffset(self.log_utc_offset_minutes));
        }
        Ok(())
    }

    pub fn buffer_path(&self)     -> PathBuf { self.data_dir.join(BUFFER_FILE) }
    pub fn checkpoint_path(&self) -> PathBuf { self.data_dir.join(CHECKPOINT_FILE) }
    pub fn ledger_path(&self)     -> PathBuf { self.data_dir.join(LEDGER_FILE) }
    pub fn outbox_path(&self)     -> PathBuf { self.data_dir.join(OUTBOX_FILE) }

    /// None when activity should never be evicted.
    pub fn retention(&self) -> Option<Duration> {
        (self.activity_retention_minutes > 0)
            .then(|| Duration::minutes(self.activity_retention_minutes))
    }

    /// None when bans never expire.
    pub fn ban_duration(&self) -> Option<Duration> {
        (self.ban_duration_minutes > 0).then(|| Duration::minutes(self.ban_duration_minutes))
    }

    pub fn log_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.log_utc_offset_minutes * 60)
            .unwrap_or_else(|| Utc.fix())
    }

    pub fn save_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.save_interval_minutes * 60)
    }

    pub fn check_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.check_interval_minutes * 60)
    }

    pub fn cleanup_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.cleanup_interval_hours * 3600)
    }

    pub fn cleanup_initial_delay(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.cleanup_initial_delay_minutes * 60)
    }

    pub fn resync_pause(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.resync_pause_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = Config::default();
        assert_eq!(c.max_addresses_per_account, 1);
        assert_eq!(c.save_interval_minutes, 25);
        assert_eq!(c.check_interval_minutes, 25);
        assert_eq!(c.ban_duration_minutes, 120);
        assert_eq!(c.activity_retention_minutes, 90);
        assert_eq!(c.cleanup_interval_hours, 1);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let dir  = tempfile::tempdir().unwrap();
        let path = dir.path().join("sharewatch.json");
        std::fs::write(&path, r#"{"max_addresses_per_account": 3, "ban_duration_minutes": 0}"#).unwrap();

        let c = Config::from_file(&path).unwrap();
        assert_eq!(c.max_addresses_per_account, 3);
        assert!(c.ban_duration().is_none());
        assert_eq!(c.activity_retention_minutes, 90);
        assert_eq!(c.ledger_path(), c.data_dir.join(LEDGER_FILE));
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let c = Config { check_interval_minutes: 0, ..Config::default() };
        assert!(matches!(c.validate(), Err(ConfigError::NonPositive { field: "check_interval_minutes" })));
    }

    #[test]
    fn non_positive_retention_disables_eviction() {
        let c = Config { activity_retention_minutes: -1, ..Config::default() };
        assert!(c.retention().is_none());
        let c = Config::default();
        assert_eq!(c.retention(), Some(Duration::minutes(90)));
    }
}
