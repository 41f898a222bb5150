// sharewatch/src/events.rs
//
// Shared domain types flowing through sharewatch.
//
//   LogRecord        one parsed access-log line (ephemeral)
//   AccountActivity  per-account address fan-out inside the retention window
//   BanRecord        one entry of the persisted ban ledger
//   CycleReport      what one reconciliation pass did
//
// BanRecord's serde layout is the on-disk ledger format and must stay
// compatible with ledgers written by earlier releases.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Access log ────────────────────────────────────────────────────────────────

/// `<ts> from <addr>:<port> accepted ... email: <account>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub timestamp:      DateTime<Utc>,
    pub source_address: String,
    pub account_id:     String,
}

// ── Activity snapshot ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddressStats {
    pub count:     u64,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountActivity {
    pub account_id:             String,
    pub addresses:              HashMap<String, AddressStats>,
    pub last_update:            DateTime<Utc>,
    pub distinct_address_count: usize,
}

impl AccountActivity {
    pub fn new(account_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            account_id:             account_id.to_string(),
            addresses:              HashMap::new(),
            last_update:            now,
            distinct_address_count: 0,
        }
    }

    /// Fold one observation in. `last_seen` and `last_update` never move
    /// backwards, so out-of-order lines only bump the counter.
    pub fn observe(&mut self, address: &str, seen_at: DateTime<Utc>) {
        let entry = self.addresses
            .entry(address.to_string())
            .or_insert(AddressStats { count: 0, last_seen: seen_at });
        entry.count += 1;
        if seen_at > entry.last_seen { entry.last_seen = seen_at; }
        if seen_at > self.last_update { self.last_update = seen_at; }
    }

    /// Drop addresses last seen strictly before `cutoff`. Returns how many went.
    pub fn evict_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.addresses.len();
        self.addresses.retain(|_, s| s.last_seen >= cutoff);
        self.recount();
        before - self.addresses.len()
    }

    pub fn recount(&mut self) {
        self.distinct_address_count = self.addresses.len();
    }

    /// Addresses sorted by most recent first.
    pub fn recent_addresses(&self) -> Vec<String> {
        let mut v: Vec<(&String, &AddressStats)> = self.addresses.iter().collect();
        v.sort_by(|a, b| b.1.last_seen.cmp(&a.1.last_seen).then_with(|| a.0.cmp(b.0)));
        v.into_iter().map(|(a, _)| a.clone()).collect()
    }

    pub fn is_suspicious(&self, max_addresses: usize) -> bool {
        self.distinct_address_count > max_addresses
    }
}

// ── Ban ledger ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanRecord {
    #[serde(rename = "email")]
    pub account_id:   String,
    pub banned_at:    DateTime<Utc>,
    pub expires_at:   Option<DateTime<Utc>>,  // None = permanent
    pub reason:       String,
    pub ip_addresses: BTreeSet<String>,
}

impl BanRecord {
    /// Expired strictly after `expires_at`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|e| now > e).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BanStats {
    pub active:                usize,
    pub permanent:             usize,
    pub expiring_within_hour:  usize,
}

// ── Provisioning ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub account_id: String,
    pub enabled:    bool,
}

// ── Reconciliation ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub accounts:      usize,
    pub suspicious:    usize,
    pub normal:        usize,
    pub idle:          usize,
    pub re_enabled:    usize,
    pub newly_banned:  usize,
    pub still_banned:  usize,
    pub expired_bans:  usize,
    pub old_bans:      usize,
    pub failures:      usize,
}

impl std::fmt::Display for CycleReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "accounts={} suspicious={} normal={} idle={} re_enabled={} banned={} still_banned={} \
             expired={} pruned={} failures={}",
            self.accounts, self.suspicious, self.normal, self.idle, self.re_enabled,
            self.newly_banned, self.still_banned, self.expired_bans, self.old_bans, self.failures,
        )
    }
}

/// One row of the status view.
#[derive(Debug, Clone, Serialize)]
pub struct AccountSummary {
    pub account_id:             String,
    pub distinct_address_count: usize,
    pub addresses:              Vec<String>,
    pub last_update:            DateTime<Utc>,
}

impl From<&AccountActivity> for AccountSummary {
    fn from(a: &AccountActivity) -> Self {
        Self {
            account_id:             a.account_id.clone(),
            distinct_address_count: a.distinct_address_count,
            addresses:              a.recent_addresses(),
            last_update:            a.last_update,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub max_addresses_per_account:  usize,
    pub activity_retention_minutes: i64,
    pub ban_duration_minutes:       i64,
    pub tracked_accounts:           usize,
    pub suspicious_accounts:        usize,
    pub normal_accounts:            usize,
    pub bans:                       BanStats,
    pub active_bans:                Vec<BanRecord>,
    pub blocked_addresses:          usize,
    pub top_accounts:               Vec<AccountSummary>,
    pub generated_at:               DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> { Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() }

    #[test]
    fn out_of_order_observation_does_not_regress_last_seen() {
        let mut a = AccountActivity::new("42", t0());
        a.observe("1.1.1.1", t0() + Duration::minutes(10));
        a.observe("1.1.1.1", t0() + Duration::minutes(5));
        let s = &a.addresses["1.1.1.1"];
        assert_eq!(s.count, 2);
        assert_eq!(s.last_seen, t0() + Duration::minutes(10));
        assert_eq!(a.last_update, t0() + Duration::minutes(10));
    }

    #[test]
    fn eviction_is_strictly_before_cutoff() {
        let mut a = AccountActivity::new("42", t0());
        a.observe("1.1.1.1", t0());
        a.observe("2.2.2.2", t0() - Duration::seconds(1));
        a.recount();
        assert_eq!(a.evict_before(t0()), 1);
        assert_eq!(a.distinct_address_count, 1);
        assert!(a.addresses.contains_key("1.1.1.1"));
    }

    #[test]
    fn ban_record_ledger_layout() {
        let rec = BanRecord {
            account_id:   "42".into(),
            banned_at:    t0(),
            expires_at:   None,
            reason:       "r".into(),
            ip_addresses: ["2.2.2.2".to_string(), "1.1.1.1".to_string()].into_iter().collect(),
        };
        let v = serde_json::to_value(&rec).unwrap();
        assert_eq!(v["email"], "42");
        assert!(v["expires_at"].is_null());
        assert_eq!(v["ip_addresses"], serde_json::json!(["1.1.1.1", "2.2.2.2"]));
        assert!(!rec.is_expired_at(t0() + Duration::days(3650)));
    }
}
