// sharewatch/src/state/activity.rs
//
// Sliding-window activity snapshot built from the access buffer.
// DashMap = sharded concurrent HashMap, readable from any task while a pass
// runs; a pass-level mutex keeps analyze() and reset() from interleaving.
//
// One analyze() pass:
//   1. evict addresses last seen before now - retention (and empty accounts)
//   2. read the whole buffer and aggregate it into a fresh per-account view
//   3. merge the fresh view in: counts are replaced (the buffer is the source
//      of truth, so re-reading it never double counts), last_seen only moves
//      forward
//   4. recompute distinct_address_count
//
// Skipped lines: blank, unparsable, older than the retention window, or from
// an ignored (management / loopback) source address.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::clock::SharedClock;
use crate::config::Config;
use crate::events::AccountActivity;
use crate::ingest::record::RecordParser;

pub type ActivitySnapshot = HashMap<String, AccountActivity>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub matched:  usize,
    pub ignored:  usize,
    pub stale:    usize,
    pub rejected: usize,
}

pub struct LogAnalyzer {
    buffer:    PathBuf,
    parser:    RecordParser,
    retention: Option<Duration>,
    ignored:   HashSet<String>,
    clock:     SharedClock,
    accounts:  DashMap<String, AccountActivity>,
    pass:      Mutex<()>,
}

impl LogAnalyzer {
    pub fn new(config: &Config, clock: SharedClock) -> Self {
        Self {
            buffer:    config.buffer_path(),
            parser:    RecordParser::new(config.log_offset()),
            retention: config.retention(),
            ignored:   config.ignored_addresses.iter().cloned().collect(),
            clock,
            accounts:  DashMap::new(),
            pass:      Mutex::new(()),
        }
    }

    fn is_ignored(&self, address: &str) -> bool {
        if self.ignored.contains(address) { return true; }
        address.parse::<IpAddr>().map(|ip| ip.is_loopback()).unwrap_or(false)
    }

    fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.retention.map(|r| now - r)
    }

    // ── Pass ──────────────────────────────────────────────────────────────────

    pub async fn analyze(&self) -> Result<ActivitySnapshot> {
        let now = self.clock.now();
        self.evict(now);

        let content = match tokio::fs::read_to_string(&self.buffer).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e).with_context(|| format!("reading buffer {}", self.buffer.display())),
        };
        if content.trim().is_empty() {
            debug!("access buffer empty, keeping current snapshot");
            return Ok(self.snapshot());
        }

        let (fresh, stats) = self.scan(&content, now);
        self.merge(fresh);
        info!(
            accounts = self.accounts.len(),
            matched  = stats.matched,
            ignored  = stats.ignored,
            stale    = stats.stale,
            rejected = stats.rejected,
            "access buffer analyzed"
        );
        Ok(self.snapshot())
    }

    fn evict(&self, now: DateTime<Utc>) {
        let Some(cutoff) = self.cutoff(now) else { return };
        let _pass = self.pass.lock();
        let mut evicted = 0usize;
        for mut entry in self.accounts.iter_mut() {
            evicted += entry.value_mut().evict_before(cutoff);
        }
        self.accounts.retain(|_, a| !a.addresses.is_empty());
        if evicted > 0 { debug!(evicted, "evicted stale addresses"); }
    }

    fn scan(&self, content: &str, now: DateTime<Utc>) -> (ActivitySnapshot, ScanStats) {
        let cutoff    = self.cutoff(now);
        let mut fresh = ActivitySnapshot::new();
        let mut stats = ScanStats::default();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() { continue; }
            let Some(rec) = self.parser.parse(line) else { stats.rejected += 1; continue };
            if self.is_ignored(&rec.source_address) { stats.ignored += 1; continue; }
            if cutoff.map(|c| rec.timestamp < c).unwrap_or(false) { stats.stale += 1; continue; }

            fresh.entry(rec.account_id.clone())
                .or_insert_with(|| AccountActivity::new(&rec.account_id, rec.timestamp))
                .observe(&rec.source_address, rec.timestamp);
            stats.matched += 1;
        }
        (fresh, stats)
    }

    fn merge(&self, fresh: ActivitySnapshot) {
        let _pass = self.pass.lock();
        for (account_id, seen) in fresh {
            let mut entry = self.accounts
                .entry(account_id.clone())
                .or_insert_with(|| AccountActivity::new(&account_id, seen.last_update));
            let current = entry.value_mut();
            for (address, stats) in seen.addresses {
                let slot = current.addresses.entry(address).or_insert_with(|| stats.clone());
                slot.count = stats.count;
                if stats.last_seen > slot.last_seen { slot.last_seen = stats.last_seen; }
            }
            if seen.last_update > current.last_update { current.last_update = seen.last_update; }
            current.recount();
        }
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    pub fn snapshot(&self) -> ActivitySnapshot {
        self.accounts.iter().map(|e| (e.key().clone(), e.value().clone())).collect()
    }

    pub fn get(&self, account_id: &str) -> Option<AccountActivity> {
        self.accounts.get(account_id).map(|a| a.clone())
    }

    pub fn n_accounts(&self) -> usize { self.accounts.len() }

    /// Accounts with more than `max_addresses` distinct sources, busiest first.
    pub fn suspicious_accounts(&self, max_addresses: usize) -> Vec<AccountActivity> {
        self.filtered(|a| a.is_suspicious(max_addresses))
    }

    pub fn normal_accounts(&self, max_addresses: usize) -> Vec<AccountActivity> {
        self.filtered(|a| !a.is_suspicious(max_addresses))
    }

    fn filtered(&self, keep: impl Fn(&AccountActivity) -> bool) -> Vec<AccountActivity> {
        let mut out: Vec<AccountActivity> = self.accounts.iter()
            .filter(|e| keep(e.value()))
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| b.distinct_address_count.cmp(&a.distinct_address_count)
            .then_with(|| a.account_id.cmp(&b.account_id)));
        out
    }

    /// Forget everything (administrative reset).
    pub fn reset(&self) {
        let _pass = self.pass.lock();
        let n = self.accounts.len();
        self.accounts.clear();
        info!(accounts = n, "activity counters reset");
    }
}
