// sharewatch/src/state/bans.rs
//
// Persisted ban ledger with TTL.
//
// The JSON file (account → BanRecord) is the source of truth across restarts:
// it is loaded once at startup and rewritten in full (temp file + rename)
// after every mutation. The in-memory map is guarded by a parking_lot RwLock
// and the rewrite happens while the write lock is still held, so the file
// always reflects the latest mutation order.
//
// Expiry is lazy: lookups drop a record once now > expires_at and persist the
// removal. cleanup_expired_bans() does the same for every record at once.
//
// Persistence failures are logged, not returned: the in-memory mutation
// stands and the next successful rewrite carries it to disk.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::clock::SharedClock;
use crate::error::LedgerError;
use crate::events::{BanRecord, BanStats};

pub struct BanManager {
    path:     PathBuf,
    duration: Option<Duration>,   // None = bans never expire
    clock:    SharedClock,
    bans:     RwLock<HashMap<String, BanRecord>>,
}

impl BanManager {
    /// Open (or create) the ledger at `path`. Failing to create the parent
    /// directory is the only fatal case; a missing file is an empty ledger and
    /// a corrupt one is reset to empty.
    pub fn open(path: impl Into<PathBuf>, duration: Option<Duration>, clock: SharedClock) -> Result<Self, LedgerError> {
        let path: PathBuf = path.into();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .map_err(|source| LedgerError::Io { path: dir.to_path_buf(), source })?;
        }
        let bans = load(&path);
        info!(path = %path.display(), bans = bans.len(), "ban ledger loaded");
        Ok(Self { path, duration, clock, bans: RwLock::new(bans) })
    }

    pub fn now(&self) -> DateTime<Utc> { self.clock.now() }

    // ── Lookups (lazy expiry) ─────────────────────────────────────────────────

    pub fn is_banned(&self, account_id: &str) -> bool {
        self.is_banned_at(account_id, self.now())
    }

    pub fn is_banned_at(&self, account_id: &str, now: DateTime<Utc>) -> bool {
        self.get_ban_info_at(account_id, now).is_some()
    }

    pub fn get_ban_info(&self, account_id: &str) -> Option<BanRecord> {
        self.get_ban_info_at(account_id, self.now())
    }

    pub fn get_ban_info_at(&self, account_id: &str, now: DateTime<Utc>) -> Option<BanRecord> {
        {
            let bans = self.bans.read();
            match bans.get(account_id) {
                None => return None,
                Some(rec) if !rec.is_expired_at(now) => return Some(rec.clone()),
                Some(_) => {}
            }
        }
        let mut bans = self.bans.write();
        // Re-check under the write lock; another task may have replaced it.
        if bans.get(account_id).map(|r| r.is_expired_at(now)).unwrap_or(false) {
            bans.remove(account_id);
            info!(account = account_id, "ban expired");
            self.persist(&bans);
        }
        bans.get(account_id).cloned()
    }

    /// All live bans, after dropping expired ones.
    pub fn get_active_bans(&self) -> Vec<BanRecord> {
        let now = self.now();
        self.cleanup_expired_bans_at(now);
        let mut out: Vec<BanRecord> = self.bans.read().values().cloned().collect();
        out.sort_by(|a, b| a.banned_at.cmp(&b.banned_at).then_with(|| a.account_id.cmp(&b.account_id)));
        out
    }

    /// Live bans as of `now` without touching the ledger.
    pub fn peek_active_bans_at(&self, now: DateTime<Utc>) -> Vec<BanRecord> {
        let mut out: Vec<BanRecord> = self.bans.read().values()
            .filter(|r| !r.is_expired_at(now))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.banned_at.cmp(&b.banned_at).then_with(|| a.account_id.cmp(&b.account_id)));
        out
    }

    // ── Mutations ─────────────────────────────────────────────────────────────

    pub fn ban_user<I>(&self, account_id: &str, reason: &str, addresses: I) -> Result<BanRecord, LedgerError>
    where
        I: IntoIterator<Item = String>,
    {
        self.ban_user_at(account_id, reason, addresses, self.now())
    }

    pub fn ban_user_at<I>(&self, account_id: &str, reason: &str, addresses: I, now: DateTime<Utc>) -> Result<BanRecord, LedgerError>
    where
        I: IntoIterator<Item = String>,
    {
        let ip_addresses: BTreeSet<String> = addresses.into_iter().collect();
        if ip_addresses.is_empty() {
            return Err(LedgerError::NoAddresses(account_id.to_string()));
        }
        let record = BanRecord {
            account_id:   account_id.to_string(),
            banned_at:    now,
            expires_at:   self.duration.map(|d| now + d),
            reason:       reason.to_string(),
            ip_addresses,
        };

        let mut bans = self.bans.write();
        bans.insert(account_id.to_string(), record.clone());
        self.persist(&bans);
        warn!(
            account   = account_id,
            addresses = record.ip_addresses.len(),
            expires   = ?record.expires_at,
            "account banned: {}", reason
        );
        Ok(record)
    }

    /// Remove a ban. Returns the removed record, if any.
    pub fn unban_user(&self, account_id: &str) -> Option<BanRecord> {
        let mut bans = self.bans.write();
        let removed = bans.remove(account_id);
        if removed.is_some() {
            self.persist(&bans);
            info!(account = account_id, "account unbanned");
        }
        removed
    }

    // ── Housekeeping ──────────────────────────────────────────────────────────

    pub fn cleanup_expired_bans(&self) -> Vec<BanRecord> {
        self.cleanup_expired_bans_at(self.now())
    }

    /// Drop every record with now > expires_at. Returns what was removed.
    pub fn cleanup_expired_bans_at(&self, now: DateTime<Utc>) -> Vec<BanRecord> {
        self.sweep(|rec| rec.is_expired_at(now), "expired")
    }

    pub fn cleanup_old_bans(&self, retention_minutes: i64) -> Vec<BanRecord> {
        self.cleanup_old_bans_at(retention_minutes, self.now())
    }

    /// Drop records whose expiry lies further back than the activity
    /// retention window. Permanent bans are never touched.
    pub fn cleanup_old_bans_at(&self, retention_minutes: i64, now: DateTime<Utc>) -> Vec<BanRecord> {
        if retention_minutes <= 0 { return Vec::new(); }
        let horizon = now - Duration::minutes(retention_minutes);
        self.sweep(|rec| rec.expires_at.map(|e| e < horizon).unwrap_or(false), "old")
    }

    fn sweep(&self, drop_if: impl Fn(&BanRecord) -> bool, kind: &str) -> Vec<BanRecord> {
        let mut bans = self.bans.write();
        let doomed: Vec<String> = bans.values()
            .filter(|r| drop_if(r))
            .map(|r| r.account_id.clone())
            .collect();
        if doomed.is_empty() { return Vec::new(); }

        let removed: Vec<BanRecord> = doomed.iter().filter_map(|id| bans.remove(id)).collect();
        self.persist(&bans);
        info!(removed = removed.len(), kind, "ban ledger swept");
        removed
    }

    pub fn get_ban_stats(&self) -> BanStats {
        let now  = self.now();
        let soon = now + Duration::hours(1);
        let bans = self.bans.read();
        let live = bans.values().filter(|r| !r.is_expired_at(now));
        let mut stats = BanStats::default();
        for rec in live {
            stats.active += 1;
            match rec.expires_at {
                None                => stats.permanent += 1,
                Some(e) if e <= soon => stats.expiring_within_hour += 1,
                Some(_)             => {}
            }
        }
        stats
    }

    pub fn len(&self) -> usize { self.bans.read().len() }

    pub fn is_empty(&self) -> bool { self.bans.read().is_empty() }

    // ── Persistence ───────────────────────────────────────────────────────────

    fn persist(&self, bans: &HashMap<String, BanRecord>) {
        if let Err(e) = save(&self.path, bans) {
            error!(path = %self.path.display(), "ban ledger write failed: {}", e);
        } else {
            debug!(bans = bans.len(), "ban ledger written");
        }
    }
}

fn load(path: &Path) -> HashMap<String, BanRecord> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return HashMap::new(),
        Err(e) => {
            error!(path = %path.display(), "ban ledger unreadable, starting empty: {}", e);
            return HashMap::new();
        }
    };
    if raw.trim().is_empty() { return HashMap::new(); }
    match serde_json::from_str(&raw) {
        Ok(bans) => bans,
        Err(e) => {
            error!(path = %path.display(), "ban ledger corrupt, starting empty: {}", e);
            HashMap::new()
        }
    }
}

fn save(path: &Path, bans: &HashMap<String, BanRecord>) -> Result<(), LedgerError> {
    let json = serde_json::to_string_pretty(bans)?;
    let tmp  = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).map_err(|source| LedgerError::Io { path: tmp.clone(), source })?;
    std::fs::rename(&tmp, path).map_err(|source| LedgerError::Io { path: path.to_path_buf(), source })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn t0() -> DateTime<Utc> { Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() }

    fn addrs(list: &[&str]) -> Vec<String> { list.iter().map(|s| s.to_string()).collect() }

    fn manager(dir: &Path, minutes: i64) -> (Arc<ManualClock>, BanManager) {
        let clock = ManualClock::new(t0());
        let dur   = (minutes > 0).then(|| Duration::minutes(minutes));
        let m     = BanManager::open(dir.join("bans.json"), dur, clock.clone()).unwrap();
        (clock, m)
    }

    #[test]
    fn ban_expires_after_ttl_and_is_removed_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let (clock, m) = manager(dir.path(), 120);
        m.ban_user("A", "too many addresses", addrs(&["1.1.1.1", "2.2.2.2"])).unwrap();
        assert!(m.is_banned("A"));

        clock.advance(Duration::minutes(120));
        assert!(m.is_banned("A"), "expiry is strictly after expires_at");

        clock.advance(Duration::minutes(1));
        assert_eq!(m.len(), 1);
        assert!(!m.is_banned("A"));
        assert_eq!(m.len(), 0);

        let on_disk: HashMap<String, BanRecord> =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("bans.json")).unwrap()).unwrap();
        assert!(on_disk.is_empty());
    }

    #[test]
    fn zero_duration_never_expires() {
        let dir = tempfile::tempdir().unwrap();
        let (clock, m) = manager(dir.path(), 0);
        let rec = m.ban_user("A", "r", addrs(&["1.1.1.1"])).unwrap();
        assert!(rec.expires_at.is_none());
        clock.advance(Duration::days(365));
        assert!(m.is_banned("A"));
        assert!(m.cleanup_expired_bans().is_empty());
        assert!(m.cleanup_old_bans(90).is_empty());
        assert_eq!(m.get_ban_stats().permanent, 1);
    }

    #[test]
    fn ledger_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (_clock, m) = manager(dir.path(), 120);
            m.ban_user("A", "r", addrs(&["1.1.1.1", "2.2.2.2"])).unwrap();
        }
        let (_clock, m) = manager(dir.path(), 120);
        let info = m.get_ban_info("A").unwrap();
        assert_eq!(info.ip_addresses.len(), 2);
        assert_eq!(info.reason, "r");
    }

    #[test]
    fn corrupt_ledger_resets_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bans.json"), "{ not json").unwrap();
        let (_clock, m) = manager(dir.path(), 120);
        assert!(m.is_empty());
        m.ban_user("B", "r", addrs(&["3.3.3.3"])).unwrap();
        let (_clock, m) = manager(dir.path(), 120);
        assert!(m.is_banned("B"));
    }

    #[test]
    fn ban_without_addresses_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (_clock, m) = manager(dir.path(), 120);
        assert!(matches!(m.ban_user("A", "r", Vec::new()), Err(LedgerError::NoAddresses(_))));
        assert!(!m.is_banned("A"));
    }

    #[test]
    fn unban_removes_record() {
        let dir = tempfile::tempdir().unwrap();
        let (_clock, m) = manager(dir.path(), 120);
        m.ban_user("A", "r", addrs(&["1.1.1.1"])).unwrap();
        assert!(m.unban_user("A").is_some());
        assert!(m.unban_user("A").is_none());
        assert!(!m.is_banned("A"));
    }

    #[test]
    fn sweeps_and_stats() {
        let dir = tempfile::tempdir().unwrap();
        let (clock, m) = manager(dir.path(), 30);
        m.ban_user("early", "r", addrs(&["1.1.1.1"])).unwrap();
        clock.advance(Duration::minutes(20));
        m.ban_user("late", "r", addrs(&["2.2.2.2"])).unwrap();

        let stats = m.get_ban_stats();
        assert_eq!(stats.active, 2);
        assert_eq!(stats.expiring_within_hour, 2);

        // early expires at +30, late at +50
        clock.advance(Duration::minutes(15));
        let gone: Vec<String> = m.cleanup_expired_bans().into_iter().map(|r| r.account_id).collect();
        assert_eq!(gone, vec!["early".to_string()]);
        assert_eq!(m.get_active_bans().len(), 1);
    }

    #[test]
    fn old_ban_sweep_uses_retention_horizon() {
        let dir = tempfile::tempdir().unwrap();
        let (_clock, m) = manager(dir.path(), 10);
        m.ban_user("A", "r", addrs(&["1.1.1.1"])).unwrap();

        // expires_at = t0+10; horizon at t0+95 with 90m retention is t0+5.
        assert!(m.cleanup_old_bans_at(90, t0() + Duration::minutes(95)).is_empty());
        // horizon at t0+101 is t0+11, past expires_at.
        let removed = m.cleanup_old_bans_at(90, t0() + Duration::minutes(101));
        assert_eq!(removed.len(), 1);
        assert!(m.is_empty());
    }
}
