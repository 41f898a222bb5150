// sharewatch/src/engine/service.rs
//
// Reconciliation loop — binds analyzer, ban ledger, firewall and the
// provisioning / notification collaborators together.
//
// One cycle:
//   1. snapshot `now` once; every ban decision in the cycle uses it
//   2. sweep expired and long-dead bans, unblocking their addresses
//   3. re-run the analyzer over the access buffer
//   4. walk the provisioner's account list, first matching rule wins:
//        banned                 keep the credential disabled
//        active + suspicious    ban, disable + rotate, block, notify
//        active + normal        release a ban lifted this cycle, re-enable if needed
//        idle                   re-enable if needed
//   5. log a CycleReport
//
// Any per-account failure is logged and counted; the cycle carries on with
// the next account and the action is retried next cycle.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::SharedClock;
use crate::config::Config;
use crate::enforce::firewall::FirewallAdapter;
use crate::enforce::notify::Notifier;
use crate::enforce::provision::Provisioner;
use crate::error::ProvisionError;
use crate::events::{Account, AccountActivity, AccountSummary, BanRecord, CycleReport, ServiceStatus};
use crate::scheduler::{PeriodicTask, Shutdown};
use crate::state::activity::{ActivitySnapshot, LogAnalyzer};
use crate::state::bans::BanManager;

pub const RESTORED_MESSAGE: &str = "account restored";

const TOP_ACCOUNTS: usize = 10;

pub struct IpBanService {
    config:      Config,
    clock:       SharedClock,
    analyzer:    Arc<LogAnalyzer>,
    bans:        Arc<BanManager>,
    firewall:    Arc<FirewallAdapter>,
    provisioner: Arc<dyn Provisioner>,
    notifier:    Arc<dyn Notifier>,
    cycle:       Mutex<()>,   // scheduled and manual cycles never overlap
    shutdown:    Shutdown,
}

impl IpBanService {
    pub fn new(
        config:      Config,
        clock:       SharedClock,
        analyzer:    Arc<LogAnalyzer>,
        bans:        Arc<BanManager>,
        firewall:    Arc<FirewallAdapter>,
        provisioner: Arc<dyn Provisioner>,
        notifier:    Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config, clock, analyzer, bans, firewall, provisioner, notifier,
            cycle:    Mutex::new(()),
            shutdown: Shutdown::new(),
        }
    }

    pub fn analyzer(&self) -> &Arc<LogAnalyzer> { &self.analyzer }
    pub fn bans(&self) -> &Arc<BanManager> { &self.bans }

    // ── Cycle ─────────────────────────────────────────────────────────────────

    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let _cycle = self.cycle.lock().await;
        let now    = self.clock.now();
        let mut report = CycleReport::default();

        // Ban housekeeping first so the account walk sees the final ledger.
        let expired = self.bans.cleanup_expired_bans_at(now);
        let old     = self.bans.cleanup_old_bans_at(self.config.activity_retention_minutes, now);
        report.expired_bans = expired.len();
        report.old_bans     = old.len();
        let lifted = self.release(expired.iter().chain(old.iter()), now).await;

        let snapshot = match self.analyzer.analyze().await {
            Ok(s) => s,
            Err(e) => {
                warn!("analysis failed, using previous snapshot: {:#}", e);
                self.analyzer.snapshot()
            }
        };

        let accounts = self.provisioner.list_accounts().await
            .context("listing accounts from provisioner")?;
        report.accounts = accounts.len();

        for account in &accounts {
            self.reconcile(account, &snapshot, &lifted, now, &mut report).await;
        }

        info!(%report, "reconciliation cycle finished");
        Ok(report)
    }

    async fn reconcile(
        &self,
        account:  &Account,
        snapshot: &ActivitySnapshot,
        lifted:   &HashMap<String, usize>,
        now:      DateTime<Utc>,
        report:   &mut CycleReport,
    ) {
        let id  = account.account_id.as_str();
        let max = self.config.max_addresses_per_account;

        if self.bans.is_banned_at(id, now) {
            report.still_banned += 1;
            if account.enabled {
                warn!(account = id, "banned account found enabled, disabling");
                if let Err(e) = self.provisioner.disable_account(id).await {
                    error!(account = id, "disable failed: {}", e);
                    report.failures += 1;
                }
            }
            return;
        }

        match snapshot.get(id) {
            Some(activity) if activity.is_suspicious(max) => {
                report.suspicious += 1;
                if self.ban(activity, now).await { report.newly_banned += 1 } else { report.failures += 1 }
            }
            Some(activity) => {
                report.normal += 1;
                // Only a ban lifted this cycle releases addresses.
                if let Some(&released) = lifted.get(id) {
                    let unblocked = released + self.unblock_recent(activity, now).await;
                    if unblocked > 0 {
                        self.owner(id, &format!("{} address(es) unblocked, connections allowed again", unblocked)).await;
                    }
                }
                match self.provisioner.account_enabled(id).await {
                    Ok(true)  => {}
                    Ok(false) => self.re_enable(id, report).await,
                    Err(e) => {
                        error!(account = id, "state query failed: {}", e);
                        report.failures += 1;
                    }
                }
            }
            None => {
                report.idle += 1;
                if !account.enabled { self.re_enable(id, report).await; }
            }
        }
    }

    /// Returns false if the ban could not be put in force.
    async fn ban(&self, activity: &AccountActivity, now: DateTime<Utc>) -> bool {
        let id  = activity.account_id.as_str();
        let max = self.config.max_addresses_per_account;
        // Checked again: an admin unban or a parallel path may have raced us.
        if self.bans.is_banned_at(id, now) { return true; }

        let reason = format!("{} distinct addresses observed, {} allowed", activity.distinct_address_count, max);
        let record = match self.bans.ban_user_at(id, &reason, activity.recent_addresses(), now) {
            Ok(r) => r,
            Err(e) => {
                error!(account = id, "ban not recorded: {}", e);
                return false;
            }
        };

        // Without the rotation the ban is not in force: roll the ledger back so
        // the next cycle retries the whole ban.
        if let Err(e) = self.provisioner.disable_and_rotate_secret(id).await {
            error!(account = id, "disable and rotate failed, retrying next cycle: {}", e);
            self.bans.unban_user(id);
            return false;
        }

        for addr in &record.ip_addresses {
            if let Err(e) = self.firewall.block_address(addr).await {
                warn!(account = id, address = %addr, "block failed: {}", e);
            }
        }

        let duration = match self.config.ban_duration() {
            Some(d) => format!("{} minutes", d.num_minutes()),
            None    => "an indefinite period".to_string(),
        };
        self.owner(id, &format!(
            "Access suspended: {} distinct addresses observed, {} allowed. The ban lasts {}.",
            activity.distinct_address_count, max, duration,
        )).await;
        let addresses: Vec<&str> = record.ip_addresses.iter().map(String::as_str).collect();
        self.operator(&format!("account {} banned ({}); addresses: {}", id, reason, addresses.join(", "))).await;
        true
    }

    /// Enable, verify, and force a resync if the enable did not stick.
    pub async fn restore(&self, account_id: &str) -> Result<(), ProvisionError> {
        self.provisioner.enable_account(account_id).await?;
        if !self.provisioner.account_enabled(account_id).await? {
            warn!(account = account_id, "enable did not take effect, forcing resync");
            self.provisioner.force_resync(account_id).await?;
        }
        Ok(())
    }

    async fn re_enable(&self, account_id: &str, report: &mut CycleReport) {
        match self.restore(account_id).await {
            Ok(()) => {
                report.re_enabled += 1;
                info!(account = account_id, "account re-enabled");
                self.owner(account_id, RESTORED_MESSAGE).await;
            }
            Err(e) => {
                error!(account = account_id, "re-enable failed: {}", e);
                report.failures += 1;
            }
        }
    }

    /// Addresses some live ban still needs dropped.
    fn held_addresses(&self, now: DateTime<Utc>) -> HashSet<String> {
        self.bans.peek_active_bans_at(now).into_iter().flat_map(|r| r.ip_addresses).collect()
    }

    /// Unblock the addresses of lifted bans. Returns unblock counts per account.
    async fn release<'a>(
        &self,
        records: impl Iterator<Item = &'a BanRecord>,
        now:     DateTime<Utc>,
    ) -> HashMap<String, usize> {
        let held = self.held_addresses(now);
        let mut lifted = HashMap::new();
        for rec in records {
            let mut n = 0;
            for addr in rec.ip_addresses.iter().filter(|a| !held.contains(*a)) {
                match self.firewall.unblock_address(addr).await {
                    Ok(true)  => n += 1,
                    Ok(false) => {}
                    Err(e)    => warn!(account = %rec.account_id, address = %addr, "unblock failed: {}", e),
                }
            }
            lifted.insert(rec.account_id.clone(), n);
        }
        lifted
    }

    async fn unblock_recent(&self, activity: &AccountActivity, now: DateTime<Utc>) -> usize {
        let held = self.held_addresses(now);
        let mut n = 0;
        for addr in activity.recent_addresses().into_iter().filter(|a| !held.contains(a)) {
            match self.firewall.unblock_address(&addr).await {
                Ok(true)  => n += 1,
                Ok(false) => {}
                Err(e)    => warn!(account = %activity.account_id, address = %addr, "unblock failed: {}", e),
            }
        }
        n
    }

    async fn owner(&self, account_id: &str, message: &str) {
        if let Err(e) = self.notifier.notify_owner(account_id, message).await {
            warn!(account = account_id, "owner notification failed: {}", e);
        }
    }

    async fn operator(&self, message: &str) {
        if let Err(e) = self.notifier.notify_operator(message).await {
            warn!("operator notification failed: {}", e);
        }
    }

    // ── Admin / diagnostics ───────────────────────────────────────────────────

    /// Fresh analysis plus ledger view. Never mutates bans or provisioning.
    pub async fn get_status(&self) -> ServiceStatus {
        if let Err(e) = self.analyzer.analyze().await {
            warn!("status analysis failed, reporting previous snapshot: {:#}", e);
        }
        let max        = self.config.max_addresses_per_account;
        let suspicious = self.analyzer.suspicious_accounts(max);
        let normal     = self.analyzer.normal_accounts(max);
        let top: Vec<AccountSummary> = suspicious.iter().chain(normal.iter())
            .take(TOP_ACCOUNTS)
            .map(AccountSummary::from)
            .collect();
        let now = self.clock.now();

        ServiceStatus {
            max_addresses_per_account:  max,
            activity_retention_minutes: self.config.activity_retention_minutes,
            ban_duration_minutes:       self.config.ban_duration_minutes,
            tracked_accounts:           self.analyzer.n_accounts(),
            suspicious_accounts:        suspicious.len(),
            normal_accounts:            normal.len(),
            bans:                       self.bans.get_ban_stats(),
            active_bans:                self.bans.peek_active_bans_at(now),
            blocked_addresses:          self.firewall.n_blocked(),
            top_accounts:               top,
            generated_at:               now,
        }
    }

    /// Human-readable summary, one line plus one per suspicious account.
    pub async fn print_current_stats(&self) -> String {
        let status = self.get_status().await;
        let mut out = format!(
            "tracked={} suspicious={} normal={} bans={} blocked={} (max {} per account)",
            status.tracked_accounts, status.suspicious_accounts, status.normal_accounts,
            status.bans.active, status.blocked_addresses, status.max_addresses_per_account,
        );
        for acc in self.analyzer.suspicious_accounts(status.max_addresses_per_account) {
            out.push_str(&format!(
                "\n  {:<24} {:>3} addrs  {}",
                acc.account_id, acc.distinct_address_count, acc.recent_addresses().join(", "),
            ));
        }
        info!("{}", out);
        out
    }

    pub fn reset_counters(&self) {
        self.analyzer.reset();
    }

    // ── Background task ───────────────────────────────────────────────────────

    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(&self);
        PeriodicTask::new("reconcile", self.config.check_interval())
            .spawn(self.shutdown.subscribe(), move || {
                let this = Arc::clone(&this);
                async move {
                    if let Err(e) = this.run_cycle().await {
                        error!("reconciliation cycle aborted: {:#}", e);
                    }
                }
            })
    }

    pub fn stop(&self) {
        if self.shutdown.trigger() {
            debug!("reconciliation loop stopping");
        }
    }
}
