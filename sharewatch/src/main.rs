// sharewatch/src/main.rs
//
// sharewatch — credential-sharing detection and enforcement for proxy panels.
//
// Tails the proxy's accepted-connection log, counts distinct source
// addresses per account over a sliding window, and bans accounts that
// exceed the allowed number: the credential is disabled and rotated, the
// offending addresses are dropped at the firewall, and both the owner and
// the operator are notified. Bans expire and accounts come back on their own.
//
// Usage:
//   sharewatch --config /etc/sharewatch.json
//   sharewatch --source /usr/local/x-ui/access.log --max-addresses 2
//   sharewatch --config /etc/sharewatch.json --once      # cron / smoke test

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod admin_api;
mod clock;
mod config;
mod enforce;
mod engine;
mod error;
mod events;
mod ingest;
mod scheduler;
mod state;

use admin_api::AdminServer;
use clock::{SharedClock, SystemClock};
use config::{Config, FirewallBackendKind};
use engine::service::IpBanService;
use enforce::firewall::{FirewallAdapter, FirewallBackend, IptablesBackend, NoopBackend};
use enforce::notify::{LogNotifier, Notifier, OutboxNotifier};
use enforce::provision::JsonRegistryProvisioner;
use events::CycleReport;
use ingest::accumulator::LogAccumulator;
use scheduler::Shutdown;
use state::activity::LogAnalyzer;
use state::bans::BanManager;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "sharewatch",
    about   = "Detects and bans shared proxy credentials",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    #[arg(long, help = "JSON config file; flags below override it")]
    config: Option<PathBuf>,

    #[arg(long, help = "Proxy access log to follow")]
    source: Option<PathBuf>,

    #[arg(long, help = "Directory for buffer, checkpoint, ledger and outbox")]
    data_dir: Option<PathBuf>,

    #[arg(long, help = "Account registry used by the file-backed provisioner")]
    registry: Option<PathBuf>,

    #[arg(long, help = "Distinct addresses allowed per account")]
    max_addresses: Option<usize>,

    #[arg(long, help = "Reconciliation period in minutes")]
    check_interval: Option<u64>,

    #[arg(long, help = "Accumulation period in minutes")]
    save_interval: Option<u64>,

    #[arg(long, allow_hyphen_values = true, help = "Ban length in minutes (<= 0: permanent)")]
    ban_duration: Option<i64>,

    #[arg(long, allow_hyphen_values = true, help = "Activity window in minutes (<= 0: keep forever)")]
    retention: Option<i64>,

    #[arg(long, value_enum)]
    firewall: Option<FirewallArg>,

    #[arg(long, value_enum, default_value = "outbox")]
    notify: NotifyArg,

    #[arg(long, help = "Admin API bind address, e.g. 127.0.0.1:7070")]
    admin: Option<SocketAddr>,

    #[arg(long, help = "Run one accumulate + reconcile pass and exit")]
    once: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum FirewallArg {
    Iptables,   // DROP rules via iptables / ip6tables
    Noop,       // filtering handled elsewhere
}

#[derive(Clone, Copy, ValueEnum)]
enum NotifyArg {
    Outbox,     // notifications.jsonl for a delivery bot
    Log,        // tracing only
}

impl Cli {
    fn load_config(&self) -> Result<Config> {
        let mut cfg = match &self.config {
            Some(path) => Config::from_file(path)?,
            None       => Config::default(),
        };
        if let Some(v) = &self.source        { cfg.source_log_path = v.clone(); }
        if let Some(v) = &self.data_dir      { cfg.data_dir = v.clone(); }
        if let Some(v) = &self.registry      { cfg.registry_path = v.clone(); }
        if let Some(v) = self.max_addresses  { cfg.max_addresses_per_account = v; }
        if let Some(v) = self.check_interval { cfg.check_interval_minutes = v; }
        if let Some(v) = self.save_interval  { cfg.save_interval_minutes = v; }
        if let Some(v) = self.ban_duration   { cfg.ban_duration_minutes = v; }
        if let Some(v) = self.retention      { cfg.activity_retention_minutes = v; }
        if let Some(v) = self.admin          { cfg.admin_listen = Some(v); }
        if let Some(v) = self.firewall {
            cfg.firewall_backend = match v {
                FirewallArg::Iptables => FirewallBackendKind::Iptables,
                FirewallArg::Noop     => FirewallBackendKind::Noop,
            };
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

// ── Terminal output ───────────────────────────────────────────────────────────

fn print_banner(cfg: &Config) {
    println!("\x1b[1m");
    println!("  ┌─┐┬ ┬┌─┐┬─┐┌─┐┬ ┬┌─┐┌┬┐┌─┐┬ ┬");
    println!("  └─┐├─┤├─┤├┬┘├┤ │││├─┤ │ │  ├─┤");
    println!("  └─┘┴ ┴┴ ┴┴└─└─┘└┴┘┴ ┴ ┴ └─┘┴ ┴");
    println!("\x1b[0m");
    println!("  \x1b[90mShared-credential detection | max {} address(es) per account\x1b[0m", cfg.max_addresses_per_account);
    println!("  Source : {}", cfg.source_log_path.display());
    println!("  Data   : {}", cfg.data_dir.display());
    println!(
        "  Timers : accumulate {}m  reconcile {}m  prune {}h  ban {}m  window {}m\n",
        cfg.save_interval_minutes, cfg.check_interval_minutes, cfg.cleanup_interval_hours,
        cfg.ban_duration_minutes, cfg.activity_retention_minutes,
    );
}

// ── Single pass ───────────────────────────────────────────────────────────────

/// One accumulate + reconcile pass. A source log that cannot be read is
/// logged; the cycle still runs so expired bans are lifted.
async fn run_once(accumulator: &LogAccumulator, service: &IpBanService) -> Result<CycleReport> {
    accumulator.load_checkpoint().await;
    match accumulator.accumulate_new_lines().await {
        Ok(outcome) => info!(appended = outcome.appended, offset = outcome.offset, "accumulated"),
        Err(e)      => warn!("accumulation failed, reconciling buffered activity only: {:#}", e),
    }
    service.run_cycle().await
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env()
            .add_directive("sharewatch=info".parse()?))
        .compact().init();

    let cli = Cli::parse();
    let cfg = cli.load_config()?;
    std::fs::create_dir_all(&cfg.data_dir)
        .with_context(|| format!("creating data dir {}", cfg.data_dir.display()))?;

    let clock: SharedClock = Arc::new(SystemClock);

    let backend: Arc<dyn FirewallBackend> = match cfg.firewall_backend {
        FirewallBackendKind::Iptables => Arc::new(IptablesBackend::new(cfg.firewall_chain.clone())),
        FirewallBackendKind::Noop     => Arc::new(NoopBackend),
    };
    let firewall = Arc::new(FirewallAdapter::new(backend));
    if let Err(e) = firewall.sync_from_host().await {
        warn!("could not read host firewall rules, starting with empty mirror: {}", e);
    }

    let notifier: Arc<dyn Notifier> = match cli.notify {
        NotifyArg::Outbox => Arc::new(OutboxNotifier::new(cfg.outbox_path(), Arc::clone(&clock))),
        NotifyArg::Log    => Arc::new(LogNotifier),
    };
    let provisioner = Arc::new(JsonRegistryProvisioner::open(&cfg.registry_path, cfg.resync_pause())?);
    let bans        = Arc::new(BanManager::open(cfg.ledger_path(), cfg.ban_duration(), Arc::clone(&clock))?);
    let accumulator = Arc::new(LogAccumulator::new(&cfg, Arc::clone(&clock)));
    let analyzer    = Arc::new(LogAnalyzer::new(&cfg, Arc::clone(&clock)));
    let service     = Arc::new(IpBanService::new(
        cfg.clone(), clock, analyzer, bans, firewall, provisioner, notifier,
    ));

    if cli.once {
        let report = run_once(&accumulator, &service).await?;
        println!("{}", report);
        return Ok(());
    }

    print_banner(&cfg);

    let mut tasks = vec![
        Arc::clone(&accumulator).start().await,
        Arc::clone(&accumulator).start_cleanup_service(),
        Arc::clone(&service).start(),
    ];

    let admin_stop = Shutdown::new();
    if let Some(addr) = cfg.admin_listen {
        let listener = AdminServer::bind(addr).await?;
        let server   = Arc::new(AdminServer::new(Arc::clone(&service)));
        let stop     = admin_stop.subscribe();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = server.serve(listener, stop).await {
                error!("admin API failed: {:#}", e);
            }
        }));
    }

    println!("  Press Ctrl+C to stop.\n");
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("shutdown requested");

    accumulator.stop();
    service.stop();
    admin_stop.trigger();
    for task in tasks {
        if let Err(e) = task.await {
            warn!("task ended abnormally: {}", e);
        }
    }
    info!("sharewatch stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use crate::clock::ManualClock;
    use crate::enforce::provision::testing::MockProvisioner;

    #[tokio::test]
    async fn once_reconciles_when_source_log_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config {
            data_dir:        dir.path().to_path_buf(),
            source_log_path: dir.path().join("missing-access.log"),
            ..Config::default()
        };
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let manual = ManualClock::new(t0);
        let clock: SharedClock = manual.clone();

        let bans = Arc::new(BanManager::open(cfg.ledger_path(), cfg.ban_duration(), clock.clone()).unwrap());
        bans.ban_user("42", "manual", vec!["1.1.1.1".to_string()]).unwrap();
        let provisioner = Arc::new(MockProvisioner::with_accounts(&[("42", false)]));
        let accumulator = LogAccumulator::new(&cfg, clock.clone());
        let service = IpBanService::new(
            cfg.clone(),
            clock.clone(),
            Arc::new(LogAnalyzer::new(&cfg, clock)),
            bans,
            Arc::new(FirewallAdapter::new(Arc::new(NoopBackend))),
            provisioner.clone(),
            Arc::new(LogNotifier),
        );

        manual.advance(Duration::minutes(121));
        let report = run_once(&accumulator, &service).await.unwrap();
        assert_eq!(report.expired_bans, 1);
        assert_eq!(report.re_enabled, 1);
        assert_eq!(provisioner.is_enabled("42"), Some(true));
    }
}
