// sharewatch/src/enforce/firewall.rs
//
// Host-level address blocking.
//
// FirewallAdapter keeps an in-memory mirror of what it has blocked and only
// shells out when the mirror says the command would change something, so
// repeated block/unblock calls are idempotent. The mirror is updated only
// after the backend reports success; a failed command is simply retried on
// the next attempt.
//
// The mirror is not persisted. sync_from_host() rebuilds it from the live
// ruleset at startup so bans issued before a restart can still be lifted.
//
// Backends:
//   IptablesBackend   iptables / ip6tables DROP rules in one chain
//   NoopBackend       for hosts where another layer does the filtering

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::FirewallError;

#[async_trait]
pub trait FirewallBackend: Send + Sync {
    async fn block(&self, addr: IpAddr) -> Result<(), FirewallError>;
    async fn unblock(&self, addr: IpAddr) -> Result<(), FirewallError>;
    /// Addresses currently dropped by the host ruleset.
    async fn list_blocked(&self) -> Result<Vec<IpAddr>, FirewallError>;
}

// ── Adapter ───────────────────────────────────────────────────────────────────

pub struct FirewallAdapter {
    backend: Arc<dyn FirewallBackend>,
    blocked: Mutex<HashSet<IpAddr>>,
    ops:     tokio::sync::Mutex<()>,   // one backend command at a time
}

impl FirewallAdapter {
    pub fn new(backend: Arc<dyn FirewallBackend>) -> Self {
        Self { backend, blocked: Mutex::new(HashSet::new()), ops: tokio::sync::Mutex::new(()) }
    }

    fn parse(addr: &str) -> Result<IpAddr, FirewallError> {
        addr.trim().parse().map_err(|_| FirewallError::InvalidAddress(addr.to_string()))
    }

    /// Returns true if a firewall command was issued.
    pub async fn block_address(&self, addr: &str) -> Result<bool, FirewallError> {
        let ip = Self::parse(addr)?;
        let _op = self.ops.lock().await;
        if self.blocked.lock().contains(&ip) {
            debug!(%ip, "already blocked");
            return Ok(false);
        }
        self.backend.block(ip).await?;
        self.blocked.lock().insert(ip);
        info!(%ip, "address blocked");
        Ok(true)
    }

    /// Returns true if a firewall command was issued.
    pub async fn unblock_address(&self, addr: &str) -> Result<bool, FirewallError> {
        let ip = Self::parse(addr)?;
        let _op = self.ops.lock().await;
        if !self.blocked.lock().contains(&ip) {
            debug!(%ip, "not blocked, nothing to undo");
            return Ok(false);
        }
        self.backend.unblock(ip).await?;
        self.blocked.lock().remove(&ip);
        info!(%ip, "address unblocked");
        Ok(true)
    }

    pub fn is_blocked(&self, addr: &str) -> bool {
        Self::parse(addr).map(|ip| self.blocked.lock().contains(&ip)).unwrap_or(false)
    }

    pub fn list_blocked(&self) -> Vec<String> {
        let mut v: Vec<String> = self.blocked.lock().iter().map(|ip| ip.to_string()).collect();
        v.sort();
        v
    }

    pub fn n_blocked(&self) -> usize { self.blocked.lock().len() }

    /// Seed the mirror from the host ruleset. Returns how many were found.
    pub async fn sync_from_host(&self) -> Result<usize, FirewallError> {
        let _op   = self.ops.lock().await;
        let found = self.backend.list_blocked().await?;
        let mut blocked = self.blocked.lock();
        blocked.extend(found);
        info!(blocked = blocked.len(), "firewall mirror synced from host");
        Ok(blocked.len())
    }
}

// ── iptables ──────────────────────────────────────────────────────────────────

pub struct IptablesBackend {
    chain: String,
}

impl IptablesBackend {
    pub fn new(chain: impl Into<String>) -> Self {
        Self { chain: chain.into() }
    }

    fn program(addr: &IpAddr) -> &'static str {
        if addr.is_ipv6() { "ip6tables" } else { "iptables" }
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<String, FirewallError> {
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|source| FirewallError::Spawn { program: program.to_string(), source })?;
        if !output.status.success() {
            return Err(FirewallError::Command {
                command: format!("{} {}", program, args.join(" ")),
                status:  output.status.to_string(),
                stderr:  String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl FirewallBackend for IptablesBackend {
    async fn block(&self, addr: IpAddr) -> Result<(), FirewallError> {
        let a = addr.to_string();
        self.run(Self::program(&addr), &["-I", self.chain.as_str(), "-s", a.as_str(), "-j", "DROP"]).await.map(|_| ())
    }

    async fn unblock(&self, addr: IpAddr) -> Result<(), FirewallError> {
        let a = addr.to_string();
        self.run(Self::program(&addr), &["-D", self.chain.as_str(), "-s", a.as_str(), "-j", "DROP"]).await.map(|_| ())
    }

    async fn list_blocked(&self) -> Result<Vec<IpAddr>, FirewallError> {
        let mut out = parse_drop_rules(&self.run("iptables", &["-S", self.chain.as_str()]).await?);
        match self.run("ip6tables", &["-S", self.chain.as_str()]).await {
            Ok(rules) => out.extend(parse_drop_rules(&rules)),
            Err(e)    => warn!("ip6tables listing unavailable: {}", e),
        }
        Ok(out)
    }
}

/// Pull single-host sources out of `-S` output lines like
/// `-A INPUT -s 1.2.3.4/32 -j DROP`.
pub fn parse_drop_rules(rules: &str) -> Vec<IpAddr> {
    rules.lines()
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let drops = tokens.windows(2).any(|w| w[0] == "-j" && w[1] == "DROP");
            if !drops { return None; }
            let src = tokens.windows(2).find(|w| w[0] == "-s").map(|w| w[1])?;
            let (host, prefix) = src.split_once('/').unwrap_or((src, ""));
            let ip: IpAddr = host.parse().ok()?;
            let single = match (prefix, ip) {
                ("", _) => true,
                ("32", IpAddr::V4(_)) | ("128", IpAddr::V6(_)) => true,
                _ => false,
            };
            single.then_some(ip)
        })
        .collect()
}

// ── No-op ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct NoopBackend;

#[async_trait]
impl FirewallBackend for NoopBackend {
    async fn block(&self, addr: IpAddr) -> Result<(), FirewallError> {
        debug!(%addr, "noop firewall: block");
        Ok(())
    }

    async fn unblock(&self, addr: IpAddr) -> Result<(), FirewallError> {
        debug!(%addr, "noop firewall: unblock");
        Ok(())
    }

    async fn list_blocked(&self) -> Result<Vec<IpAddr>, FirewallError> { Ok(Vec::new()) }
}
