// sharewatch/src/enforce/provision.rs
//
// Provisioning collaborator — the system of record for account credentials.
//
// The orchestrator only ever talks to the Provisioner trait. Session handling,
// authentication and caching quirks of a concrete backend stay behind it;
// force_resync() is where a backend hides any two-phase toggle it needs to
// make a re-enable actually take effect.
//
// JsonRegistryProvisioner keeps accounts in a JSON file:
//   [{ "id": "42", "email": "alice@example.com", "enabled": true, "secret": "<uuid>" }]
// Each mutation rewrites the file (temp + rename). Secret rotation issues a
// fresh v4 UUID, which is what the proxy expects as a client id.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::ProvisionError;
use crate::events::Account;

#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn list_accounts(&self) -> Result<Vec<Account>, ProvisionError>;
    async fn disable_account(&self, account_id: &str) -> Result<(), ProvisionError>;
    async fn enable_account(&self, account_id: &str) -> Result<(), ProvisionError>;
    /// Disable and issue a new secret so already-open sessions are cut.
    async fn disable_and_rotate_secret(&self, account_id: &str) -> Result<String, ProvisionError>;
    async fn account_enabled(&self, account_id: &str) -> Result<bool, ProvisionError>;

    fn resync_pause(&self) -> Duration { Duration::from_millis(1500) }

    /// Push the account's state through the backend again: disable, wait,
    /// enable.
    async fn force_resync(&self, account_id: &str) -> Result<(), ProvisionError> {
        self.disable_account(account_id).await?;
        tokio::time::sleep(self.resync_pause()).await;
        self.enable_account(account_id).await
    }
}

// ── File-backed registry ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub id:      String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email:   Option<String>,
    pub enabled: bool,
    pub secret:  String,
}

pub struct JsonRegistryProvisioner {
    path:    PathBuf,
    pause:   Duration,
    entries: Mutex<Vec<RegistryEntry>>,
}

impl JsonRegistryProvisioner {
    pub fn open(path: impl Into<PathBuf>, pause: Duration) -> Result<Self, ProvisionError> {
        let path: PathBuf = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => Vec::new(),
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "account registry missing, starting empty");
                Vec::new()
            }
            Err(source) => return Err(ProvisionError::Io { path, source }),
        };
        info!(path = %path.display(), accounts = entries.len(), "account registry loaded");
        Ok(Self { path, pause, entries: Mutex::new(entries) })
    }

    fn update<T>(&self, account_id: &str, f: impl FnOnce(&mut RegistryEntry) -> T) -> Result<T, ProvisionError> {
        let mut entries = self.entries.lock();
        let entry = entries.iter_mut()
            .find(|e| e.id == account_id)
            .ok_or_else(|| ProvisionError::UnknownAccount(account_id.to_string()))?;
        let out = f(entry);
        save(&self.path, &entries)?;
        Ok(out)
    }

    pub fn secret(&self, account_id: &str) -> Option<String> {
        self.entries.lock().iter().find(|e| e.id == account_id).map(|e| e.secret.clone())
    }
}

fn save(path: &Path, entries: &[RegistryEntry]) -> Result<(), ProvisionError> {
    let json = serde_json::to_string_pretty(entries)?;
    let tmp  = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).map_err(|source| ProvisionError::Io { path: tmp.clone(), source })?;
    std::fs::rename(&tmp, path).map_err(|source| ProvisionError::Io { path: path.to_path_buf(), source })
}

#[async_trait]
impl Provisioner for JsonRegistryProvisioner {
    async fn list_accounts(&self) -> Result<Vec<Account>, ProvisionError> {
        Ok(self.entries.lock().iter()
            .map(|e| Account { account_id: e.id.clone(), enabled: e.enabled })
            .collect())
    }

    async fn disable_account(&self, account_id: &str) -> Result<(), ProvisionError> {
        self.update(account_id, |e| e.enabled = false)?;
        debug!(account = account_id, "registry: disabled");
        Ok(())
    }

    async fn enable_account(&self, account_id: &str) -> Result<(), ProvisionError> {
        self.update(account_id, |e| e.enabled = true)?;
        debug!(account = account_id, "registry: enabled");
        Ok(())
    }

    async fn disable_and_rotate_secret(&self, account_id: &str) -> Result<String, ProvisionError> {
        let secret = uuid::Uuid::new_v4().to_string();
        let s = secret.clone();
        self.update(account_id, move |e| {
            e.enabled = false;
            e.secret  = s;
        })?;
        info!(account = account_id, "registry: disabled and rotated secret");
        Ok(secret)
    }

    async fn account_enabled(&self, account_id: &str) -> Result<bool, ProvisionError> {
        self.entries.lock().iter()
            .find(|e| e.id == account_id)
            .map(|e| e.enabled)
            .ok_or_else(|| ProvisionError::UnknownAccount(account_id.to_string()))
    }

    fn resync_pause(&self) -> Duration { self.pause }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::HashMap;

    /// In-memory provisioner recording every call in order.
    #[derive(Default)]
    pub struct MockProvisioner {
        pub accounts:     Mutex<Vec<Account>>,
        pub calls:        Mutex<Vec<(String, String)>>,
        pub fail_on:      Mutex<HashMap<String, String>>,   // account → op that fails
        pub stuck:        Mutex<Vec<String>>,               // enable_account is ignored once
    }

    impl MockProvisioner {
        pub fn with_accounts(accounts: &[(&str, bool)]) -> Self {
            let m = Self::default();
            *m.accounts.lock() = accounts.iter()
                .map(|(id, en)| Account { account_id: id.to_string(), enabled: *en })
                .collect();
            m
        }

        pub fn calls_for(&self, account_id: &str) -> Vec<String> {
            self.calls.lock().iter()
                .filter(|(_, a)| a == account_id)
                .map(|(op, _)| op.clone())
                .collect()
        }

        pub fn is_enabled(&self, account_id: &str) -> Option<bool> {
            self.accounts.lock().iter().find(|a| a.account_id == account_id).map(|a| a.enabled)
        }

        fn step(&self, op: &str, account_id: &str) -> Result<(), ProvisionError> {
            self.calls.lock().push((op.to_string(), account_id.to_string()));
            if self.fail_on.lock().get(account_id).map(|o| o == op).unwrap_or(false) {
                return Err(ProvisionError::UnknownAccount(format!("{} (simulated {} failure)", account_id, op)));
            }
            Ok(())
        }

        fn set(&self, account_id: &str, enabled: bool) -> Result<(), ProvisionError> {
            let mut accounts = self.accounts.lock();
            let acc = accounts.iter_mut()
                .find(|a| a.account_id == account_id)
                .ok_or_else(|| ProvisionError::UnknownAccount(account_id.to_string()))?;
            acc.enabled = enabled;
            Ok(())
        }
    }

    #[async_trait]
    impl Provisioner for MockProvisioner {
        async fn list_accounts(&self) -> Result<Vec<Account>, ProvisionError> {
            Ok(self.accounts.lock().clone())
        }

        async fn disable_account(&self, account_id: &str) -> Result<(), ProvisionError> {
            self.step("disable", account_id)?;
            self.set(account_id, false)
        }

        async fn enable_account(&self, account_id: &str) -> Result<(), ProvisionError> {
            self.step("enable", account_id)?;
            let mut stuck = self.stuck.lock();
            if let Some(pos) = stuck.iter().position(|a| a == account_id) {
                stuck.remove(pos);
                return Ok(());
            }
            drop(stuck);
            self.set(account_id, true)
        }

        async fn disable_and_rotate_secret(&self, account_id: &str) -> Result<String, ProvisionError> {
            self.step("disable_and_rotate", account_id)?;
            self.set(account_id, false)?;
            Ok(format!("secret-{}", self.calls.lock().len()))
        }

        async fn account_enabled(&self, account_id: &str) -> Result<bool, ProvisionError> {
            self.step("query", account_id)?;
            self.is_enabled(account_id).ok_or_else(|| ProvisionError::UnknownAccount(account_id.to_string()))
        }

        fn resync_pause(&self) -> Duration { Duration::ZERO }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(dir: &Path) -> JsonRegistryProvisioner {
        let path = dir.join("accounts.json");
        std::fs::write(&path, r#"[
            {"id": "42", "email": "alice@example.com", "enabled": true, "secret": "old"},
            {"id": "7", "enabled": false, "secret": "s7"}
        ]"#).unwrap();
        JsonRegistryProvisioner::open(path, Duration::ZERO).unwrap()
    }

    #[tokio::test]
    async fn lists_and_toggles_accounts() {
        let dir = tempfile::tempdir().unwrap();
        let p   = registry(dir.path());
        let accounts = p.list_accounts().await.unwrap();
        assert_eq!(accounts.len(), 2);
        assert!(accounts[0].enabled);

        p.enable_account("7").await.unwrap();
        assert!(p.account_enabled("7").await.unwrap());
        p.disable_account("42").await.unwrap();
        assert!(!p.account_enabled("42").await.unwrap());
    }

    #[tokio::test]
    async fn rotation_disables_and_persists_new_secret() {
        let dir = tempfile::tempdir().unwrap();
        let p   = registry(dir.path());
        let secret = p.disable_and_rotate_secret("42").await.unwrap();
        assert_ne!(secret, "old");
        assert!(uuid::Uuid::parse_str(&secret).is_ok());

        let reopened = JsonRegistryProvisioner::open(dir.path().join("accounts.json"), Duration::ZERO).unwrap();
        assert_eq!(reopened.secret("42"), Some(secret));
        assert!(!reopened.account_enabled("42").await.unwrap());
    }

    #[tokio::test]
    async fn unknown_account_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let p   = registry(dir.path());
        assert!(matches!(p.enable_account("nope").await, Err(ProvisionError::UnknownAccount(_))));
    }

    #[tokio::test]
    async fn force_resync_ends_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let p   = registry(dir.path());
        p.force_resync("7").await.unwrap();
        assert!(p.account_enabled("7").await.unwrap());
    }

    #[tokio::test]
    async fn missing_registry_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let p = JsonRegistryProvisioner::open(dir.path().join("absent.json"), Duration::ZERO).unwrap();
        assert!(p.list_accounts().await.unwrap().is_empty());
    }
}
