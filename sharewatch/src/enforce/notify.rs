// sharewatch/src/enforce/notify.rs
//
// Notification collaborator. Two audiences:
//   owner     the account holder (ban notice, restore notice)
//   operator  whoever runs the proxy (one line per ban)
//
// OutboxNotifier appends one JSON object per message to notifications.jsonl;
// a chat bot or mailer tails that file. LogNotifier just emits tracing events.
// Delivery failures are reported to the caller, which logs and moves on.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::clock::SharedClock;
use crate::error::NotifyError;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_owner(&self, account_id: &str, message: &str) -> Result<(), NotifyError>;
    async fn notify_operator(&self, message: &str) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recipient {
    Owner,
    Operator,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub recipient:  Recipient,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    pub message:    String,
    pub timestamp:  DateTime<Utc>,
}

// ── JSONL outbox ──────────────────────────────────────────────────────────────

pub struct OutboxNotifier {
    path:  PathBuf,
    clock: SharedClock,
}

impl OutboxNotifier {
    pub fn new(path: impl Into<PathBuf>, clock: SharedClock) -> Self {
        Self { path: path.into(), clock }
    }

    async fn write(&self, n: &Notification) -> Result<(), NotifyError> {
        let mut line = serde_json::to_string(n)?;
        line.push('\n');
        let io = |source: std::io::Error| NotifyError::Io { path: self.path.clone(), source };
        let mut f = OpenOptions::new().create(true).append(true)
            .open(&self.path).await.map_err(io)?;
        f.write_all(line.as_bytes()).await.map_err(io)?;
        f.flush().await.map_err(io)?;
        Ok(())
    }
}

#[async_trait]
impl Notifier for OutboxNotifier {
    async fn notify_owner(&self, account_id: &str, message: &str) -> Result<(), NotifyError> {
        self.write(&Notification {
            recipient:  Recipient::Owner,
            account_id: Some(account_id.to_string()),
            message:    message.to_string(),
            timestamp:  self.clock.now(),
        }).await
    }

    async fn notify_operator(&self, message: &str) -> Result<(), NotifyError> {
        self.write(&Notification {
            recipient:  Recipient::Operator,
            account_id: None,
            message:    message.to_string(),
            timestamp:  self.clock.now(),
        }).await
    }
}

// ── tracing only ──────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_owner(&self, account_id: &str, message: &str) -> Result<(), NotifyError> {
        info!(account = account_id, "[owner] {}", message);
        Ok(())
    }

    async fn notify_operator(&self, message: &str) -> Result<(), NotifyError> {
        info!("[operator] {}", message);
        Ok(())
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Records every message; with `fail` set, delivery reports an error
    /// after recording.
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub owner:    Mutex<Vec<(String, String)>>,
        pub operator: Mutex<Vec<String>>,
        pub fail:     Mutex<bool>,
    }

    impl RecordingNotifier {
        fn outcome(&self) -> Result<(), NotifyError> {
            if !*self.fail.lock() { return Ok(()); }
            Err(NotifyError::Io {
                path:   PathBuf::from("outbox"),
                source: std::io::Error::new(std::io::ErrorKind::Other, "simulated delivery failure"),
            })
        }

        pub fn owner_messages(&self, account_id: &str) -> Vec<String> {
            self.owner.lock().iter()
                .filter(|(a, _)| a == account_id)
                .map(|(_, m)| m.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify_owner(&self, account_id: &str, message: &str) -> Result<(), NotifyError> {
            self.owner.lock().push((account_id.to_string(), message.to_string()));
            self.outcome()
        }

        async fn notify_operator(&self, message: &str) -> Result<(), NotifyError> {
            self.operator.lock().push(message.to_string());
            self.outcome()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    #[tokio::test]
    async fn outbox_appends_one_line_per_message() {
        let dir   = tempfile::tempdir().unwrap();
        let path  = dir.path().join("notifications.jsonl");
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap());
        let n     = OutboxNotifier::new(&path, clock);

        n.notify_owner("42", "account suspended").await.unwrap();
        n.notify_operator("account 42 banned").await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<Notification> = raw.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].recipient, Recipient::Owner);
        assert_eq!(lines[0].account_id.as_deref(), Some("42"));
        assert_eq!(lines[1].recipient, Recipient::Operator);
        assert!(lines[1].account_id.is_none());
        assert_eq!(lines[1].timestamp, Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn outbox_in_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let n = OutboxNotifier::new(dir.path().join("nope/out.jsonl"), ManualClock::new(Utc::now()));
        assert!(matches!(n.notify_operator("x").await, Err(NotifyError::Io { .. })));
    }
}
