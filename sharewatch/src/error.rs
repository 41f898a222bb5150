// sharewatch/src/error.rs
//
// Typed failures for the component boundaries. The orchestrator and the
// binary glue wrap these in anyhow; callers that need to branch on the
// cause match on the variants here.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },

    #[error("failed to parse config {path}: {source}")]
    Parse { path: PathBuf, source: serde_json::Error },

    #[error("{field} must be greater than zero")]
    NonPositive { field: &'static str },

    #[error("log_utc_offset_minutes {0} is outside +/-24h")]
    BadOffset(i32),
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger I/O on {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },

    #[error("ledger serialization: {0}")]
    Json(#[from] serde_json::Error),

    #[error("refusing to ban {0} without any associated address")]
    NoAddresses(String),
}

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("not an IP address: {0}")]
    InvalidAddress(String),

    #[error("failed to spawn {program}: {source}")]
    Spawn { program: String, source: std::io::Error },

    #[error("`{command}` exited with {status}: {stderr}")]
    Command { command: String, status: String, stderr: String },
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("unknown account {0}")]
    UnknownAccount(String),

    #[error("registry I/O on {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },

    #[error("registry serialization: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("outbox write to {path} failed: {source}")]
    Io { path: PathBuf, source: std::io::Error },

    #[error("notification serialization: {0}")]
    Json(#[from] serde_json::Error),
}
