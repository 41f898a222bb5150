// sharewatch/src/admin_api.rs
//
// Administrative API — length-prefixed JSON over TCP.
//
// Frame format, both directions:
//   [4 bytes little-endian length] [JSON payload]
//
// Requests:
//   {"command": "status"}                      ServiceStatus
//   {"command": "stats"}                       printable summary text
//   {"command": "reset"}                       clear the activity snapshot
//   {"command": "unban", "account_id": "42"}   drop the ledger record
//
// Responses: {"ok": true, "data": ...} or {"ok": false, "error": "..."}.
// unban only edits the ledger; the next reconciliation cycle re-enables the
// account. Bind to loopback unless the port is firewalled.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::engine::service::IpBanService;
use crate::scheduler::stopped;

pub const MAX_FRAME: usize = 1_048_576;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum AdminRequest {
    Status,
    Stats,
    Reset,
    Unban { account_id: String },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AdminResponse {
    pub ok:    bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data:  Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AdminResponse {
    fn data(v: Value) -> Self { Self { ok: true, data: Some(v), error: None } }
    fn error(msg: impl Into<String>) -> Self { Self { ok: false, data: None, error: Some(msg.into()) } }
}

// ── Server ────────────────────────────────────────────────────────────────────

pub struct AdminServer {
    service: Arc<IpBanService>,
}

impl AdminServer {
    pub fn new(service: Arc<IpBanService>) -> Self {
        Self { service }
    }

    pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
        let listener = TcpListener::bind(addr).await?;
        info!("admin API listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept connections until `stop` fires.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut stop: watch::Receiver<bool>) -> Result<()> {
        loop {
            let (stream, peer) = tokio::select! {
                _ = stopped(&mut stop) => break,
                accepted = listener.accept() => accepted?,
            };
            let srv = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = srv.handle_connection(stream).await {
                    warn!("admin API connection error from {}: {:#}", peer, e);
                }
            });
        }
        info!("admin API stopped");
        Ok(())
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> Result<()> {
        loop {
            let mut len_buf = [0u8; 4];
            match stream.read_exact(&mut len_buf).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            if len > MAX_FRAME {
                write_frame(&mut stream, &AdminResponse::error(format!("frame too large: {} bytes", len))).await?;
                anyhow::bail!("frame too large: {} bytes", len);
            }

            let mut body = vec![0u8; len];
            stream.read_exact(&mut body).await?;

            let resp = match serde_json::from_slice::<AdminRequest>(&body) {
                Ok(req) => self.handle(req).await,
                Err(e)  => AdminResponse::error(format!("bad request: {}", e)),
            };
            write_frame(&mut stream, &resp).await?;
        }
        Ok(())
    }

    pub async fn handle(&self, req: AdminRequest) -> AdminResponse {
        match req {
            AdminRequest::Status => match serde_json::to_value(self.service.get_status().await) {
                Ok(v)  => AdminResponse::data(v),
                Err(e) => AdminResponse::error(e.to_string()),
            },
            AdminRequest::Stats => AdminResponse::data(Value::String(self.service.print_current_stats().await)),
            AdminRequest::Reset => {
                self.service.reset_counters();
                AdminResponse::data(Value::String("counters reset".into()))
            }
            AdminRequest::Unban { account_id } => match self.service.bans().unban_user(&account_id) {
                Some(rec) => match serde_json::to_value(rec) {
                    Ok(v)  => AdminResponse::data(v),
                    Err(e) => AdminResponse::error(e.to_string()),
                },
                None => AdminResponse::error(format!("account {} is not banned", account_id)),
            },
        }
    }
}

pub async fn write_frame<T: Serialize>(stream: &mut TcpStream, msg: &T) -> Result<()> {
    let bytes = serde_json::to_vec(msg)?;
    stream.write_all(&(bytes.len() as u32).to_le_bytes()).await?;
    stream.write_all(&bytes).await?;
    Ok(())
}

pub async fn read_frame<T: for<'de> Deserialize<'de>>(stream: &mut TcpStream) -> Result<T> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME { anyhow::bail!("frame too large: {} bytes", len); }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}
