//! JSON RPC surface
//!
//! Requests are single JSON objects `{"method": ..., "params": {...}}`,
//! one per line on the daemon's unix socket. Every reply is a JSON object;
//! failures are reported as `{"error": "..."}` rather than transport errors
//! so the web UI can display them verbatim.

use crate::core::config_store::ListName;
use crate::core::error::{Error, Result};
use crate::core::tickets::Ticket;
use crate::service::Service;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

/// A request line.
#[derive(Debug, Deserialize)]
pub struct Request {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Deserialize)]
struct AddTicketParams {
    addr: String,
    duration: Value,
    #[serde(default)]
    comment: String,
}

#[derive(Deserialize)]
struct AddrParams {
    addr: String,
}

#[derive(Deserialize)]
struct NameParams {
    name: String,
}

#[derive(Deserialize)]
struct SetConfigParams {
    name: String,
    content: String,
}

/// Method table in the format rpcd expects from `list`.
pub fn methods_signature() -> Value {
    json!({
        "add_ticket": { "addr": "str", "duration": 32, "comment": "str" },
        "delete_ticket": { "addr": "str" },
        "get_tickets": {},
        "get_nft_sets": {},
        "process_config": { "name": "str" },
        "get_config": { "name": "str" },
        "set_config": { "name": "str", "content": "str" },
    })
}

/// Client-facing ticket view. Carries the address under both `ether` and
/// `addr` for older UI code that only knows MAC tickets.
pub fn ticket_json(ticket: &Ticket, now: DateTime<Utc>) -> Value {
    let addr = ticket.address.to_string();
    json!({
        "ether": addr,
        "addr": addr,
        "expires": ticket.remaining_secs(now),
        "timeout": ticket.duration_secs,
        "comment": ticket.comment,
    })
}

fn params<T: DeserializeOwned>(value: &Value) -> Result<T> {
    let value = if value.is_null() { json!({}) } else { value.clone() };
    Ok(serde_json::from_value(value)?)
}

/// Accepts the duration as a JSON integer or a decimal string.
fn duration_param(value: &Value) -> Result<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| Error::InvalidDuration(n.to_string())),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| Error::InvalidDuration(s.clone())),
        other => Err(Error::InvalidDuration(other.to_string())),
    }
}

async fn call(service: &Arc<Service>, method: &str, raw: &Value) -> Result<Value> {
    match method {
        "add_ticket" => {
            let p: AddTicketParams = params(raw)?;
            let duration = duration_param(&p.duration)?;
            let ticket = service.add_ticket(&p.addr, duration, &p.comment).await?;
            Ok(json!({ "ticket": ticket_json(&ticket, service.now()) }))
        }
        "delete_ticket" => {
            let p: AddrParams = params(raw)?;
            service.delete_ticket(&p.addr).await?;
            Ok(json!({}))
        }
        "get_tickets" => {
            let now = service.now();
            let tickets: Vec<Value> = service
                .tickets()
                .await
                .iter()
                .map(|t| ticket_json(t, now))
                .collect();
            Ok(json!({ "tickets": tickets }))
        }
        "get_nft_sets" => Ok(service.live_sets().await?.to_json()),
        "process_config" => {
            let p: NameParams = params(raw)?;
            service.process_config(ListName::parse(&p.name)?).await?;
            Ok(json!({}))
        }
        "get_config" => {
            let p: NameParams = params(raw)?;
            let content = service.get_config(ListName::parse(&p.name)?).await?;
            Ok(json!({ "content": content }))
        }
        "set_config" => {
            let p: SetConfigParams = params(raw)?;
            service
                .set_config(ListName::parse(&p.name)?, &p.content)
                .await?;
            Ok(json!({}))
        }
        other => Err(Error::Internal(format!("Unknown method: {other}"))),
    }
}

/// Runs one method call and folds any failure into an `{"error"}` reply.
pub async fn dispatch(service: &Arc<Service>, method: &str, params: &Value) -> Value {
    match call(service, method, params).await {
        Ok(reply) => reply,
        Err(e) => {
            debug!("{method} failed: {e}");
            json!({ "error": e.to_string() })
        }
    }
}

/// Handles one request line.
pub async fn handle_line(service: &Arc<Service>, line: &str) -> Value {
    match serde_json::from_str::<Request>(line) {
        Ok(request) => dispatch(service, &request.method, &request.params).await,
        Err(e) => json!({ "error": format!("Malformed request: {e}") }),
    }
}

async fn serve_connection(service: Arc<Service>, stream: UnixStream) -> std::io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = handle_line(&service, &line).await;
        let mut out = serde_json::to_vec(&reply)?;
        out.push(b'\n');
        write.write_all(&out).await?;
    }
    Ok(())
}

/// Binds the RPC socket and serves connections forever.
///
/// A stale socket file left by a previous run is replaced. The socket is
/// restricted to its owner.
pub async fn serve(service: Arc<Service>, socket_path: &Path) -> Result<()> {
    match tokio::fs::remove_file(socket_path).await {
        Ok(()) => debug!("Removed stale socket {}", socket_path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let listener = UnixListener::bind(socket_path)?;
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    info!("RPC listening on {}", socket_path.display());

    loop {
        let (stream, _) = listener.accept().await?;
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            if let Err(e) = serve_connection(service, stream).await {
                warn!("RPC connection error: {e}");
            }
        });
    }
}

/// Sends one request to a running daemon and returns its reply.
pub async fn call_daemon(socket_path: &Path, method: &str, params: Value) -> Result<Value> {
    let stream = UnixStream::connect(socket_path).await?;
    let (read, mut write) = stream.into_split();

    let mut line = serde_json::to_vec(&json!({ "method": method, "params": params }))?;
    line.push(b'\n');
    write.write_all(&line).await?;
    write.shutdown().await?;

    let mut lines = BufReader::new(read).lines();
    match lines.next_line().await? {
        Some(reply) => Ok(serde_json::from_str(&reply)?),
        None => Err(Error::Internal("daemon closed the connection without replying".to_string())),
    }
}
