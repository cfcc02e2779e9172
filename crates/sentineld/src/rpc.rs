//! Newline-delimited JSON-RPC 2.0 over a local Unix stream socket.
//!
//! One connection per client, one request at a time per connection. A
//! client that disconnects mid-session implicitly cancels any session it
//! started. Requests without an id are notifications and get no response.

use std::path::Path;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use crate::service::SentinelService;

/// Group read/write; clients join the daemon's group to connect.
const SOCKET_MODE: u32 = 0o660;

pub const PARSE_ERROR: i64 = -32700;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    #[allow(dead_code)]
    pub jsonrpc: Option<String>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    pub id: Option<Value>,
}

pub fn rpc_result(id: &Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "result": result, "id": id })
}

pub fn rpc_error(id: &Value, code: i64, message: &str) -> Value {
    json!({ "jsonrpc": "2.0", "error": { "code": code, "message": message }, "id": id })
}

/// Process one request line. Returns `None` for notifications.
pub async fn handle_line(service: &SentinelService, conn_id: u64, line: &str) -> Option<Value> {
    let request: RpcRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(_) => return Some(rpc_error(&Value::Null, PARSE_ERROR, "Parse error")),
    };

    let id = request.id?;

    debug!(method = %request.method, "rpc request");
    match service.dispatch(conn_id, &request.method, request.params).await {
        Ok(result) => Some(rpc_result(&id, result)),
        Err(DispatchError::MethodNotFound) => Some(rpc_error(
            &id,
            METHOD_NOT_FOUND,
            &format!("Method '{}' not found", request.method),
        )),
        Err(DispatchError::Internal(message)) => {
            Some(rpc_error(&id, INTERNAL_ERROR, &message))
        }
    }
}

/// Dispatch-level failures. Application failures travel inside `result`
/// as `{success: false, error: ...}` instead.
pub enum DispatchError {
    MethodNotFound,
    Internal(String),
}

/// Bind the control socket and serve clients until the task is aborted.
pub async fn serve(socket_path: &Path, service: std::sync::Arc<SentinelService>) -> std::io::Result<()> {
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::remove_file(socket_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let listener = UnixListener::bind(socket_path)?;
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(SOCKET_MODE);
        if let Err(e) = std::fs::set_permissions(socket_path, perms) {
            warn!(error = %e, "could not set socket permissions");
        }
    }

    info!(socket = %socket_path.display(), "control socket listening");

    let mut next_conn_id: u64 = 0;
    loop {
        let (stream, _addr) = listener.accept().await?;
        next_conn_id += 1;
        let conn_id = next_conn_id;
        let service = std::sync::Arc::clone(&service);
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, conn_id, &service).await {
                debug!(conn_id, error = %e, "client handler ended");
            }
            // A client that vanishes mid-session cancels what it started.
            service.handle_disconnect(conn_id).await;
        });
    }
}

async fn handle_client(
    stream: UnixStream,
    conn_id: u64,
    service: &SentinelService,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(response) = handle_line(service, conn_id, line).await {
            let mut out = serde_json::to_vec(&response)?;
            out.push(b'\n');
            write_half.write_all(&out).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_parses_minimal() {
        let request: RpcRequest =
            serde_json::from_str(r#"{"method": "status", "id": 1}"#).unwrap();
        assert_eq!(request.method, "status");
        assert_eq!(request.id, Some(json!(1)));
        assert!(request.params.is_null());
    }

    #[test]
    fn test_request_parses_params() {
        let request: RpcRequest = serde_json::from_str(
            r#"{"jsonrpc": "2.0", "method": "start_authentication", "params": {"user": "alex"}, "id": "a"}"#,
        )
        .unwrap();
        assert_eq!(request.params["user"], json!("alex"));
    }

    #[test]
    fn test_result_envelope() {
        let v = rpc_result(&json!(7), json!({"success": true}));
        assert_eq!(v["jsonrpc"], "2.0");
        assert_eq!(v["id"], json!(7));
        assert_eq!(v["result"]["success"], json!(true));
    }

    #[test]
    fn test_error_envelope() {
        let v = rpc_error(&Value::Null, PARSE_ERROR, "Parse error");
        assert_eq!(v["error"]["code"], json!(PARSE_ERROR));
        assert!(v["id"].is_null());
    }
}
