//! Handshake & Discovery (§4.4): the `initialize` / `initialized` / `tools/list`
//! exchange that must succeed before a server is promoted to `ready`.

use crate::config::BrokerSettings;
use crate::error::BrokerError;
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, RequestId, ToolSchema};
use crate::registry::{Link, ServerHandle};
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

static HANDSHAKE_ID: AtomicI64 = AtomicI64::new(1);

const PROTOCOL_VERSION: &str = "2024-11-05";
const CLIENT_NAME: &str = "tool-broker";
const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Run the handshake against an already-connected server. Only promotes to
/// `ready` (via the caller, in `ServerRegistry::bring_up`) if `initialize`
/// succeeds; tool discovery failure is logged but non-fatal.
pub(crate) async fn run(handle: &ServerHandle, settings: BrokerSettings) -> Result<(), BrokerError> {
    initialize(handle, settings.connection_timeout).await?;
    send_initialized_notification(handle).await?;

    tokio::time::sleep(settings.settle_delay).await;

    if let Err(err) = discover_tools(handle, settings.connection_timeout).await {
        tracing::warn!(server = %handle.name, error = %err, "tool discovery failed, continuing without schemas");
    }

    Ok(())
}

async fn initialize(handle: &ServerHandle, timeout: Duration) -> Result<(), BrokerError> {
    let params = serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": { "tools": {} },
        "clientInfo": { "name": CLIENT_NAME, "version": CLIENT_VERSION },
    });
    let _ = request(handle, "initialize", params, timeout).await?;
    Ok(())
}

async fn send_initialized_notification(handle: &ServerHandle) -> Result<(), BrokerError> {
    let notification = JsonRpcNotification::new("notifications/initialized", Value::Null);
    match &*handle.link.read().await {
        #[cfg(feature = "transport-stdio")]
        Some(Link::Stdio(stdio)) => stdio.send_frame(&notification).await,
        #[cfg(feature = "transport-http")]
        Some(Link::Http(_)) => {
            // HTTP servers have no standing connection to notify over; the
            // next request carries equivalent context. Nothing to do here.
            Ok(())
        }
        None => Err(BrokerError::Transport("link not established".into())),
    }
}

async fn discover_tools(handle: &ServerHandle, timeout: Duration) -> Result<(), BrokerError> {
    let result = request(handle, "tools/list", Value::Null, timeout).await?;
    let tools: Vec<ToolSchema> = result
        .get("tools")
        .cloned()
        .map(serde_json::from_value)
        .transpose()?
        .unwrap_or_default();

    let mut cache = handle.tools.write().await;
    for tool in tools {
        cache.insert(tool.name.clone(), tool);
    }
    Ok(())
}

async fn request(
    handle: &ServerHandle,
    method: &str,
    params: Value,
    timeout: Duration,
) -> Result<Value, BrokerError> {
    match &*handle.link.read().await {
        #[cfg(feature = "transport-stdio")]
        Some(Link::Stdio(stdio)) => {
            let id = RequestId::Number(HANDSHAKE_ID.fetch_add(1, Ordering::SeqCst));
            let request = JsonRpcRequest::new(id.clone(), method, params);

            let (tx, rx) = tokio::sync::oneshot::channel();
            handle.pending.lock().await.insert(id, tx);

            stdio.send(&request).await?;

            tokio::time::timeout(timeout, rx)
                .await
                .map_err(|_| BrokerError::Timeout(timeout))?
                .map_err(|_| BrokerError::ServerClosed)?
        }
        #[cfg(feature = "transport-http")]
        Some(Link::Http(http)) => {
            let id = RequestId::Number(HANDSHAKE_ID.fetch_add(1, Ordering::SeqCst));
            let request = JsonRpcRequest::new(id, method, params);
            http.call(&request, timeout).await
        }
        None => Err(BrokerError::Transport("link not established".into())),
    }
}
