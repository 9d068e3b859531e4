//! Transport Driver, stdio flavor (§4.2): one reader task and one writer lock
//! per server, talking newline-delimited JSON-RPC over a child process's
//! stdin/stdout.

use crate::error::BrokerError;
use crate::protocol::{classify_frame, InboundFrame, JsonRpcRequest};
use crate::registry::{Link, ServerRegistry, ServerStatus};
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStderr, ChildStdout, Command};
use tokio::sync::Mutex;

/// Live stdio connection to one server's child process.
pub(crate) struct StdioLink {
    writer: Mutex<ChildStdin>,
    child: Arc<Mutex<Child>>,
    reader_task: tokio::task::JoinHandle<()>,
}

impl StdioLink {
    /// Spawn the child, wire up its stdio, and start the reader task.
    ///
    /// The reader task captures only `name` and a clone of `registry` — never
    /// the `ServerHandle` itself — so it re-resolves the server on every frame
    /// instead of holding a reference that would outlive the handle's owner.
    pub(crate) async fn spawn(
        name: String,
        command: &str,
        arguments: &[String],
        environment: &HashMap<String, String>,
        registry: Arc<ServerRegistry>,
    ) -> Result<Self, BrokerError> {
        let mut cmd = Command::new(command);
        cmd.args(arguments)
            .envs(environment)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| BrokerError::Transport(format!("failed to spawn '{command}': {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BrokerError::Transport("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BrokerError::Transport("child stdout unavailable".into()))?;
        let stderr = child.stderr.take();

        let child = Arc::new(Mutex::new(child));

        if let Some(stderr) = stderr {
            tokio::spawn(stderr_task(name.clone(), stderr));
        }

        let reader_task = tokio::spawn(reader_task(name, stdout, registry, child.clone()));

        Ok(Self {
            writer: Mutex::new(stdin),
            child,
            reader_task,
        })
    }

    /// Write one framed request under the per-server writer lock. Concurrent
    /// callers serialize here; the lock is held for the duration of the
    /// JSON-plus-newline write, per §5.
    pub(crate) async fn send(&self, request: &JsonRpcRequest) -> Result<(), BrokerError> {
        self.send_frame(request).await
    }

    /// Write any serializable JSON-RPC frame (used for notifications, which
    /// carry no `id` and so aren't a `JsonRpcRequest`).
    pub(crate) async fn send_frame<T: serde::Serialize>(
        &self,
        frame: &T,
    ) -> Result<(), BrokerError> {
        let mut line = serde_json::to_vec(frame)?;
        line.push(b'\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Best-effort terminate, then a grace period, then a forced kill.
    pub(crate) async fn shutdown(self, grace: Duration) {
        self.reader_task.abort();
        let mut child = self.child.lock().await;
        if let Some(id) = child.id() {
            tracing::debug!(pid = id, "sending terminate to child");
        }
        let _ = child.start_kill();
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                let _ = child.kill().await;
            }
        }
    }
}

async fn reader_task(
    name: String,
    stdout: ChildStdout,
    registry: Arc<ServerRegistry>,
    child: Arc<Mutex<Child>>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                let value: Value = match serde_json::from_str(&line) {
                    Ok(v) => v,
                    Err(err) => {
                        tracing::warn!(server = %name, error = %err, "failed to parse frame as JSON");
                        continue;
                    }
                };
                handle_frame(&name, &registry, value).await;
            }
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(server = %name, error = %err, "error reading child stdout");
                break;
            }
        }
    }

    let exit_code = child
        .lock()
        .await
        .try_wait()
        .ok()
        .flatten()
        .and_then(|status| status.code());

    tracing::info!(server = %name, code = ?exit_code, "child exited");

    if let Some(handle) = registry.get(&name).await {
        handle.set_status(ServerStatus::Error).await;
        let server = name.clone();
        handle
            .drain_pending(move |request_id| BrokerError::ServerExited {
                server: server.clone(),
                code: exit_code,
                request_id,
            })
            .await;
    }
}

async fn handle_frame(name: &str, registry: &Arc<ServerRegistry>, value: Value) {
    let Some(frame) = classify_frame(value) else {
        tracing::warn!(server = %name, "received malformed frame, neither response nor notification");
        return;
    };

    match frame {
        InboundFrame::Response(response) => {
            let Some(handle) = registry.get(name).await else {
                return;
            };
            let sender = handle.pending.lock().await.remove(&response.id);
            let Some(sender) = sender else {
                tracing::debug!(server = %name, id = %response.id, "late reply dropped, no matching pending call");
                return;
            };
            let outcome = match response.error {
                Some(err) => Err(BrokerError::RemoteError {
                    code: err.code,
                    message: err.message,
                }),
                None => Ok(response.result.unwrap_or(Value::Null)),
            };
            let _ = sender.send(outcome);
        }
        InboundFrame::Notification(notification) => {
            tracing::debug!(server = %name, method = %notification.method, "notification received, no handler registered");
        }
    }
}

async fn stderr_task(name: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(server = %name, stderr = %line, "child stderr");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RequestId;

    #[test]
    fn request_framing_is_single_line() {
        let request = JsonRpcRequest::new(1i64, "tools/call", serde_json::json!({"a": 1}));
        let mut line = serde_json::to_vec(&request).unwrap();
        line.push(b'\n');
        assert_eq!(line.iter().filter(|b| **b == b'\n').count(), 1);
    }

    #[test]
    fn request_id_matches_roundtrip() {
        let id = RequestId::Number(42);
        assert_eq!(id.to_string(), "42");
    }
}
