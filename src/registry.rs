//! Server Registry (§4.1): owns every configured server's runtime state from
//! startup to teardown.
//!
//! A `ServerHandle` is referenced both by the `ServerRegistry` and by its reader
//! task. To avoid a reference cycle the reader task never holds the handle
//! directly — it carries only the server's name and re-resolves through the
//! registry on every frame (§9 Design Notes).

use crate::config::{BrokerConfig, BrokerSettings, ServerClass, ServerConfig};
use crate::error::BrokerError;
use crate::protocol::{RequestId, ToolSchema};
#[cfg(feature = "transport-http")]
use crate::transport::http::HttpLink;
#[cfg(feature = "transport-stdio")]
use crate::transport::stdio::StdioLink;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::time::Instant;

/// Lifecycle state of a `ServerHandle`. `Error` and `Stopped` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerStatus {
    /// Transport is being established and the handshake has not completed.
    Starting,
    /// Handshake succeeded; the server accepts calls.
    Ready,
    /// The transport failed or the child exited. No automatic restart.
    Error,
    /// Torn down by `cleanup()`.
    Stopped,
}

/// Per-server transport link, established by the Transport Driver.
pub(crate) enum Link {
    #[cfg(feature = "transport-stdio")]
    Stdio(StdioLink),
    #[cfg(feature = "transport-http")]
    Http(HttpLink),
}

/// The oneshot a caller waits on for a stdio reply, keyed by `request_id` in
/// `ServerHandle::pending`.
pub(crate) type ReplySender = oneshot::Sender<Result<Value, BrokerError>>;

/// Runtime state for one configured server. Owned exclusively by the Registry.
pub struct ServerHandle {
    /// The server's configured name.
    pub name: String,
    /// The server's static configuration.
    pub config: ServerConfig,
    status: RwLock<ServerStatus>,
    /// Tool schemas discovered during the handshake, keyed by tool name.
    pub tools: RwLock<HashMap<String, ToolSchema>>,
    last_heartbeat: RwLock<Option<Instant>>,
    /// In-flight stdio calls awaiting a reply, keyed by `request_id`. Mutated
    /// from two directions (callers inserting, reader removing) and so lives
    /// behind its own mutex.
    pub(crate) pending: Mutex<HashMap<RequestId, ReplySender>>,
    pub(crate) link: RwLock<Option<Link>>,
}

impl ServerHandle {
    fn new(name: String, config: ServerConfig) -> Self {
        Self {
            name,
            config,
            status: RwLock::new(ServerStatus::Starting),
            tools: RwLock::new(HashMap::new()),
            last_heartbeat: RwLock::new(None),
            pending: Mutex::new(HashMap::new()),
            link: RwLock::new(None),
        }
    }

    /// Current lifecycle state.
    pub async fn status(&self) -> ServerStatus {
        *self.status.read().await
    }

    pub(crate) async fn set_status(&self, status: ServerStatus) {
        *self.status.write().await = status;
    }

    pub(crate) async fn touch_heartbeat(&self) {
        *self.last_heartbeat.write().await = Some(Instant::now());
    }

    /// The server's runtime-permission classification.
    pub fn class(&self) -> ServerClass {
        self.config.class()
    }

    /// Whether the server is in `ready` state and can accept calls.
    pub async fn is_ready(&self) -> bool {
        self.status().await == ServerStatus::Ready
    }

    /// Fail every outstanding `PendingCall` with the same error and clear the
    /// pending table. Used on child exit and on shutdown.
    pub(crate) async fn drain_pending(&self, make_error: impl Fn(RequestId) -> BrokerError) {
        let mut pending = self.pending.lock().await;
        for (id, tx) in pending.drain() {
            let _ = tx.send(Err(make_error(id)));
        }
    }
}

/// Owns every configured server's `ServerHandle` from `initialize` to `cleanup`.
pub struct ServerRegistry {
    servers: RwLock<HashMap<String, Arc<ServerHandle>>>,
    initialized: RwLock<bool>,
}

impl ServerRegistry {
    /// An empty registry. Call `initialize` to bring servers up.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            servers: RwLock::new(HashMap::new()),
            initialized: RwLock::new(false),
        })
    }

    /// Look up a server's handle by name.
    pub async fn get(&self, name: &str) -> Option<Arc<ServerHandle>> {
        self.servers.read().await.get(name).cloned()
    }

    /// Whether `name` is a known, `ready` server.
    pub async fn is_ready(&self, name: &str) -> bool {
        match self.get(name).await {
            Some(handle) => handle.is_ready().await,
            None => false,
        }
    }

    /// Bring every configured server up concurrently. Idempotent: a second
    /// call on an already-initialized registry is a no-op.
    pub async fn initialize(
        self: &Arc<Self>,
        configs: BrokerConfig,
        settings: &BrokerSettings,
    ) -> Result<(), BrokerError> {
        if *self.initialized.read().await {
            return Ok(());
        }

        let mut starts = Vec::new();
        for (name, config) in configs {
            let handle = Arc::new(ServerHandle::new(name.clone(), config));
            self.servers
                .write()
                .await
                .insert(name.clone(), handle.clone());
            starts.push(tokio::spawn(self.clone().start_one(handle, *settings)));
        }

        let mut results = Vec::with_capacity(starts.len());
        for task in starts {
            results.push(task.await.expect("start_one task panicked"));
        }
        *self.initialized.write().await = true;

        if settings.fallback_to_mock {
            for (name, result) in results {
                if let Err(err) = result {
                    tracing::warn!(server = %name, error = %err, "server failed to start; remaining in error state");
                }
            }
            Ok(())
        } else {
            for (name, result) in results {
                result.map_err(|e| {
                    BrokerError::Config(format!("server '{name}' failed to start: {e}"))
                })?;
            }
            Ok(())
        }
    }

    async fn start_one(
        self: Arc<Self>,
        handle: Arc<ServerHandle>,
        settings: BrokerSettings,
    ) -> (String, Result<(), BrokerError>) {
        let name = handle.name.clone();
        let result = tokio::time::timeout(
            settings.connection_timeout,
            self.bring_up(handle.clone(), settings),
        )
        .await
        .unwrap_or(Err(BrokerError::Config(format!(
            "server '{name}' did not become ready within {:?}",
            settings.connection_timeout
        ))));

        if let Err(ref err) = result {
            tracing::error!(server = %name, error = %err, "server initialization failed");
            handle.set_status(ServerStatus::Error).await;
        }
        (name, result)
    }

    async fn bring_up(
        self: Arc<Self>,
        handle: Arc<ServerHandle>,
        settings: BrokerSettings,
    ) -> Result<(), BrokerError> {
        let link = match &handle.config {
            #[cfg(feature = "transport-stdio")]
            ServerConfig::Stdio {
                command,
                arguments,
                environment,
                ..
            } => {
                let stdio = StdioLink::spawn(
                    handle.name.clone(),
                    command,
                    arguments,
                    environment,
                    self.clone(),
                )
                .await?;
                Link::Stdio(stdio)
            }
            #[cfg(feature = "transport-http")]
            ServerConfig::Http { base_url, .. } => Link::Http(HttpLink::new(base_url)?),
            #[allow(unreachable_patterns)]
            other => {
                return Err(BrokerError::Config(format!(
                    "server '{}' requires a transport feature ({}) that is not compiled in",
                    handle.name,
                    match other {
                        ServerConfig::Stdio { .. } => "transport-stdio",
                        ServerConfig::Http { .. } => "transport-http",
                    }
                )));
            }
        };
        *handle.link.write().await = Some(link);

        crate::handshake::run(&handle, settings).await?;
        handle.set_status(ServerStatus::Ready).await;
        handle.touch_heartbeat().await;
        tracing::info!(server = %handle.name, "server ready");
        Ok(())
    }

    /// Tear every server down: terminate stdio children (with a grace period
    /// before a forced kill), fail outstanding calls with `ServerClosed`, and
    /// mark every instance `Stopped`.
    pub async fn cleanup(&self, settings: &BrokerSettings) {
        let handles: Vec<_> = self.servers.read().await.values().cloned().collect();
        for handle in handles {
            handle
                .drain_pending(|_| BrokerError::ServerClosed)
                .await;

            #[cfg(feature = "transport-stdio")]
            if let Some(Link::Stdio(stdio)) = handle.link.write().await.take() {
                stdio.shutdown(settings.shutdown_grace).await;
            }
            handle.set_status(ServerStatus::Stopped).await;
        }
        tracing::info!("registry cleanup complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerClass;
    use std::collections::HashMap as StdHashMap;

    #[tokio::test]
    async fn unknown_server_is_not_ready() {
        let registry = ServerRegistry::new();
        assert!(!registry.is_ready("nope").await);
    }

    #[tokio::test]
    async fn handle_starts_in_starting_status() {
        let handle = ServerHandle::new(
            "srv".to_string(),
            ServerConfig::Http {
                name: "srv".to_string(),
                base_url: "http://localhost:1".to_string(),
                class: ServerClass::Unclassified,
            },
        );
        assert_eq!(handle.status().await, ServerStatus::Starting);
        assert!(!handle.is_ready().await);
    }

    #[tokio::test]
    async fn drain_pending_resolves_every_entry_once() {
        let handle = ServerHandle::new(
            "srv".to_string(),
            ServerConfig::Http {
                name: "srv".to_string(),
                base_url: "http://localhost:1".to_string(),
                class: ServerClass::Unclassified,
            },
        );
        let mut receivers = StdHashMap::new();
        for i in 0..3i64 {
            let (tx, rx) = oneshot::channel();
            handle.pending.lock().await.insert(RequestId::Number(i), tx);
            receivers.insert(i, rx);
        }
        handle.drain_pending(|_| BrokerError::ServerClosed).await;
        assert!(handle.pending.lock().await.is_empty());
        for (_, rx) in receivers {
            assert!(rx.await.unwrap().is_err());
        }
    }
}
