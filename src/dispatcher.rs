//! Call Dispatcher (§4.6): the Broker's single public entry point.

use crate::audit::Outcome;
use crate::config::{BrokerConfig, BrokerSettings, CallerPermissions, SecurityPolicy};
use crate::error::BrokerError;
use crate::policy::{Decision, PolicyEngine};
use crate::protocol::{extract_result, JsonRpcRequest, MockReply, RequestId};
use crate::registry::{Link, ServerRegistry};
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The Tool Broker. Owns the Server Registry, the Policy Engine, and the
/// monotonic request-ID counter that together back `invoke`. Construct one
/// per process; there is no ambient global state.
pub struct Broker {
    registry: Arc<ServerRegistry>,
    policy: PolicyEngine,
    settings: BrokerSettings,
    next_id: AtomicI64,
}

impl Broker {
    /// Build a Broker from static configuration. Call `start` to bring
    /// servers up before issuing calls.
    pub fn new(policy: SecurityPolicy, settings: BrokerSettings) -> Self {
        Self {
            registry: ServerRegistry::new(),
            policy: PolicyEngine::new(policy),
            settings,
            next_id: AtomicI64::new(1),
        }
    }

    /// Bring every configured server up concurrently (§4.1). Idempotent.
    pub async fn start(&self, configs: BrokerConfig) -> Result<(), BrokerError> {
        self.registry.initialize(configs, &self.settings).await
    }

    /// Tear every server down: terminate children, fail in-flight calls with
    /// `ServerClosed`, release all resources.
    pub async fn cleanup(&self) {
        self.registry.cleanup(&self.settings).await;
    }

    /// Read-only access to the audit ring, e.g. for an operator dashboard.
    pub fn audit(&self) -> &crate::audit::AuditRing {
        self.policy.audit()
    }

    /// Convert a sandbox binding's positional argument vector to a named
    /// parameter mapping (§4.7) and invoke the tool. Advisory only: unknown
    /// tools fall through to a generic `{arg0, arg1, ...}` mapping, and the
    /// server remains the ultimate authority on what it accepts.
    pub async fn invoke_positional(
        &self,
        server_name: &str,
        tool_name: &str,
        args: Vec<Value>,
        deadline: Duration,
    ) -> Result<Value, BrokerError> {
        let params = crate::argmap::map_arguments(tool_name, args);
        self.invoke(server_name, tool_name, params, deadline).await
    }

    /// `invoke_positional`, falling back to `settings.default_deadline`.
    pub async fn invoke_positional_default_deadline(
        &self,
        server_name: &str,
        tool_name: &str,
        args: Vec<Value>,
    ) -> Result<Value, BrokerError> {
        self.invoke_positional(server_name, tool_name, args, self.settings.default_deadline)
            .await
    }

    /// The single external entry point: invoke `tool_name` on `server_name`
    /// with `params`, bounded by `deadline`.
    pub async fn invoke(
        &self,
        server_name: &str,
        tool_name: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Value, BrokerError> {
        self.invoke_with_permissions(
            server_name,
            tool_name,
            params,
            deadline,
            &CallerPermissions::default(),
        )
        .await
    }

    /// `invoke`, falling back to `settings.default_deadline` (§4.6) for
    /// callers with no opinion on timeout.
    pub async fn invoke_default_deadline(
        &self,
        server_name: &str,
        tool_name: &str,
        params: Value,
    ) -> Result<Value, BrokerError> {
        self.invoke(server_name, tool_name, params, self.settings.default_deadline)
            .await
    }

    /// `invoke`, with explicit caller runtime permissions for Policy Engine
    /// step 3 (§4.5).
    pub async fn invoke_with_permissions(
        &self,
        server_name: &str,
        tool_name: &str,
        params: Value,
        deadline: Duration,
        caller: &CallerPermissions,
    ) -> Result<Value, BrokerError> {
        // 1. Resolve the instance.
        let Some(handle) = self.registry.get(server_name).await else {
            return Err(BrokerError::UnknownServer(server_name.to_string()));
        };

        if !handle.is_ready().await {
            return if self.settings.fallback_to_mock {
                Ok(serde_json::to_value(MockReply::new(
                    server_name,
                    tool_name,
                    params,
                    "server is not ready; returning a synthetic reply",
                ))?)
            } else {
                Err(BrokerError::ServerUnavailable(server_name.to_string()))
            };
        }

        // 2. Policy decision. Denials are always surfaced, never masked.
        let (decision, sanitized_params) =
            self.policy
                .evaluate(server_name, tool_name, &params, handle.class(), caller);
        let Decision::Allow = decision else {
            let Decision::Deny(reason) = decision else {
                unreachable!()
            };
            return Err(BrokerError::AccessDenied(reason));
        };

        // 3. Begin concurrency accounting. Guaranteed to be matched by
        // request_end on every exit path below.
        self.policy.request_begin(server_name);
        let started = Instant::now();

        let outcome = self
            .dispatch(&handle, tool_name, sanitized_params.clone(), deadline)
            .await;

        // 7. request_end on every path.
        self.policy.request_end(server_name);

        let duration = started.elapsed();
        match &outcome {
            Ok(_) => {
                self.policy.record_outcome(
                    server_name,
                    tool_name,
                    &sanitized_params,
                    Outcome::Success { duration },
                );
            }
            Err(err) => {
                self.policy.record_outcome(
                    server_name,
                    tool_name,
                    &sanitized_params,
                    Outcome::Error {
                        reason: err.to_string(),
                        duration,
                    },
                );
            }
        }

        outcome
    }

    async fn dispatch(
        &self,
        handle: &crate::registry::ServerHandle,
        tool_name: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Value, BrokerError> {
        let call_params = serde_json::json!({ "name": tool_name, "arguments": params });

        let link_guard = handle.link.read().await;
        let result = match &*link_guard {
            #[cfg(feature = "transport-stdio")]
            Some(Link::Stdio(stdio)) => {
                let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst));
                let request = JsonRpcRequest::new(id.clone(), "tools/call", call_params);

                let (tx, rx) = tokio::sync::oneshot::channel();
                handle.pending.lock().await.insert(id.clone(), tx);

                if let Err(err) = stdio.send(&request).await {
                    handle.pending.lock().await.remove(&id);
                    return Err(err);
                }

                match tokio::time::timeout(deadline, rx).await {
                    Ok(Ok(inner)) => inner,
                    Ok(Err(_)) => Err(BrokerError::ServerClosed),
                    Err(_) => {
                        handle.pending.lock().await.remove(&id);
                        Err(BrokerError::Timeout(deadline))
                    }
                }
            }
            #[cfg(feature = "transport-http")]
            Some(Link::Http(http)) => {
                let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst));
                let request = JsonRpcRequest::new(id, "tools/call", call_params);
                http.call(&request, deadline).await
            }
            None => Err(BrokerError::Transport("link not established".into())),
        };

        result.map(extract_result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn open_policy(server: &str) -> SecurityPolicy {
        let mut allowed_servers = HashSet::new();
        allowed_servers.insert(server.to_string());
        SecurityPolicy {
            allowed_servers,
            allowed_tools: std::collections::HashMap::new(),
            rate_limits: std::collections::HashMap::new(),
            payload: crate::config::PayloadPolicy::default(),
            audit_enabled: true,
        }
    }

    #[tokio::test]
    async fn unknown_server_is_rejected() {
        let broker = Broker::new(open_policy("srv"), BrokerSettings::default());
        let err = broker
            .invoke("ghost", "tool", serde_json::json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::UnknownServer(_)));
    }
}
