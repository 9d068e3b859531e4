//! `tool-broker` — mediated access to external JSON-RPC tool servers.
//!
//! A secure code-execution gateway lets sandboxed agent code call out to
//! external *tool servers* that speak a small JSON-RPC protocol over stdio or
//! HTTP. This crate is the subsystem that owns those servers' subprocess
//! life-cycle, multiplexes concurrent calls over each server's one stream,
//! enforces an allow-list/rate-limit/payload policy, and degrades to
//! synthetic replies when a server is unavailable.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐    ┌────────────────┐    ┌───────────────┐    ┌─────────────┐
//! │ Sandbox code ├───▶│ Call Dispatcher├───▶│ Policy Engine │    │ Server      │
//! └──────────────┘    │  (invoke)      │    │ (allow/deny,  │    │ Registry    │
//!                      └───────┬────────┘    │  rate limit)  │◀───┤ (lifecycle) │
//!                              │             └───────────────┘    └──────┬──────┘
//!                              ▼                                         │
//!                      ┌────────────────┐                                ▼
//!                      │ Transport      │                         ┌─────────────┐
//!                      │ (stdio / http) │────────────────────────▶│ Tool Server │
//!                      └────────────────┘                         └─────────────┘
//! ```
//!
//! 1. **Policy-first**: every call passes an ordered allow/deny pipeline
//!    before it reaches a server.
//! 2. **Auditable**: every admitted or denied call lands in a bounded
//!    in-memory ring, with sensitive parameters redacted.
//! 3. **Degradable**: an unavailable server yields a `MockReply` instead of
//!    an error when the Broker is configured for it — denials and timeouts
//!    are the exception and are always surfaced.
//!
//! # Example
//!
//! ```rust,no_run
//! use tool_broker::{Broker, BrokerSettings, SecurityPolicy};
//! use std::collections::HashSet;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut allowed_servers = HashSet::new();
//! allowed_servers.insert("calculator".to_string());
//!
//! let policy = SecurityPolicy {
//!     allowed_servers,
//!     allowed_tools: Default::default(),
//!     rate_limits: Default::default(),
//!     payload: Default::default(),
//!     audit_enabled: true,
//! };
//!
//! let broker = Broker::new(policy, BrokerSettings::default());
//! let configs = tool_broker::load_broker_config("calculator:\n  transport: stdio\n  command: calc-server\n")?;
//! broker.start(configs).await?;
//!
//! let result = broker
//!     .invoke("calculator", "add", serde_json::json!({"a": 1, "b": 2}), Duration::from_secs(5))
//!     .await?;
//! println!("{result}");
//!
//! broker.cleanup().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - `transport-stdio` (default): subprocess transport over stdin/stdout.
//! - `transport-http` (default): HTTP transport for servers already
//!   listening.

#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod argmap;
pub mod audit;
pub mod config;
mod dispatcher;
mod error;
mod handshake;
mod policy;
pub mod protocol;
mod registry;
mod transport;

pub use audit::{AuditEntry, AuditRing, Outcome};
pub use config::{
    load_broker_config, load_broker_config_file, BrokerConfig, BrokerSettings, CallerPermissions,
    PayloadPolicy, RateLimit, SecurityPolicy, ServerClass, ServerConfig, ToolAllowlist,
};
pub use dispatcher::Broker;
pub use error::BrokerError;
pub use protocol::{ContentBlock, JsonRpcRequest, JsonRpcResponse, MockReply, RequestId, ToolSchema};
pub use registry::ServerStatus;
