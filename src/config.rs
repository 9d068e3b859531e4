//! Static configuration the Broker consumes (§3, §6). Never emitted, only parsed.

use crate::error::BrokerError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Runtime-permission classification of a server, used by Policy Engine step 3.
/// Part of static configuration, not inferred at runtime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerClass {
    /// Reaches third-party network APIs.
    ExternalNetwork,
    /// Operates on the local workspace filesystem.
    LocalFile,
    /// Neither of the above; no extra runtime-permission check applies.
    #[default]
    Unclassified,
}

/// Static description of one tool server.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum ServerConfig {
    /// A subprocess speaking newline-delimited JSON-RPC over stdio.
    Stdio {
        /// Server name, unique within a `BrokerConfig`.
        #[serde(skip)]
        name: String,
        /// Executable to launch.
        command: String,
        /// Arguments to pass.
        #[serde(default)]
        arguments: Vec<String>,
        /// Environment variables merged onto the Broker's own environment.
        #[serde(default)]
        environment: HashMap<String, String>,
        /// Runtime-permission classification.
        #[serde(default)]
        class: ServerClass,
    },
    /// A server already listening for HTTP POSTs.
    Http {
        /// Server name, unique within a `BrokerConfig`.
        #[serde(skip)]
        name: String,
        /// Base URL of the server.
        base_url: String,
        /// Runtime-permission classification.
        #[serde(default)]
        class: ServerClass,
    },
}

impl ServerConfig {
    /// The server's configured name.
    pub fn name(&self) -> &str {
        match self {
            Self::Stdio { name, .. } | Self::Http { name, .. } => name,
        }
    }

    /// The server's runtime-permission classification.
    pub fn class(&self) -> ServerClass {
        match self {
            Self::Stdio { class, .. } | Self::Http { class, .. } => *class,
        }
    }
}

/// A mapping of server name to its static configuration, as loaded from a host-
/// provided source (file or in-memory). The Broker parses only this schema.
pub type BrokerConfig = HashMap<String, ServerConfig>;

/// Parse a `BrokerConfig` from YAML, filling in each entry's `name` field from its key.
pub fn load_broker_config(yaml: &str) -> Result<BrokerConfig, BrokerError> {
    let mut configs: BrokerConfig =
        serde_yaml::from_str(yaml).map_err(|e| BrokerError::Config(e.to_string()))?;
    for (name, config) in configs.iter_mut() {
        match config {
            ServerConfig::Stdio { name: n, .. } | ServerConfig::Http { name: n, .. } => {
                *n = name.clone();
            }
        }
    }
    Ok(configs)
}

/// Read and parse a `BrokerConfig` from a YAML file on disk.
pub fn load_broker_config_file(path: impl AsRef<Path>) -> Result<BrokerConfig, BrokerError> {
    let contents = std::fs::read_to_string(path).map_err(BrokerError::from)?;
    load_broker_config(&contents)
}

/// Per-server (or `default`) rate and concurrency limits.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RateLimit {
    /// Requests admitted per 60-second window.
    pub requests_per_minute: u32,
    /// Maximum calls in flight at once.
    pub max_concurrent: u32,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            max_concurrent: 4,
        }
    }
}

/// Allow-listed tools for one server: either an explicit set or "anything goes".
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolAllowlist {
    /// `"*"` in configuration.
    Wildcard(WildcardMarker),
    /// An explicit set of tool names.
    Explicit(HashSet<String>),
}

/// Marker type matching the literal string `"*"` during deserialization.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WildcardMarker;

impl TryFrom<String> for WildcardMarker {
    type Error = String;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value == "*" {
            Ok(Self)
        } else {
            Err(format!("expected wildcard marker \"*\", got {value:?}"))
        }
    }
}

impl From<WildcardMarker> for String {
    fn from(_: WildcardMarker) -> Self {
        "*".to_string()
    }
}

impl ToolAllowlist {
    /// Whether `tool` is permitted under this allow-list.
    pub fn permits(&self, tool: &str) -> bool {
        match self {
            Self::Wildcard(_) => true,
            Self::Explicit(set) => set.contains(tool),
        }
    }
}

/// Payload validation and sanitization policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PayloadPolicy {
    /// Maximum encoded length of `params`, in bytes.
    pub max_bytes: usize,
    /// Whether to recursively strip script-injection constructs from string leaves.
    #[serde(default)]
    pub sanitize_strings: bool,
}

impl Default for PayloadPolicy {
    fn default() -> Self {
        Self {
            max_bytes: 64 * 1024,
            sanitize_strings: true,
        }
    }
}

/// Configuration consumed by the Policy Engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SecurityPolicy {
    /// Servers the caller is permitted to reach at all.
    pub allowed_servers: HashSet<String>,
    /// Per-server tool allow-lists.
    #[serde(default)]
    pub allowed_tools: HashMap<String, ToolAllowlist>,
    /// Per-server (or `default`) rate/concurrency limits.
    #[serde(default)]
    pub rate_limits: HashMap<String, RateLimit>,
    /// Payload size and sanitization policy.
    #[serde(default)]
    pub payload: PayloadPolicy,
    /// Whether admitted and denied calls are recorded to the audit ring.
    #[serde(default = "default_true")]
    pub audit_enabled: bool,
}

fn default_true() -> bool {
    true
}

impl SecurityPolicy {
    /// Effective rate limit for `server`: its own entry, or the `default` entry, or
    /// the built-in default.
    pub fn rate_limit_for(&self, server: &str) -> RateLimit {
        self.rate_limits
            .get(server)
            .or_else(|| self.rate_limits.get("default"))
            .copied()
            .unwrap_or_default()
    }
}

/// The caller-supplied runtime permissions evaluated at Policy Engine step 3.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CallerPermissions {
    /// Hosts the caller may reach via external-network servers.
    #[serde(default)]
    pub network_allowed_hosts: Vec<String>,
    /// Paths the caller may read via local-file servers.
    #[serde(default)]
    pub fs_read_allowed: Vec<String>,
    /// Paths the caller may write via local-file servers.
    #[serde(default)]
    pub fs_write_allowed: Vec<String>,
}

/// Broker-wide behavioral settings not tied to any one server.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct BrokerSettings {
    /// How long `initialize()` waits for a server to become `ready`.
    #[serde(with = "humantime_serde", default = "default_connection_timeout")]
    pub connection_timeout: Duration,
    /// Default deadline for `invoke` calls that don't specify one.
    #[serde(with = "humantime_serde", default = "default_deadline")]
    pub default_deadline: Duration,
    /// Delay between `notifications/initialized` and `tools/list`, to accommodate
    /// servers that prepare tool registries asynchronously post-handshake.
    #[serde(with = "humantime_serde", default = "default_settle_delay")]
    pub settle_delay: Duration,
    /// Grace period `cleanup()` waits for a child to exit before killing it.
    #[serde(with = "humantime_serde", default = "default_shutdown_grace")]
    pub shutdown_grace: Duration,
    /// Whether unavailable servers degrade to `MockReply` instead of raising.
    #[serde(default = "default_true")]
    pub fallback_to_mock: bool,
}

fn default_connection_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_deadline() -> Duration {
    Duration::from_secs(30)
}

fn default_settle_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(3)
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            connection_timeout: default_connection_timeout(),
            default_deadline: default_deadline(),
            settle_delay: default_settle_delay(),
            shutdown_grace: default_shutdown_grace(),
            fallback_to_mock: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stdio_and_http_servers() {
        let yaml = r#"
calculator:
  transport: stdio
  command: calc-server
  arguments: ["--quiet"]
  class: local-file
weather:
  transport: http
  base_url: "http://localhost:9000"
  class: external-network
"#;
        let config = load_broker_config(yaml).unwrap();
        assert_eq!(config.len(), 2);
        let calc = &config["calculator"];
        assert_eq!(calc.name(), "calculator");
        assert_eq!(calc.class(), ServerClass::LocalFile);
        match calc {
            ServerConfig::Stdio { command, arguments, .. } => {
                assert_eq!(command, "calc-server");
                assert_eq!(arguments, &vec!["--quiet".to_string()]);
            }
            _ => panic!("expected stdio config"),
        }
        assert_eq!(config["weather"].class(), ServerClass::ExternalNetwork);
    }

    #[test]
    fn wildcard_allowlist_permits_anything() {
        let allow: ToolAllowlist = serde_json::from_value(serde_json::json!("*")).unwrap();
        assert!(allow.permits("anything"));
    }

    #[test]
    fn explicit_allowlist_restricts() {
        let allow: ToolAllowlist =
            serde_json::from_value(serde_json::json!(["store", "read"])).unwrap();
        assert!(allow.permits("store"));
        assert!(!allow.permits("delete"));
    }

    #[test]
    fn rate_limit_falls_back_to_default_entry() {
        let mut policy = SecurityPolicy {
            allowed_servers: HashSet::new(),
            allowed_tools: HashMap::new(),
            rate_limits: HashMap::new(),
            payload: PayloadPolicy::default(),
            audit_enabled: true,
        };
        policy.rate_limits.insert(
            "default".to_string(),
            RateLimit {
                requests_per_minute: 10,
                max_concurrent: 2,
            },
        );
        let limit = policy.rate_limit_for("unlisted-server");
        assert_eq!(limit.requests_per_minute, 10);
        assert_eq!(limit.max_concurrent, 2);
    }
}
