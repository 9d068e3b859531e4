//! Minimal example wiring a stdio tool server through the Broker.
//!
//! Run with a real MCP-style server on PATH, e.g.:
//!   cargo run --example echo -- /path/to/echo-server

use std::collections::HashSet;
use std::time::Duration;
use tool_broker::{load_broker_config, Broker, BrokerSettings, SecurityPolicy};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let command = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "echo-server".to_string());

    let yaml = format!("echo:\n  transport: stdio\n  command: \"{command}\"\n");
    let configs = load_broker_config(&yaml)?;

    let mut allowed_servers = HashSet::new();
    allowed_servers.insert("echo".to_string());
    let policy = SecurityPolicy {
        allowed_servers,
        allowed_tools: Default::default(),
        rate_limits: Default::default(),
        payload: Default::default(),
        audit_enabled: true,
    };

    let broker = Broker::new(policy, BrokerSettings::default());
    broker.start(configs).await?;

    let result = broker
        .invoke(
            "echo",
            "echo",
            serde_json::json!({"text": "hello from the broker"}),
            Duration::from_secs(5),
        )
        .await?;
    println!("{result}");

    for entry in broker.audit().snapshot() {
        println!("audit: {} {} -> {:?}", entry.server_name, entry.tool_name, entry.outcome);
    }

    broker.cleanup().await;
    Ok(())
}
