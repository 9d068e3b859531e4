//! End-to-end tests driving the Broker against a fake stdio tool server.
//!
//! The server is a small Python3 script written to a temp dir and chmod'd
//! executable, speaking the same `initialize` / `tools/list` / `tools/call`
//! exchange a real MCP-style server would.

use std::collections::HashSet;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;
use tool_broker::{load_broker_config, Broker, BrokerError, BrokerSettings, SecurityPolicy};

const FAKE_SERVER: &str = r#"#!/usr/bin/env python3
import json
import sys
import time

def send(payload):
    sys.stdout.write(json.dumps(payload) + "\n")
    sys.stdout.flush()

for line in sys.stdin:
    if not line.strip():
        continue
    msg = json.loads(line)
    method = msg.get("method")
    if method == "initialize":
        send({"jsonrpc": "2.0", "id": msg.get("id"), "result": {"ready": True}})
    elif method == "notifications/initialized":
        continue
    elif method == "tools/list":
        send({"jsonrpc": "2.0", "id": msg.get("id"), "result": {"tools": [
            {"name": "echo", "description": "echoes input"}
        ]}})
    elif method == "tools/call":
        params = msg.get("params", {})
        name = params.get("name")
        args = params.get("arguments", {})
        if name == "echo":
            send({"jsonrpc": "2.0", "id": msg.get("id"), "result": {
                "content": [{"type": "text", "text": "echo: " + str(args.get("text", ""))}]
            }})
        elif name == "slow":
            time.sleep(2)
            send({"jsonrpc": "2.0", "id": msg.get("id"), "result": {"content": []}})
        elif name == "crash":
            sys.exit(1)
        else:
            send({"jsonrpc": "2.0", "id": msg.get("id"), "error": {"code": -32601, "message": "unknown tool"}})
    elif method == "shutdown":
        send({"jsonrpc": "2.0", "id": msg.get("id"), "result": {"ok": True}})
        break
    elif method == "exit":
        break
"#;

fn write_fake_server() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("fake-tool-server");
    fs::write(&path, FAKE_SERVER).expect("write fake server script");
    let mut perms = fs::metadata(&path).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).expect("chmod");
    (dir, path)
}

fn policy_for(server: &str) -> SecurityPolicy {
    let mut allowed_servers = HashSet::new();
    allowed_servers.insert(server.to_string());
    SecurityPolicy {
        allowed_servers,
        allowed_tools: Default::default(),
        rate_limits: Default::default(),
        payload: Default::default(),
        audit_enabled: true,
    }
}

#[tokio::test]
async fn happy_path_stdio_call_round_trips() {
    let (_dir, script) = write_fake_server();
    let yaml = format!("tool:\n  transport: stdio\n  command: \"{}\"\n", script.display());
    let configs = load_broker_config(&yaml).unwrap();

    let broker = Broker::new(policy_for("tool"), BrokerSettings::default());
    broker.start(configs).await.unwrap();

    let result = broker
        .invoke(
            "tool",
            "echo",
            serde_json::json!({"text": "hi"}),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

    assert_eq!(result, serde_json::json!("echo: hi"));
    broker.cleanup().await;
}

#[tokio::test]
async fn concurrency_cap_rejects_the_second_in_flight_call() {
    let (_dir, script) = write_fake_server();
    let yaml = format!("tool:\n  transport: stdio\n  command: \"{}\"\n", script.display());
    let configs = load_broker_config(&yaml).unwrap();

    let mut policy = policy_for("tool");
    policy.rate_limits.insert(
        "tool".to_string(),
        tool_broker::RateLimit {
            requests_per_minute: 60,
            max_concurrent: 1,
        },
    );

    let broker = std::sync::Arc::new(Broker::new(policy, BrokerSettings::default()));
    broker.start(configs).await.unwrap();

    let first = {
        let broker = broker.clone();
        tokio::spawn(async move {
            broker
                .invoke("tool", "slow", serde_json::json!({}), Duration::from_secs(5))
                .await
        })
    };

    // Give the first call time to pass the policy check and begin dispatch
    // before the second one is evaluated.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = broker
        .invoke("tool", "echo", serde_json::json!({"text": "x"}), Duration::from_secs(5))
        .await;

    assert!(matches!(second, Err(BrokerError::AccessDenied(_))));

    let first = first.await.unwrap();
    assert!(first.is_ok());

    broker.cleanup().await;
}

#[tokio::test]
async fn slow_tool_call_times_out() {
    let (_dir, script) = write_fake_server();
    let yaml = format!("tool:\n  transport: stdio\n  command: \"{}\"\n", script.display());
    let configs = load_broker_config(&yaml).unwrap();

    let broker = Broker::new(policy_for("tool"), BrokerSettings::default());
    broker.start(configs).await.unwrap();

    let result = broker
        .invoke("tool", "slow", serde_json::json!({}), Duration::from_millis(100))
        .await;

    assert!(matches!(result, Err(BrokerError::Timeout(_))));
    broker.cleanup().await;
}

#[tokio::test]
async fn unsafe_payload_is_denied_before_dispatch() {
    let (_dir, script) = write_fake_server();
    let yaml = format!("tool:\n  transport: stdio\n  command: \"{}\"\n", script.display());
    let configs = load_broker_config(&yaml).unwrap();

    let broker = Broker::new(policy_for("tool"), BrokerSettings::default());
    broker.start(configs).await.unwrap();

    let result = broker
        .invoke(
            "tool",
            "echo",
            serde_json::json!({"text": "<script>alert(1)</script>"}),
            Duration::from_secs(5),
        )
        .await;

    assert!(matches!(result, Err(BrokerError::AccessDenied(_))));
    broker.cleanup().await;
}

#[tokio::test]
async fn unreachable_server_falls_back_to_mock() {
    let yaml = "tool:\n  transport: stdio\n  command: \"/nonexistent-binary-xyz-not-real\"\n";
    let configs = load_broker_config(yaml).unwrap();

    let broker = Broker::new(policy_for("tool"), BrokerSettings::default());
    // fallback_to_mock is true by default, so a failed spawn must not fail start().
    broker.start(configs).await.unwrap();

    let result = broker
        .invoke("tool", "echo", serde_json::json!({"text": "hi"}), Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(result["mocked"], serde_json::json!(true));
    assert_eq!(result["server"], serde_json::json!("tool"));
    broker.cleanup().await;
}

#[tokio::test]
async fn server_crash_in_flight_surfaces_server_exited() {
    let (_dir, script) = write_fake_server();
    let yaml = format!("tool:\n  transport: stdio\n  command: \"{}\"\n", script.display());
    let configs = load_broker_config(&yaml).unwrap();

    let broker = Broker::new(policy_for("tool"), BrokerSettings::default());
    broker.start(configs).await.unwrap();

    let result = broker
        .invoke("tool", "crash", serde_json::json!({}), Duration::from_secs(5))
        .await;

    assert!(matches!(result, Err(BrokerError::ServerExited { .. })));
    broker.cleanup().await;
}
