//! The audit ring (§3, §4.5): a bounded in-memory history of admitted and
//! denied calls. Process-scoped, lost on restart, carried in the Broker
//! handle rather than a global.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Maximum number of entries the ring retains; the oldest is evicted once
/// this is exceeded.
pub const RING_CAPACITY: usize = 1000;

/// The result of one call as recorded to the audit ring.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum Outcome {
    /// The call reached the server and returned a result.
    Success {
        /// Wall-clock time from `invoke` to resolution.
        #[serde(with = "humantime_serde")]
        duration: Duration,
    },
    /// The Policy Engine rejected the call before dispatch.
    Denied {
        /// The reason the Policy Engine gave.
        reason: String,
    },
    /// The call reached dispatch but failed (timeout, transport, remote).
    Error {
        /// The failure, rendered as a display string.
        reason: String,
        /// Wall-clock time from `invoke` to resolution.
        #[serde(with = "humantime_serde")]
        duration: Duration,
    },
}

/// One entry in the audit ring.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Unix epoch seconds when the entry was recorded.
    pub timestamp: i64,
    /// A short tag identifying the runtime build, for cross-referencing logs.
    pub runtime_tag: &'static str,
    /// The server the call targeted.
    pub server_name: String,
    /// The tool the call targeted.
    pub tool_name: String,
    /// The call's parameters, with sensitive keys replaced by `"[REDACTED]"`.
    pub redacted_params: Value,
    /// How the call resolved.
    pub outcome: Outcome,
}

impl AuditEntry {
    pub(crate) fn new(
        server_name: impl Into<String>,
        tool_name: impl Into<String>,
        redacted_params: Value,
        outcome: Outcome,
    ) -> Self {
        Self {
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0),
            runtime_tag: env!("CARGO_PKG_VERSION"),
            server_name: server_name.into(),
            tool_name: tool_name.into(),
            redacted_params,
            outcome,
        }
    }

    /// The reason given, if this entry is not a success.
    pub fn reason(&self) -> Option<&str> {
        match &self.outcome {
            Outcome::Success { .. } => None,
            Outcome::Denied { reason } | Outcome::Error { reason, .. } => Some(reason),
        }
    }
}

/// Bounded in-memory history of admitted and denied calls. Contention is
/// acceptable: each admission produces at most one entry, so the single
/// mutex is never held for long.
pub struct AuditRing {
    entries: Mutex<VecDeque<AuditEntry>>,
}

impl AuditRing {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(RING_CAPACITY)),
        }
    }

    pub(crate) fn push(&self, entry: AuditEntry) {
        let mut entries = self.entries.lock().expect("audit ring mutex poisoned");
        if entries.len() >= RING_CAPACITY {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// A snapshot of the current ring contents, oldest first.
    pub fn snapshot(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .expect("audit ring mutex poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Number of entries currently retained.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("audit ring mutex poisoned").len()
    }

    /// Whether the ring is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_evicts_oldest_beyond_capacity() {
        let ring = AuditRing::new();
        for i in 0..RING_CAPACITY + 10 {
            ring.push(AuditEntry::new(
                "srv",
                "tool",
                serde_json::json!({"i": i}),
                Outcome::Denied {
                    reason: "test".to_string(),
                },
            ));
        }
        assert_eq!(ring.len(), RING_CAPACITY);
        let snapshot = ring.snapshot();
        assert_eq!(snapshot[0].redacted_params["i"], serde_json::json!(10));
    }

    #[test]
    fn reason_is_none_for_success() {
        let entry = AuditEntry::new(
            "srv",
            "tool",
            serde_json::json!({}),
            Outcome::Success {
                duration: Duration::from_millis(5),
            },
        );
        assert!(entry.reason().is_none());
    }

    #[test]
    fn reason_is_present_for_denied_and_error() {
        let denied = AuditEntry::new(
            "srv",
            "tool",
            serde_json::json!({}),
            Outcome::Denied {
                reason: "rate exceeded".to_string(),
            },
        );
        assert_eq!(denied.reason(), Some("rate exceeded"));

        let errored = AuditEntry::new(
            "srv",
            "tool",
            serde_json::json!({}),
            Outcome::Error {
                reason: "timeout".to_string(),
                duration: Duration::from_millis(200),
            },
        );
        assert_eq!(errored.reason(), Some("timeout"));
    }
}
