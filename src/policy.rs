//! Policy Engine (§4.5): the ordered allow/deny pipeline every call passes
//! through before it reaches a server.

use crate::audit::{AuditEntry, AuditRing, Outcome};
use crate::config::{CallerPermissions, SecurityPolicy, ServerClass};
use once_cell::sync::Lazy;
use regex::{Regex, RegexSet};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Per-server sliding-window request counter plus a live concurrency count.
/// Invariants: `concurrency` never drops below zero; `window_start` resets
/// whenever more than 60 seconds have elapsed since it was last set.
#[derive(Debug)]
pub(crate) struct RateCounter {
    window_start: Instant,
    window_count: u32,
    concurrency: u32,
}

impl RateCounter {
    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            window_count: 0,
            concurrency: 0,
        }
    }

    /// Admit one request against `requests_per_minute`. Resets the window if
    /// stale, increments, and denies (without mutating the counter further)
    /// once the limit is exceeded.
    fn admit(&mut self, requests_per_minute: u32) -> bool {
        if self.window_start.elapsed() >= Duration::from_secs(60) {
            self.window_start = Instant::now();
            self.window_count = 0;
        }
        if self.window_count >= requests_per_minute {
            return false;
        }
        self.window_count += 1;
        true
    }

    fn has_capacity(&self, max_concurrent: u32) -> bool {
        self.concurrency < max_concurrent
    }

    fn begin(&mut self) {
        self.concurrency += 1;
    }

    fn end(&mut self) {
        self.concurrency = self.concurrency.saturating_sub(1);
    }
}

/// The outcome of evaluating a call against the security policy.
pub enum Decision {
    /// The call may proceed.
    Allow,
    /// The call is rejected with a human-readable reason.
    Deny(String),
}

static DENYLIST_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)<script\b",
        r"(?i)javascript:",
        r"(?i)data:text/html",
        r"(?i)vbscript:",
        r"(?i)\bon[a-z]+\s*=",
    ])
    .expect("denylist patterns are valid regexes")
});

/// The stripping counterpart of `DENYLIST_PATTERNS`, compiled once. Order
/// matches the `RegexSet` above.
static STRIP_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)<script\b[^>]*>.*?</script\s*>",
        r"(?i)javascript:",
        r"(?i)data:text/html[^\s\"']*",
        r"(?i)vbscript:",
        r"(?i)\bon[a-z]+\s*=\s*(\"[^\"]*\"|'[^']*'|[^\s>]+)",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("sanitization pattern is valid"))
    .collect()
});

const SENSITIVE_KEYS: [&str; 6] = ["password", "token", "secret", "key", "auth", "credential"];

/// Recursively strip denylisted script-injection constructs from every string
/// leaf in `value`.
pub(crate) fn sanitize(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(sanitize_string(s)),
        Value::Array(items) => Value::Array(items.iter().map(sanitize).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), sanitize(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn sanitize_string(s: &str) -> String {
    if !DENYLIST_PATTERNS.is_match(s) {
        return s.to_string();
    }
    let mut out = s.to_string();
    for re in STRIP_PATTERNS.iter() {
        out = re.replace_all(&out, "").to_string();
    }
    out
}

/// Recursively redact values under sensitive keys (case-insensitive match
/// against `password`, `token`, `secret`, `key`, `auth`, `credential`).
pub(crate) fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let lower = k.to_lowercase();
                    if SENSITIVE_KEYS.iter().any(|sensitive| lower.contains(sensitive)) {
                        (k.clone(), Value::String("[REDACTED]".to_string()))
                    } else {
                        (k.clone(), redact(v))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}

/// The Policy Engine: one instance per Broker, shared across servers.
pub struct PolicyEngine {
    policy: SecurityPolicy,
    rate_counters: Mutex<HashMap<String, RateCounter>>,
    audit: AuditRing,
}

impl PolicyEngine {
    /// Build a Policy Engine from static configuration.
    pub fn new(policy: SecurityPolicy) -> Self {
        Self {
            policy,
            rate_counters: Mutex::new(HashMap::new()),
            audit: AuditRing::new(),
        }
    }

    /// Access the audit ring (read-only snapshot access for callers/tests).
    pub fn audit(&self) -> &AuditRing {
        &self.audit
    }

    /// Run the ordered allow/deny pipeline (§4.5 steps 1-5) and log the
    /// decision to the audit ring.
    pub(crate) fn evaluate(
        &self,
        server_name: &str,
        tool_name: &str,
        params: &Value,
        class: ServerClass,
        caller: &CallerPermissions,
    ) -> (Decision, Value) {
        let decision = self.evaluate_inner(server_name, tool_name, params, class, caller);
        // By the time a call reaches Allow, sanitize(params) == params (a
        // mismatch would have produced a Deny at step 5), so the original
        // params are already the sanitized form.
        let sanitized_params = params.clone();

        if self.policy.audit_enabled {
            let outcome = match &decision {
                Decision::Allow => None,
                Decision::Deny(reason) => Some(Outcome::Denied {
                    reason: reason.clone(),
                }),
            };
            if let Some(outcome) = outcome {
                self.audit.push(AuditEntry::new(
                    server_name,
                    tool_name,
                    redact(&sanitized_params),
                    outcome,
                ));
            }
        }

        (decision, sanitized_params)
    }

    fn evaluate_inner(
        &self,
        server_name: &str,
        tool_name: &str,
        params: &Value,
        class: ServerClass,
        caller: &CallerPermissions,
    ) -> Decision {
        // 1. Server allow-list.
        if !self.policy.allowed_servers.contains(server_name) {
            return Decision::Deny(format!("server '{server_name}' is not allow-listed"));
        }

        // 2. Tool allow-list.
        if let Some(allowlist) = self.policy.allowed_tools.get(server_name) {
            if !allowlist.permits(tool_name) {
                return Decision::Deny(format!(
                    "tool '{tool_name}' is not allow-listed for server '{server_name}'"
                ));
            }
        }

        // 3. Runtime permissions.
        match class {
            ServerClass::ExternalNetwork => {
                if caller.network_allowed_hosts.is_empty() {
                    return Decision::Deny(
                        "caller has no allowed network hosts for an external-network server"
                            .to_string(),
                    );
                }
            }
            ServerClass::LocalFile => {
                let mentions_file_io = ["file", "read", "write"]
                    .iter()
                    .any(|kw| tool_name.to_lowercase().contains(kw));
                if mentions_file_io
                    && caller.fs_read_allowed.is_empty()
                    && caller.fs_write_allowed.is_empty()
                {
                    return Decision::Deny(
                        "caller has no filesystem permissions for a local-file server"
                            .to_string(),
                    );
                }
            }
            ServerClass::Unclassified => {}
        }

        // 4. Rate limit, then concurrency. Rate is checked first so a
        // flooded-but-idle server reports "rate exceeded" rather than
        // "concurrency exceeded".
        let limits = self.policy.rate_limit_for(server_name);
        let mut counters = self.rate_counters.lock().expect("rate counter mutex poisoned");
        let counter = counters
            .entry(server_name.to_string())
            .or_insert_with(RateCounter::new);

        if !counter.admit(limits.requests_per_minute) {
            return Decision::Deny("rate exceeded".to_string());
        }
        if !counter.has_capacity(limits.max_concurrent) {
            return Decision::Deny("rate exceeded".to_string());
        }
        drop(counters);

        // 5. Payload validation and sanitization.
        let encoded = match serde_json::to_vec(params) {
            Ok(bytes) => bytes,
            Err(err) => return Decision::Deny(format!("params could not be encoded: {err}")),
        };
        if encoded.len() > self.policy.payload.max_bytes {
            return Decision::Deny(format!(
                "payload of {} bytes exceeds the {}-byte limit",
                encoded.len(),
                self.policy.payload.max_bytes
            ));
        }
        if self.policy.payload.sanitize_strings {
            let sanitized = sanitize(params);
            if &sanitized != params {
                return Decision::Deny("unsafe content".to_string());
            }
        }

        Decision::Allow
    }

    /// Record concurrency admission for `server_name`. Called by the
    /// Dispatcher after a call is accepted.
    pub(crate) fn request_begin(&self, server_name: &str) {
        let mut counters = self.rate_counters.lock().expect("rate counter mutex poisoned");
        counters
            .entry(server_name.to_string())
            .or_insert_with(RateCounter::new)
            .begin();
    }

    /// Release concurrency for `server_name`. Called on every exit path of
    /// `invoke`, never letting the counter underflow.
    pub(crate) fn request_end(&self, server_name: &str) {
        let mut counters = self.rate_counters.lock().expect("rate counter mutex poisoned");
        if let Some(counter) = counters.get_mut(server_name) {
            counter.end();
        }
    }

    /// Record a completed call's final outcome (success or error) to the
    /// audit ring, distinct from the accept/deny logging in `evaluate`.
    pub(crate) fn record_outcome(
        &self,
        server_name: &str,
        tool_name: &str,
        params: &Value,
        outcome: Outcome,
    ) {
        if !self.policy.audit_enabled {
            return;
        }
        self.audit.push(AuditEntry::new(
            server_name,
            tool_name,
            redact(params),
            outcome,
        ));
    }
}
