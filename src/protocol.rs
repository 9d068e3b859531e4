//! JSON-RPC 2.0 framing for the Tool Protocol.
//!
//! Exactly one JSON value per line, UTF-8, no pretty-printing. Request/response/
//! notification envelopes follow JSON-RPC 2.0; `tools/list` and `tools/call` layer
//! MCP-shaped semantics on top.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC 2.0 request/response ID.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RequestId {
    /// String ID.
    String(String),
    /// Numeric ID.
    Number(i64),
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s}"),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Error code.
    pub code: i32,
    /// Error message.
    pub message: String,
    /// Optional additional data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    /// Parse error (-32700).
    pub fn parse_error(msg: impl Into<String>) -> Self {
        Self {
            code: -32700,
            message: msg.into(),
            data: None,
        }
    }

    /// Method not found (-32601).
    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: -32601,
            message: format!("Method not found: {method}"),
            data: None,
        }
    }
}

/// JSON-RPC 2.0 request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Protocol version (always "2.0").
    pub jsonrpc: String,
    /// Request ID.
    pub id: RequestId,
    /// Method name.
    pub method: String,
    /// Method parameters.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl JsonRpcRequest {
    /// Create a new request.
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Protocol version (always "2.0").
    pub jsonrpc: String,
    /// Request ID this is responding to.
    pub id: RequestId,
    /// Result (on success).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error (on failure).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Create a success response.
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response.
    pub fn error(id: RequestId, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// JSON-RPC 2.0 notification (no ID, no response expected).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    /// Protocol version.
    pub jsonrpc: String,
    /// Method name.
    pub method: String,
    /// Parameters.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl JsonRpcNotification {
    /// Create a new notification.
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params,
        }
    }
}

/// A value on the wire that is either a response or a notification. Tool servers speak
/// both over the same stream, so the reader must tell them apart before routing.
#[derive(Debug)]
pub enum InboundFrame {
    /// A response carrying an `id` that should match a `PendingCall`.
    Response(JsonRpcResponse),
    /// A notification (no `id`); the core Broker has no handler for these today.
    Notification(JsonRpcNotification),
}

/// Classify a raw JSON line as a response or a notification.
///
/// Returns `None` if the frame is neither (e.g. a request sent the wrong direction).
pub fn classify_frame(value: Value) -> Option<InboundFrame> {
    let has_id = value.get("id").is_some();
    let has_result_or_error = value.get("result").is_some() || value.get("error").is_some();
    if has_id && has_result_or_error {
        return serde_json::from_value(value).ok().map(InboundFrame::Response);
    }
    if !has_id && value.get("method").is_some() {
        return serde_json::from_value(value).ok().map(InboundFrame::Notification);
    }
    None
}

/// Advisory schema for a discovered tool. `input_shape` is whatever JSON Schema (or
/// schema-shaped object) the server reported; the Broker never validates against it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolSchema {
    /// Tool name.
    pub name: String,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema for input parameters, as reported by the server.
    #[serde(default, rename = "inputSchema")]
    pub input_shape: Value,
}

/// A content block in a `tools/call` result.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    /// Text content.
    #[serde(rename = "text")]
    Text {
        /// The text content.
        text: String,
    },
    /// Image content (base64).
    #[serde(rename = "image")]
    Image {
        /// Base64-encoded image data.
        data: String,
        /// MIME type.
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    /// Resource reference.
    #[serde(rename = "resource")]
    Resource {
        /// Resource URI.
        uri: String,
        /// Optional MIME type.
        #[serde(rename = "mimeType", skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
}

/// A synthetic reply produced by the Dispatcher when a server is unavailable and the
/// Broker is in degraded (`fallback_to_mock`) mode.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MockReply {
    /// Always `true`; lets callers detect a degraded response structurally.
    pub mocked: bool,
    /// The server that was unavailable.
    pub server: String,
    /// The tool that would have been called.
    pub tool: String,
    /// The parameters that would have been sent.
    pub params_echo: Value,
    /// A human-readable note explaining the degradation.
    pub note: String,
}

impl MockReply {
    pub(crate) fn new(server: &str, tool: &str, params: Value, note: impl Into<String>) -> Self {
        Self {
            mocked: true,
            server: server.to_string(),
            tool: tool.to_string(),
            params_echo: params,
            note: note.into(),
        }
    }
}

/// Extract the effective result payload from a successful `tools/call` response: if
/// the result carries a structured `content` array of blocks, concatenate the text
/// blocks; otherwise return the raw `result` verbatim.
pub fn extract_result(result: Value) -> Value {
    let Some(content) = result.get("content").and_then(Value::as_array) else {
        return result;
    };

    let mut text = String::new();
    for block in content {
        if block.get("type").and_then(Value::as_str) == Some("text") {
            if let Some(t) = block.get("text").and_then(Value::as_str) {
                if !text.is_empty() {
                    text.push('\n');
                }
                text.push_str(t);
            }
        }
    }

    if text.is_empty() {
        result
    } else {
        Value::String(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serialization() {
        let req = JsonRpcRequest::new(1i64, "tools/call", serde_json::json!({"name": "echo"}));
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"method\":\"tools/call\""));
    }

    #[test]
    fn response_success_and_error() {
        let ok = JsonRpcResponse::success(RequestId::Number(1), serde_json::json!({"ok": true}));
        assert!(ok.result.is_some() && ok.error.is_none());

        let err = JsonRpcResponse::error(RequestId::Number(1), JsonRpcError::method_not_found("x"));
        assert!(err.result.is_none());
        assert_eq!(err.error.unwrap().code, -32601);
    }

    #[test]
    fn classify_response_vs_notification() {
        let resp = serde_json::json!({"jsonrpc":"2.0","id":1,"result":{"ok":true}});
        assert!(matches!(classify_frame(resp), Some(InboundFrame::Response(_))));

        let notif = serde_json::json!({"jsonrpc":"2.0","method":"progress","params":{}});
        assert!(matches!(classify_frame(notif), Some(InboundFrame::Notification(_))));

        let request = serde_json::json!({"jsonrpc":"2.0","id":1,"method":"tools/call"});
        assert!(classify_frame(request).is_none());
    }

    #[test]
    fn extract_result_concatenates_text_blocks() {
        let result = serde_json::json!({
            "content": [
                {"type": "text", "text": "hello"},
                {"type": "text", "text": "world"}
            ]
        });
        assert_eq!(extract_result(result), serde_json::json!("hello\nworld"));
    }

    #[test]
    fn extract_result_passes_through_raw() {
        let result = serde_json::json!({"ok": true});
        assert_eq!(extract_result(result.clone()), result);
    }
}
