//! Transport Driver, HTTP flavor (§4.3): each call is one POST-and-await. There
//! is no long-lived correlation table — the Dispatcher still enforces
//! timeouts and concurrency, but matching replies to requests is just
//! matching a future to its call.

use crate::error::BrokerError;
use crate::protocol::JsonRpcRequest;
use serde_json::Value;
use std::time::Duration;

/// A configured HTTP server the Broker assumes is already listening.
pub(crate) struct HttpLink {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpLink {
    /// Build a client against `base_url`. The Broker POSTs the JSON-RPC
    /// envelope to `{base_url}/jsonrpc`.
    pub(crate) fn new(base_url: &str) -> Result<Self, BrokerError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| BrokerError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: format!("{}/jsonrpc", base_url.trim_end_matches('/')),
        })
    }

    /// POST the request and await the decoded response body, bounded by
    /// `deadline`.
    pub(crate) async fn call(
        &self,
        request: &JsonRpcRequest,
        deadline: Duration,
    ) -> Result<Value, BrokerError> {
        let send = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .json(request)
            .send();

        let response = tokio::time::timeout(deadline, send)
            .await
            .map_err(|_| BrokerError::Timeout(deadline))?
            .map_err(|e| BrokerError::Transport(format!("HTTP request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BrokerError::Transport(format!(
                "HTTP {}: {body}",
                status.as_u16()
            )));
        }

        let parsed: crate::protocol::JsonRpcResponse = tokio::time::timeout(
            deadline,
            response.json(),
        )
        .await
        .map_err(|_| BrokerError::Timeout(deadline))?
        .map_err(|e| BrokerError::ProtocolError(format!("failed to parse response: {e}")))?;

        if let Some(err) = parsed.error {
            return Err(BrokerError::RemoteError {
                code: err.code,
                message: err.message,
            });
        }
        Ok(parsed.result.unwrap_or(Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RequestId;

    #[test]
    fn endpoint_url_strips_trailing_slash() {
        let link = HttpLink::new("https://api.example.com/").unwrap();
        assert_eq!(link.endpoint, "https://api.example.com/jsonrpc");
    }

    #[tokio::test]
    async fn call_parses_success_response() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/jsonrpc")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"jsonrpc":"2.0","id":1,"result":{"ok":true}}"#)
            .create_async()
            .await;

        let link = HttpLink::new(&server.url()).unwrap();
        let request = JsonRpcRequest::new(RequestId::Number(1), "tools/call", serde_json::json!({}));
        let result = link.call(&request, Duration::from_secs(5)).await.unwrap();
        assert_eq!(result, serde_json::json!({"ok": true}));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn call_surfaces_remote_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/jsonrpc")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"nope"}}"#)
            .create_async()
            .await;

        let link = HttpLink::new(&server.url()).unwrap();
        let request = JsonRpcRequest::new(RequestId::Number(1), "tools/call", serde_json::json!({}));
        let err = link.call(&request, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, BrokerError::RemoteError { code: -32601, .. }));
    }
}
