//! Error taxonomy surfaced to the Dispatcher's caller (§7).

use crate::protocol::RequestId;

/// Failures the Call Dispatcher can return from `invoke`.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Server not `ready` and no fallback configured.
    #[error("server '{0}' is not available")]
    ServerUnavailable(String),

    /// The Policy Engine rejected the call. Never auto-retried.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Token bucket or concurrency cap exceeded.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Deadline expired before a reply arrived.
    #[error("call timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The child process exited with the call in flight.
    #[error("server '{server}' exited (code {code:?}) while request {request_id} was in flight")]
    ServerExited {
        /// The server whose child exited.
        server: String,
        /// Process exit code, if one could be determined.
        code: Option<i32>,
        /// The request that was abandoned.
        request_id: RequestId,
    },

    /// The Broker initiated shutdown with the call in flight.
    #[error("broker is shutting down")]
    ServerClosed,

    /// The server returned a JSON-RPC `error` object, surfaced verbatim.
    #[error("remote error {code}: {message}")]
    RemoteError {
        /// JSON-RPC error code.
        code: i32,
        /// JSON-RPC error message.
        message: String,
    },

    /// A frame could not be parsed or was otherwise malformed.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// The server is not known to this Broker instance.
    #[error("unknown server '{0}'")]
    UnknownServer(String),

    /// Static configuration could not be parsed or was internally inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport-level IO failure not attributable to a specific pending call.
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<std::io::Error> for BrokerError {
    fn from(e: std::io::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(e: serde_json::Error) -> Self {
        Self::ProtocolError(e.to_string())
    }
}
