//! Transport Driver (§4.2, §4.3): per-server subprocess or HTTP client,
//! framed JSON-RPC in, framed JSON-RPC out.

#[cfg(feature = "transport-stdio")]
pub(crate) mod stdio;

#[cfg(feature = "transport-http")]
pub(crate) mod http;
