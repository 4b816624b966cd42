//! Wire-level constants and payloads shared by client and server.

use crate::session::SessionId;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Query parameter carrying the address token.
pub const TOKEN_PARAM: &str = "tkn";

/// WebSocket subprotocol requested by clients and accepted by servers.
pub const SUBPROTOCOL: &str = "tunnel-protocol";

/// Path segment under which long-poll sessions live.
pub const POLL_PATH: &str = "_httptunnel";

/// Response to a successful long-poll open request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollOpened {
    pub session: SessionId,
}

impl PollOpened {
    pub fn to_bytes(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Body of a rejected transport request: the reason as a JSON string.
pub fn rejection_body(reason: &str) -> String {
    // Serializing a &str cannot fail.
    serde_json::to_string(reason).unwrap_or_else(|_| format!("\"{}\"", reason))
}

/// Recover the reason from a rejection body, falling back to the raw text.
pub fn parse_rejection(body: &[u8]) -> String {
    serde_json::from_slice::<String>(body)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).trim().to_string())
}
