//! Wire vocabulary of the Janus JSON protocol and accessors over raw
//! envelopes.
//!
//! The protocol is open-ended: plugins attach arbitrary fields to every
//! message, so envelopes stay [`serde_json::Value`] end to end and only the
//! routing-relevant fragments get typed views here.

use serde::Deserialize;
use serde_json::Value;

/// Request verbs (`janus` field, client to server).
pub mod verb {
    pub const INFO: &str = "info";
    pub const CREATE: &str = "create";
    pub const DESTROY: &str = "destroy";
    pub const ATTACH: &str = "attach";
    pub const DETACH: &str = "detach";
    pub const KEEPALIVE: &str = "keepalive";
    pub const MESSAGE: &str = "message";
    pub const TRICKLE: &str = "trickle";
    pub const HANGUP: &str = "hangup";

    pub const LIST_SESSIONS: &str = "list_sessions";
    pub const LIST_HANDLES: &str = "list_handles";
    pub const HANDLE_INFO: &str = "handle_info";
    pub const START_PCAP: &str = "start_pcap";
    pub const STOP_PCAP: &str = "stop_pcap";
}

/// Response and notification verbs (`janus` field, server to client).
pub mod reply {
    pub const ACK: &str = "ack";
    pub const SUCCESS: &str = "success";
    pub const SERVER_INFO: &str = "server_info";
    pub const ERROR: &str = "error";
    pub const EVENT: &str = "event";
    pub const DETACHED: &str = "detached";
    pub const WEBRTCUP: &str = "webrtcup";
    pub const HANGUP: &str = "hangup";
    pub const MEDIA: &str = "media";
    pub const SLOWLINK: &str = "slowlink";
    pub const ICE_FAILED: &str = "ice-failed";
    pub const TRICKLE: &str = "trickle";
    pub const TIMEOUT: &str = "timeout";
}

/// WebSocket subprotocol announced during the handshake.
pub const WS_SUBPROTOCOL: &str = "janus-protocol";
/// WebSocket subprotocol for the admin endpoint.
pub const WS_ADMIN_SUBPROTOCOL: &str = "janus-admin-protocol";

/// `error` payload of a definitive error response.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiError {
    pub code: i64,
    pub reason: String,
}

pub fn janus(msg: &Value) -> Option<&str> {
    msg.get("janus").and_then(Value::as_str)
}

pub fn transaction(msg: &Value) -> Option<&str> {
    msg.get("transaction").and_then(Value::as_str)
}

pub fn session_id(msg: &Value) -> Option<u64> {
    msg.get("session_id").and_then(Value::as_u64)
}

pub fn sender(msg: &Value) -> Option<u64> {
    msg.get("sender").and_then(Value::as_u64)
}

/// A definitive response settles a transaction; an `ack` does not.
pub fn is_definitive(verb: &str) -> bool {
    matches!(verb, reply::SUCCESS | reply::SERVER_INFO | reply::ERROR)
}

pub fn api_error(msg: &Value) -> Option<ApiError> {
    msg.get("error")
        .cloned()
        .and_then(|e| serde_json::from_value(e).ok())
}

/// The `data.id` field carried by `create` and `attach` responses.
pub fn data_id(msg: &Value) -> Option<u64> {
    msg.get("data").and_then(|d| d.get("id")).and_then(Value::as_u64)
}

/// Build the error that settles a transaction closed by a definitive
/// `error` response.
pub(crate) fn error_of(msg: &Value) -> crate::errors::Error {
    match api_error(msg) {
        Some(err) => crate::errors::Error::Api {
            code: err.code,
            reason: err.reason,
        },
        None => crate::errors::Error::UnexpectedResponse("malformed error response".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_definitive_replies() {
        assert!(is_definitive(reply::SUCCESS));
        assert!(is_definitive(reply::SERVER_INFO));
        assert!(is_definitive(reply::ERROR));
        assert!(!is_definitive(reply::ACK));
        assert!(!is_definitive(reply::EVENT));
    }

    #[test]
    fn extracts_envelope_fields() {
        let msg = json!({
            "janus": "success",
            "transaction": "123",
            "session_id": 42,
            "sender": 7,
            "data": { "id": 99 }
        });
        assert_eq!(janus(&msg), Some("success"));
        assert_eq!(transaction(&msg), Some("123"));
        assert_eq!(session_id(&msg), Some(42));
        assert_eq!(sender(&msg), Some(7));
        assert_eq!(data_id(&msg), Some(99));
    }

    #[test]
    fn extracts_api_error() {
        let msg = json!({
            "janus": "error",
            "error": { "code": 458, "reason": "no such session" }
        });
        let err = api_error(&msg).unwrap();
        assert_eq!(err.code, 458);
        assert_eq!(err.reason, "no such session");
        assert!(api_error(&json!({ "janus": "ack" })).is_none());
    }
}
