use std::io;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Error vocabulary for the whole client runtime.
///
/// Server-side protocol failures surface as [`Error::Api`], which displays as
/// `"<code> <reason>"` so callers can match on the gateway's error codes
/// without re-parsing the envelope.
#[derive(Debug, Error)]
pub enum Error {
    #[error("request must be a JSON object")]
    InvalidRequest,
    #[error("missing required argument: {0}")]
    MissingArgument(&'static str),
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
    #[error("{code} {reason}")]
    Api { code: i64, reason: String },
    #[error("transaction timed out")]
    TransactionTimeout,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("session destroyed")]
    SessionDestroyed,
    #[error("session destroy already in progress")]
    DestroyInProgress,
    #[error("handle detached")]
    HandleDetached,
    #[error("handle detach already in progress")]
    DetachInProgress,
    #[error("unmanaged event")]
    UnmanagedEvent,
    #[error("transport not opened")]
    NotOpened,
    #[error("transport does not implement {0}")]
    Unsupported(&'static str),
    #[error("no server address configured")]
    NoAddresses,
    #[error("invalid server url '{url}': {reason}")]
    InvalidAddress { url: String, reason: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Flatten any error into its transport representation. Used when the
    /// same failure has to settle a pending transaction and be returned to
    /// the caller at the same time.
    pub(crate) fn as_transport(&self) -> Error {
        Error::Transport(self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_displays_code_and_reason() {
        let err = Error::Api {
            code: 432,
            reason: "no such room".into(),
        };
        assert_eq!(err.to_string(), "432 no such room");
    }

    #[test]
    fn unsupported_names_the_operation() {
        assert_eq!(
            Error::Unsupported("send").to_string(),
            "transport does not implement send"
        );
    }
}
