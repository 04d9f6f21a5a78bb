//! Typed events published by connections, sessions and handles.
//!
//! Each object owns a `tokio::sync::broadcast` channel; `subscribe()` hands
//! out receivers. Lifecycle events fire once per lifecycle, media-path
//! notifications fire in inbound arrival order.

use serde_json::{Map, Value};

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The transport closed after a user-initiated `close()`.
    Closed,
    /// The transport dropped unexpectedly.
    Error(String),
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Destroyed { id: u64 },
}

#[derive(Debug, Clone)]
pub struct MediaEvent {
    pub media_type: String,
    pub receiving: bool,
    pub mid: Option<String>,
    pub substream: Option<u64>,
    pub seconds: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct SlowlinkEvent {
    pub uplink: bool,
    pub media: String,
    pub mid: Option<String>,
    pub lost: u64,
}

#[derive(Debug, Clone)]
pub enum TrickleEvent {
    Completed,
    Candidate {
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u64>,
        candidate: String,
    },
}

/// A message recognized by a plugin hook (see
/// [`crate::handle::PluginHandler`]).
#[derive(Debug, Clone)]
pub struct PluginEvent {
    /// Plugin-defined event name, when the plugin distinguishes one.
    pub event: Option<String>,
    pub data: Value,
}

impl PluginEvent {
    /// Seed an event from a raw envelope: a carried `jsep` is copied into
    /// `data.jsep`, and `jsep.e2ee` is lifted to `data.e2ee` when boolean.
    pub fn from_message(raw: &Value) -> Self {
        let mut data = Map::new();
        if let Some(jsep) = raw.get("jsep") {
            if jsep.is_object() {
                data.insert("jsep".into(), jsep.clone());
                if let Some(e2ee) = jsep.get("e2ee") {
                    if e2ee.is_boolean() {
                        data.insert("e2ee".into(), e2ee.clone());
                    }
                }
            }
        }
        Self {
            event: None,
            data: Value::Object(data),
        }
    }

    pub fn named(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: Some(event.into()),
            data,
        }
    }
}

#[derive(Debug, Clone)]
pub enum HandleEvent {
    Detached { id: u64 },
    WebrtcUp,
    Hangup { reason: Option<String> },
    IceFailed,
    Media(MediaEvent),
    Slowlink(SlowlinkEvent),
    Trickle(TrickleEvent),
    /// A plugin-recognized asynchronous event.
    Event(PluginEvent),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plugin_event_copies_jsep_and_e2ee() {
        let raw = json!({
            "janus": "event",
            "jsep": { "type": "answer", "sdp": "v=0", "e2ee": true }
        });
        let event = PluginEvent::from_message(&raw);
        assert!(event.event.is_none());
        assert_eq!(event.data["jsep"]["sdp"], "v=0");
        assert_eq!(event.data["e2ee"], true);

        let bare = PluginEvent::from_message(&json!({ "janus": "event" }));
        assert!(bare.data.as_object().unwrap().is_empty());
    }
}
