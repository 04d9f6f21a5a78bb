//! Plugin handle: the innermost lifecycle level.
//!
//! A handle fronts one server-side plugin instance. Plugin crates supply a
//! [`PluginHandler`] at attach time to recognize plugin-scoped messages;
//! everything else (request helpers, transaction settlement, async event
//! fan-out, detach cascade) lives here.

use crate::errors::Error;
use crate::events::{HandleEvent, MediaEvent, PluginEvent, SlowlinkEvent, TrickleEvent};
use crate::protocol::{self, reply, verb};
use crate::session::Session;
use crate::tid;
use crate::transaction::OwnerId;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{debug, warn};

const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Hook implemented by plugin crates.
///
/// Return a [`PluginEvent`] when the raw message is recognized as
/// plugin-scoped; the handle then publishes it as
/// [`HandleEvent::Event`]. Returning `None` hands the message back to the
/// default routing. [`PluginEvent::from_message`] seeds the event with any
/// carried `jsep`.
pub trait PluginHandler: Send + Sync {
    fn handle_message(&self, raw: &Value) -> Option<PluginEvent>;
}

pub struct Handle {
    owner: OwnerId,
    id: u64,
    session: Weak<Session>,
    handler: Option<Arc<dyn PluginHandler>>,
    detaching: AtomicBool,
    detached: AtomicBool,
    events: broadcast::Sender<HandleEvent>,
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("owner", &self.owner)
            .field("id", &self.id)
            .field("detaching", &self.detaching)
            .field("detached", &self.detached)
            .finish()
    }
}

impl Handle {
    pub(crate) fn new(
        session: &Arc<Session>,
        id: u64,
        handler: Option<Arc<dyn PluginHandler>>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            owner: OwnerId::next(),
            id,
            session: Arc::downgrade(session),
            handler,
            detaching: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            events,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.upgrade()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HandleEvent> {
        self.events.subscribe()
    }

    pub(crate) fn owner_id(&self) -> OwnerId {
        self.owner
    }

    /// Send a plugin request, optionally with a `jsep` payload.
    pub async fn message(&self, body: Value, jsep: Option<Value>) -> Result<Value, Error> {
        let mut request = json!({ "janus": verb::MESSAGE, "body": body });
        if let Some(jsep) = jsep {
            request["jsep"] = jsep;
        }
        self.send_request(request).await
    }

    /// Relay one ICE candidate, a batch, or (with `None`) the
    /// end-of-candidates marker.
    pub async fn trickle(&self, candidate: Option<Value>) -> Result<Value, Error> {
        match candidate {
            None | Some(Value::Null) => self.trickle_complete().await,
            Some(candidates @ Value::Array(_)) => {
                self.send_request(json!({ "janus": verb::TRICKLE, "candidates": candidates }))
                    .await
            }
            Some(candidate) => {
                self.send_request(json!({ "janus": verb::TRICKLE, "candidate": candidate }))
                    .await
            }
        }
    }

    pub async fn trickle_complete(&self) -> Result<Value, Error> {
        self.send_request(
            json!({ "janus": verb::TRICKLE, "candidate": { "completed": true } }),
        )
        .await
    }

    /// Tear down the peer connection without detaching the handle.
    pub async fn hangup(&self) -> Result<Value, Error> {
        self.send_request(json!({ "janus": verb::HANGUP })).await
    }

    /// Detach from the plugin. The local teardown always completes; a
    /// server-side refusal is logged and swallowed so the handle cannot be
    /// left half-detached.
    pub async fn detach(&self) -> Result<(), Error> {
        if self.detached.load(Ordering::SeqCst) {
            return Err(Error::HandleDetached);
        }
        if self.detaching.swap(true, Ordering::SeqCst) {
            return Err(Error::DetachInProgress);
        }
        if let Err(err) = self.send_request(json!({ "janus": verb::DETACH })).await {
            warn!(target = "handle", id = self.id, %err, "detach request failed");
        }
        self.signal_detach();
        Ok(())
    }

    pub async fn send_request(&self, request: Value) -> Result<Value, Error> {
        self.send_request_with_timeout(request, 0).await
    }

    /// Generic request helper. With `timeout_ms > 0` the pending
    /// transaction expires on its own.
    pub async fn send_request_with_timeout(
        &self,
        mut request: Value,
        timeout_ms: u64,
    ) -> Result<Value, Error> {
        if self.detached.load(Ordering::SeqCst) {
            return Err(Error::HandleDetached);
        }
        let session = self.session.upgrade().ok_or(Error::SessionDestroyed)?;
        let connection = session.connection().ok_or(Error::ConnectionClosed)?;

        let obj = request.as_object_mut().ok_or(Error::InvalidRequest)?;
        let verb = obj
            .get("janus")
            .and_then(Value::as_str)
            .ok_or(Error::MissingArgument("janus"))?
            .to_string();
        if !obj.get("transaction").map(Value::is_string).unwrap_or(false) {
            obj.insert("transaction".into(), Value::String(tid::generate()));
        }
        if obj.get("handle_id").and_then(Value::as_u64).is_none() {
            obj.insert("handle_id".into(), json!(self.id));
        }
        let tid = obj
            .get("transaction")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(Error::InvalidRequest)?;

        let pending = connection
            .transactions()
            .create(&tid, self.owner, &verb, timeout_ms);
        if let Err(err) = session.send_request(request).await {
            if pending.is_some() {
                connection
                    .transactions()
                    .close_with_error(&tid, self.owner, err.as_transport());
            }
            return Err(err);
        }
        match pending {
            Some(rx) => rx.await.unwrap_or_else(|_| Err(Error::HandleDetached)),
            None => Ok(Value::Null),
        }
    }

    fn run_hook(&self, msg: &Value) -> Option<PluginEvent> {
        self.handler.as_ref().and_then(|h| h.handle_message(msg))
    }

    /// Route a message the session attributed to this handle.
    pub(crate) fn dispatch(self: &Arc<Self>, msg: Value) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        let Some(connection) = session.connection() else {
            return;
        };
        let tm = connection.transactions();
        let janus = protocol::janus(&msg).unwrap_or_default().to_string();

        if let Some(tid) = protocol::transaction(&msg).map(str::to_string) {
            if tm.owner_of(&tid) == Some(self.owner) {
                let request = tm.request_of(&tid).unwrap_or_default();
                match janus.as_str() {
                    reply::ACK => {
                        // Only trickle settles on an ack; other requests
                        // keep waiting for their definitive response.
                        if request == verb::TRICKLE {
                            tm.close_with_success(&tid, self.owner, msg);
                        }
                    }
                    reply::ERROR => {
                        tm.close_with_error(&tid, self.owner, protocol::error_of(&msg));
                    }
                    _ => {
                        // success / server_info, or the asynchronous event
                        // answering a plugin request.
                        if request == verb::HANGUP || request == verb::DETACH {
                            tm.close_with_success(&tid, self.owner, msg);
                        } else {
                            if self.run_hook(&msg).is_none() {
                                debug!(
                                    target = "handle",
                                    id = self.id,
                                    verb = %janus,
                                    "response not recognized by plugin"
                                );
                            }
                            tm.close_with_success(&tid, self.owner, msg);
                        }
                    }
                }
                return;
            }
        }

        match janus.as_str() {
            reply::EVENT => {
                if let Some(event) = self.run_hook(&msg) {
                    let _ = self.events.send(HandleEvent::Event(event));
                } else if let Some(tid) = protocol::transaction(&msg) {
                    tm.close_with_error(tid, self.owner, Error::UnmanagedEvent);
                } else {
                    debug!(target = "handle", id = self.id, "unmanaged event dropped");
                }
            }
            reply::DETACHED => self.signal_detach(),
            reply::WEBRTCUP => {
                let _ = self.events.send(HandleEvent::WebrtcUp);
            }
            reply::HANGUP => {
                let reason = msg.get("reason").and_then(Value::as_str).map(str::to_string);
                let _ = self.events.send(HandleEvent::Hangup { reason });
            }
            reply::ICE_FAILED => {
                let _ = self.events.send(HandleEvent::IceFailed);
            }
            reply::MEDIA => {
                let event = MediaEvent {
                    media_type: msg
                        .get("type")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    receiving: msg.get("receiving").and_then(Value::as_bool).unwrap_or(false),
                    mid: msg.get("mid").and_then(Value::as_str).map(str::to_string),
                    substream: msg.get("substream").and_then(Value::as_u64),
                    seconds: msg.get("seconds").and_then(Value::as_u64),
                };
                let _ = self.events.send(HandleEvent::Media(event));
            }
            reply::SLOWLINK => {
                let event = SlowlinkEvent {
                    uplink: msg.get("uplink").and_then(Value::as_bool).unwrap_or(false),
                    media: msg
                        .get("media")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    mid: msg.get("mid").and_then(Value::as_str).map(str::to_string),
                    lost: msg.get("lost").and_then(Value::as_u64).unwrap_or(0),
                };
                let _ = self.events.send(HandleEvent::Slowlink(event));
            }
            reply::TRICKLE => {
                let candidate = msg.get("candidate").cloned().unwrap_or(Value::Null);
                let completed = candidate
                    .get("completed")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let event = if completed {
                    TrickleEvent::Completed
                } else {
                    TrickleEvent::Candidate {
                        sdp_mid: candidate
                            .get("sdpMid")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        sdp_mline_index: candidate.get("sdpMLineIndex").and_then(Value::as_u64),
                        candidate: candidate
                            .get("candidate")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                    }
                };
                let _ = self.events.send(HandleEvent::Trickle(event));
            }
            other => {
                warn!(target = "handle", id = self.id, verb = other, "unknown message dropped");
            }
        }
    }

    /// Terminal teardown. Fails every handle-owned transaction, leaves the
    /// session's table, and notifies observers exactly once.
    pub(crate) fn signal_detach(&self) {
        if self.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        self.detaching.store(true, Ordering::SeqCst);
        if let Some(session) = self.session.upgrade() {
            if let Some(connection) = session.connection() {
                connection
                    .transactions()
                    .close_all_with_error(Some(self.owner), || Error::HandleDetached);
            }
            session.remove_handle(self.id);
        }
        debug!(target = "handle", id = self.id, "handle detached");
        let _ = self.events.send(HandleEvent::Detached { id: self.id });
    }
}
