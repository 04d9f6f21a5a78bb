//! Session: the middle lifecycle level.
//!
//! A session owns its handle table and a keepalive task whose failure is
//! fatal to the session. Messages delegated by the connection are routed to
//! handles by `sender`, by transaction ownership for the ack-without-sender
//! case, or settled here for session-owned transactions.

use crate::connection::Connection;
use crate::errors::Error;
use crate::events::SessionEvent;
use crate::handle::{Handle, PluginHandler};
use crate::protocol::{self, reply, verb};
use crate::tid;
use crate::transaction::OwnerId;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

const EVENT_CHANNEL_CAPACITY: usize = 16;

pub struct Session {
    owner: OwnerId,
    id: u64,
    connection: Weak<Connection>,
    handles: Mutex<HashMap<u64, Arc<Handle>>>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
    destroying: AtomicBool,
    destroyed: AtomicBool,
    events: broadcast::Sender<SessionEvent>,
}

impl Session {
    pub(crate) fn new(connection: &Arc<Connection>, id: u64) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            owner: OwnerId::next(),
            id,
            connection: Arc::downgrade(connection),
            handles: Mutex::new(HashMap::new()),
            keepalive: Mutex::new(None),
            destroying: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            events,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.upgrade()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Probe the session every `interval_secs`; each probe must settle
    /// within half the period. `0` disables the loop.
    pub(crate) fn start_keepalive(self: &Arc<Self>, interval_secs: u64) {
        if interval_secs == 0 {
            return;
        }
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            // The immediate first tick; probing starts one period in.
            ticker.tick().await;
            let timeout_ms = interval_secs * 500;
            loop {
                ticker.tick().await;
                let Some(session) = weak.upgrade() else { break };
                if session.destroyed() {
                    break;
                }
                let probe = session
                    .send_request_with_timeout(json!({ "janus": verb::KEEPALIVE }), timeout_ms)
                    .await;
                match probe {
                    Ok(_) => trace!(target = "session", id = session.id, "keepalive answered"),
                    Err(err) => {
                        warn!(
                            target = "session",
                            id = session.id,
                            %err,
                            "keepalive failed, destroying session"
                        );
                        session.signal_destroy();
                        break;
                    }
                }
            }
        });
        *self.keepalive.lock().unwrap() = Some(task);
    }

    pub async fn send_request(&self, request: Value) -> Result<Value, Error> {
        self.send_request_with_timeout(request, 0).await
    }

    pub(crate) async fn send_request_with_timeout(
        &self,
        mut request: Value,
        timeout_ms: u64,
    ) -> Result<Value, Error> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(Error::SessionDestroyed);
        }
        let connection = self.connection.upgrade().ok_or(Error::ConnectionClosed)?;

        let obj = request.as_object_mut().ok_or(Error::InvalidRequest)?;
        let verb = obj
            .get("janus")
            .and_then(Value::as_str)
            .ok_or(Error::MissingArgument("janus"))?
            .to_string();
        if !obj.get("transaction").map(Value::is_string).unwrap_or(false) {
            obj.insert("transaction".into(), Value::String(tid::generate()));
        }
        if obj.get("session_id").and_then(Value::as_u64).is_none() {
            obj.insert("session_id".into(), json!(self.id));
        }
        let tid = obj
            .get("transaction")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(Error::InvalidRequest)?;

        // No-op when a handle already registered this id; the handle then
        // keeps ownership of the response.
        let pending = connection
            .transactions()
            .create(&tid, self.owner, &verb, timeout_ms);
        if let Err(err) = connection.send_request(request).await {
            if pending.is_some() {
                connection
                    .transactions()
                    .close_with_error(&tid, self.owner, err.as_transport());
            }
            return Err(err);
        }
        match pending {
            Some(rx) => rx.await.unwrap_or_else(|_| Err(Error::SessionDestroyed)),
            None => Ok(Value::Null),
        }
    }

    /// Ask the server to drop the session, then tear down locally. A second
    /// call fails while the first is still in flight.
    pub async fn destroy(&self) -> Result<Value, Error> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(Error::SessionDestroyed);
        }
        if self.destroying.swap(true, Ordering::SeqCst) {
            return Err(Error::DestroyInProgress);
        }
        let result = self
            .send_request(json!({ "janus": verb::DESTROY }))
            .await;
        self.signal_destroy();
        result
    }

    /// Attach a plugin handle. `handler` is the plugin's message hook; pass
    /// `None` for a plain handle.
    pub async fn attach(
        self: &Arc<Self>,
        plugin: &str,
        handler: Option<Arc<dyn PluginHandler>>,
    ) -> Result<Arc<Handle>, Error> {
        if plugin.is_empty() {
            return Err(Error::MissingArgument("plugin"));
        }
        let response = self
            .send_request(json!({ "janus": verb::ATTACH, "plugin": plugin }))
            .await?;
        let id = protocol::data_id(&response).ok_or_else(|| {
            Error::UnexpectedResponse("attach response missing data.id".into())
        })?;
        let handle = Handle::new(self, id, handler);
        self.handles.lock().unwrap().insert(id, Arc::clone(&handle));
        debug!(target = "session", session = self.id, handle = id, plugin, "handle attached");
        Ok(handle)
    }

    pub(crate) fn remove_handle(&self, id: u64) {
        self.handles.lock().unwrap().remove(&id);
    }

    /// Route a message the connection attributed to this session.
    pub(crate) fn dispatch(self: &Arc<Self>, msg: Value) {
        let Some(connection) = self.connection.upgrade() else {
            return;
        };

        if let Some(sender) = protocol::sender(&msg) {
            let handle = self.handles.lock().unwrap().get(&sender).cloned();
            match handle {
                Some(handle) => handle.dispatch(msg),
                None => {
                    let janus = protocol::janus(&msg).unwrap_or_default();
                    if janus == reply::DETACHED {
                        // Routine while a local detach races the server's
                        // notification.
                        debug!(
                            target = "session",
                            session = self.id,
                            sender,
                            "detached for unknown handle"
                        );
                    } else {
                        warn!(
                            target = "session",
                            session = self.id,
                            sender,
                            verb = janus,
                            "message for unknown handle dropped"
                        );
                    }
                }
            }
            return;
        }

        if let Some(tid) = protocol::transaction(&msg).map(str::to_string) {
            let tm = connection.transactions();
            if let Some(owner) = tm.owner_of(&tid) {
                // Acks to handle-issued requests (trickle) carry no sender;
                // the owning handle routes them.
                let owning_handle = {
                    self.handles
                        .lock()
                        .unwrap()
                        .values()
                        .find(|h| h.owner_id() == owner)
                        .cloned()
                };
                if let Some(handle) = owning_handle {
                    handle.dispatch(msg);
                    return;
                }
                if owner == self.owner {
                    let janus = protocol::janus(&msg).unwrap_or_default();
                    let keepalive = tm.request_of(&tid).as_deref() == Some(verb::KEEPALIVE);
                    if protocol::is_definitive(janus) || keepalive {
                        if janus == reply::ERROR {
                            tm.close_with_error(&tid, self.owner, protocol::error_of(&msg));
                        } else {
                            tm.close_with_success(&tid, self.owner, msg);
                        }
                        return;
                    }
                }
            }
            warn!(
                target = "session",
                session = self.id,
                transaction = %tid,
                "unroutable response dropped"
            );
            return;
        }

        if protocol::janus(&msg) == Some(reply::TIMEOUT) {
            warn!(target = "session", session = self.id, "server timed the session out");
            self.signal_destroy();
            return;
        }

        warn!(target = "session", session = self.id, "unexpected message dropped");
    }

    /// Terminal teardown: stop the keepalive, detach every handle, fail
    /// session-owned transactions, leave the connection's table, notify
    /// observers. Runs at most once.
    pub(crate) fn signal_destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.destroying.store(true, Ordering::SeqCst);
        if let Some(task) = self.keepalive.lock().unwrap().take() {
            task.abort();
        }
        let handles: Vec<Arc<Handle>> = {
            self.handles.lock().unwrap().drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            handle.signal_detach();
        }
        if let Some(connection) = self.connection.upgrade() {
            connection
                .transactions()
                .close_all_with_error(Some(self.owner), || Error::SessionDestroyed);
            connection.remove_session(self.id);
        }
        debug!(target = "session", id = self.id, "session destroyed");
        let _ = self.events.send(SessionEvent::Destroyed { id: self.id });
    }
}
