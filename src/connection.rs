//! Connection: the root lifecycle level.
//!
//! Owns the transport, the transaction table and the session table. All
//! inbound traffic funnels through [`Connection::dispatch`], which routes by
//! the (`session_id`, `transaction`, verb) shape of the envelope. Teardown
//! is one-way: a closed connection destroys every session, which detaches
//! every handle.

use crate::config::{AddressPool, ClientConfig, ServerAddress};
use crate::errors::Error;
use crate::events::ConnectionEvent;
use crate::protocol::{self, reply, verb};
use crate::session::Session;
use crate::tid;
use crate::transaction::{OwnerId, TransactionManager};
use crate::transport::{self, ConnectionTransport, Transport, TransportEvent};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const EVENT_CHANNEL_CAPACITY: usize = 16;

pub struct Connection {
    owner: OwnerId,
    config: ClientConfig,
    pool: Arc<AddressPool>,
    transactions: TransactionManager,
    transport: ConnectionTransport,
    sessions: Mutex<HashMap<u64, Arc<Session>>>,
    closed: AtomicBool,
    events: broadcast::Sender<ConnectionEvent>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("owner", &self.owner)
            .field("config", &self.config)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Connection {
    /// Open a connection using the transport selected by the first
    /// address's URL scheme.
    pub async fn open(config: ClientConfig) -> Result<Arc<Self>, Error> {
        Self::open_with(config, transport::from_config).await
    }

    /// Open with a caller-supplied transport. The factory receives the
    /// event channel the transport must feed; tests and embedders plug
    /// their own link in here.
    pub async fn open_with<F>(config: ClientConfig, factory: F) -> Result<Arc<Self>, Error>
    where
        F: FnOnce(&ClientConfig, mpsc::UnboundedSender<TransportEvent>) -> Box<dyn Transport>,
    {
        config.validate()?;
        let pool = Arc::new(AddressPool::new(config.addresses.clone()));
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let inner = factory(&config, events_tx);
        let transport = ConnectionTransport::new(inner, Arc::clone(&pool), &config);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let connection = Arc::new(Self {
            owner: OwnerId::next(),
            config,
            pool,
            transactions: TransactionManager::new(),
            transport,
            sessions: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            events,
            pump: Mutex::new(None),
        });

        connection.transport.attempt_open().await?;

        let weak = Arc::downgrade(&connection);
        let pump = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let Some(connection) = weak.upgrade() else { break };
                match event {
                    TransportEvent::Message(msg) => connection.dispatch(msg),
                    TransportEvent::Closed { graceful } => {
                        connection.signal_close(graceful);
                        break;
                    }
                }
            }
        });
        *connection.pump.lock().unwrap() = Some(pump);
        Ok(connection)
    }

    pub fn is_admin(&self) -> bool {
        self.config.is_admin
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn remote_hostname(&self) -> Option<String> {
        self.transport.remote_hostname()
    }

    /// The address the next request will be stamped against.
    pub fn current_server(&self) -> ServerAddress {
        self.pool.current()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub(crate) fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    pub(crate) fn remove_session(&self, id: u64) {
        self.sessions.lock().unwrap().remove(&id);
    }

    /// Graceful shutdown; the resulting transport closure cascades through
    /// [`ConnectionEvent::Closed`].
    pub async fn close(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }
        self.transport.close().await
    }

    /// Stamp and send one request. Requests registered by a session or
    /// handle are forwarded as-is; the registrant awaits the response on
    /// its own transaction and this call settles on the transport write.
    pub async fn send_request(&self, mut request: Value) -> Result<Value, Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }
        let verb = self.decorate_request(&mut request)?;
        let tid = protocol::transaction(&request)
            .map(str::to_string)
            .ok_or(Error::InvalidRequest)?;

        let pending = self.transactions.create(&tid, self.owner, &verb, 0);
        if let Err(err) = self.transport.send(&request).await {
            if pending.is_some() {
                self.transactions
                    .close_with_error(&tid, self.owner, err.as_transport());
            }
            return Err(err);
        }
        match pending {
            Some(rx) => rx.await.unwrap_or_else(|_| Err(Error::ConnectionClosed)),
            None => Ok(Value::Null),
        }
    }

    /// Generate a transaction id when absent and stamp the credentials of
    /// the currently selected address (`admin_secret` on the admin
    /// endpoint, `apisecret` otherwise, plus the optional `token`).
    fn decorate_request(&self, request: &mut Value) -> Result<String, Error> {
        let obj = request.as_object_mut().ok_or(Error::InvalidRequest)?;
        let verb = obj
            .get("janus")
            .and_then(Value::as_str)
            .ok_or(Error::MissingArgument("janus"))?
            .to_string();
        if !obj.get("transaction").map(Value::is_string).unwrap_or(false) {
            obj.insert("transaction".into(), Value::String(tid::generate()));
        }
        let address = self.pool.current();
        if let Some(secret) = &address.apisecret {
            let key = if self.config.is_admin {
                "admin_secret"
            } else {
                "apisecret"
            };
            obj.insert(key.into(), Value::String(secret.clone()));
        }
        if let Some(token) = &address.token {
            obj.insert("token".into(), Value::String(token.clone()));
        }
        Ok(verb)
    }

    /// Create a server-side session. `ka_interval_secs` overrides the
    /// configured keepalive period; `0` disables the probe.
    pub async fn create(
        self: &Arc<Self>,
        ka_interval_secs: Option<u64>,
    ) -> Result<Arc<Session>, Error> {
        let response = self.send_request(json!({ "janus": verb::CREATE })).await?;
        let id = protocol::data_id(&response).ok_or_else(|| {
            Error::UnexpectedResponse("create response missing data.id".into())
        })?;
        let session = Session::new(self, id);
        self.sessions.lock().unwrap().insert(id, Arc::clone(&session));
        session.start_keepalive(ka_interval_secs.unwrap_or(self.config.ka_interval_secs));
        debug!(target = "connection", session = id, "session created");
        Ok(session)
    }

    /// Query server capabilities.
    pub async fn get_info(&self) -> Result<Value, Error> {
        self.send_request(json!({ "janus": verb::INFO })).await
    }

    // Admin API.

    pub async fn list_sessions(&self) -> Result<Vec<u64>, Error> {
        let response = self
            .send_request(json!({ "janus": verb::LIST_SESSIONS }))
            .await?;
        response
            .get("sessions")
            .and_then(Value::as_array)
            .map(|list| list.iter().filter_map(Value::as_u64).collect())
            .ok_or_else(|| Error::UnexpectedResponse("list_sessions missing sessions".into()))
    }

    pub async fn list_handles(&self, session_id: u64) -> Result<Vec<u64>, Error> {
        let response = self
            .send_request(json!({ "janus": verb::LIST_HANDLES, "session_id": session_id }))
            .await?;
        response
            .get("handles")
            .and_then(Value::as_array)
            .map(|list| list.iter().filter_map(Value::as_u64).collect())
            .ok_or_else(|| Error::UnexpectedResponse("list_handles missing handles".into()))
    }

    pub async fn handle_info(&self, session_id: u64, handle_id: u64) -> Result<Value, Error> {
        self.send_request(json!({
            "janus": verb::HANDLE_INFO,
            "session_id": session_id,
            "handle_id": handle_id,
        }))
        .await
    }

    pub async fn start_pcap(
        &self,
        session_id: u64,
        handle_id: u64,
        folder: &str,
        filename: &str,
        truncate: Option<u64>,
    ) -> Result<Value, Error> {
        if folder.is_empty() {
            return Err(Error::MissingArgument("folder"));
        }
        if filename.is_empty() {
            return Err(Error::MissingArgument("filename"));
        }
        let mut request = json!({
            "janus": verb::START_PCAP,
            "session_id": session_id,
            "handle_id": handle_id,
            "folder": folder,
            "filename": filename,
        });
        if let Some(truncate) = truncate {
            request["truncate"] = json!(truncate);
        }
        self.send_request(request).await
    }

    pub async fn stop_pcap(&self, session_id: u64, handle_id: u64) -> Result<Value, Error> {
        self.send_request(json!({
            "janus": verb::STOP_PCAP,
            "session_id": session_id,
            "handle_id": handle_id,
        }))
        .await
    }

    /// Route one inbound envelope.
    pub(crate) fn dispatch(self: &Arc<Self>, msg: Value) {
        // Session-scoped messages go to the owning session. The admin
        // endpoint reports session_id on plain responses, so admin mode
        // settles them on the connection's transactions instead.
        if let Some(session_id) = protocol::session_id(&msg) {
            if !self.config.is_admin {
                let session = self.sessions.lock().unwrap().get(&session_id).cloned();
                match session {
                    Some(session) => session.dispatch(msg),
                    None => warn!(
                        target = "connection",
                        session = session_id,
                        "message for unknown session dropped"
                    ),
                }
                return;
            }
        }

        if let Some(tid) = protocol::transaction(&msg).map(str::to_string) {
            if self.transactions.owner_of(&tid) != Some(self.owner) {
                warn!(
                    target = "connection",
                    transaction = %tid,
                    "response for foreign transaction dropped"
                );
                return;
            }
            let janus = protocol::janus(&msg).unwrap_or_default();
            if protocol::is_definitive(janus) {
                if janus == reply::ERROR {
                    self.transactions
                        .close_with_error(&tid, self.owner, protocol::error_of(&msg));
                } else {
                    self.transactions.close_with_success(&tid, self.owner, msg);
                }
            } else {
                debug!(
                    target = "connection",
                    transaction = %tid,
                    verb = janus,
                    "ignoring non-definitive response"
                );
            }
            return;
        }

        warn!(target = "connection", "unexpected message dropped");
    }

    /// Terminal teardown, driven by the transport closure. Runs at most
    /// once; the terminal state is permanent.
    pub(crate) fn signal_close(self: &Arc<Self>, graceful: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(
            target = "connection",
            graceful,
            pending = self.transactions.len(),
            "connection teardown"
        );
        self.transactions
            .close_all_with_error(Some(self.owner), || Error::ConnectionClosed);
        let sessions: Vec<Arc<Session>> = {
            self.sessions.lock().unwrap().drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            session.signal_destroy();
        }
        self.transactions.clear();
        let event = if graceful {
            ConnectionEvent::Closed
        } else {
            ConnectionEvent::Error("connection closed unexpectedly".into())
        };
        let _ = self.events.send(event);
        if let Some(pump) = self.pump.lock().unwrap().take() {
            pump.abort();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().unwrap().take() {
            pump.abort();
        }
    }
}
