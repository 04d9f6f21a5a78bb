//! In-process transport for tests: a scriptable "server" end paired with a
//! [`Transport`] implementation handed to the connection under test.

use super::{Transport, TransportEvent};
use crate::config::{ClientConfig, ServerAddress};
use crate::errors::Error;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, mpsc};

/// Scriptable far end: observe outbound requests with [`MockServer::recv`],
/// inject inbound traffic with [`MockServer::push`], and script open
/// failures for failover tests.
pub struct MockServer {
    events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    outbound_tx: mpsc::UnboundedSender<Value>,
    outbound_rx: AsyncMutex<mpsc::UnboundedReceiver<Value>>,
    open_failures: AtomicU32,
    open_attempts: AtomicU32,
}

impl MockServer {
    pub fn new() -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            events: Mutex::new(None),
            outbound_tx,
            outbound_rx: AsyncMutex::new(outbound_rx),
            open_failures: AtomicU32::new(0),
            open_attempts: AtomicU32::new(0),
        })
    }

    /// Transport factory to pass to `Connection::open_with`.
    pub fn factory(
        self: &Arc<Self>,
    ) -> impl FnOnce(&ClientConfig, mpsc::UnboundedSender<TransportEvent>) -> Box<dyn Transport>
    + Send
    + 'static {
        let server = Arc::clone(self);
        move |_config, events| {
            *server.events.lock().unwrap() = Some(events);
            Box::new(MockTransport {
                server,
                opened: AtomicBool::new(false),
                closing: AtomicBool::new(false),
            })
        }
    }

    /// Next request the client wrote to the transport.
    pub async fn recv(&self) -> Option<Value> {
        self.outbound_rx.lock().await.recv().await
    }

    /// Inject an inbound message.
    pub fn push(&self, msg: Value) {
        if let Some(events) = self.events.lock().unwrap().as_ref() {
            let _ = events.send(TransportEvent::Message(msg));
        }
    }

    /// Simulate the far end dropping the link.
    pub fn drop_connection(&self, graceful: bool) {
        if let Some(events) = self.events.lock().unwrap().as_ref() {
            let _ = events.send(TransportEvent::Closed { graceful });
        }
    }

    pub fn fail_next_opens(&self, n: u32) {
        self.open_failures.store(n, Ordering::SeqCst);
    }

    pub fn open_attempts(&self) -> u32 {
        self.open_attempts.load(Ordering::SeqCst)
    }
}

struct MockTransport {
    server: Arc<MockServer>,
    opened: AtomicBool,
    closing: AtomicBool,
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, _address: &ServerAddress) -> Result<(), Error> {
        self.server.open_attempts.fetch_add(1, Ordering::SeqCst);
        let failures = &self.server.open_failures;
        if failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Transport("connection refused".into()));
        }
        self.opened.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        if !self.opened.load(Ordering::SeqCst) {
            return Err(Error::NotOpened);
        }
        self.closing.store(true, Ordering::SeqCst);
        if let Some(events) = self.server.events.lock().unwrap().as_ref() {
            let _ = events.send(TransportEvent::Closed { graceful: true });
        }
        Ok(())
    }

    async fn send(&self, message: &Value) -> Result<(), Error> {
        if !self.opened.load(Ordering::SeqCst) || self.closing.load(Ordering::SeqCst) {
            return Err(Error::NotOpened);
        }
        self.server
            .outbound_tx
            .send(message.clone())
            .map_err(|_| Error::Transport("mock server gone".into()))?;
        Ok(())
    }

    fn remote_hostname(&self) -> Option<String> {
        Some("mock".into())
    }
}
