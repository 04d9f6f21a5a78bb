//! Unix datagram transport for `file://` addresses.
//!
//! Binds a fresh local socket per connection instance, connects it to the
//! server's socket path, and relays JSON datagrams in both directions. The
//! bind path is unlinked on every teardown path.

use super::{Transport, TransportEvent};
use crate::errors::Error;
use crate::config::ServerAddress;
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::UnixDatagram;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

const RECV_BUFFER_BYTES: usize = 1 << 16;

pub struct UnixTransport {
    events: mpsc::UnboundedSender<TransportEvent>,
    closing: Arc<AtomicBool>,
    state: Mutex<UnixState>,
}

#[derive(Default)]
struct UnixState {
    socket: Option<Arc<UnixDatagram>>,
    bind_path: Option<PathBuf>,
    reader: Option<JoinHandle<()>>,
    remote: Option<String>,
}

impl UnixTransport {
    pub fn new(events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            events,
            closing: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(UnixState::default()),
        }
    }
}

#[async_trait]
impl Transport for UnixTransport {
    async fn open(&self, address: &ServerAddress) -> Result<(), Error> {
        let url = Url::parse(&address.url).map_err(|err| Error::InvalidAddress {
            url: address.url.clone(),
            reason: err.to_string(),
        })?;
        if url.scheme() != "file" {
            return Err(Error::InvalidAddress {
                url: address.url.clone(),
                reason: format!("unsupported scheme '{}'", url.scheme()),
            });
        }
        let server_path = url.path().to_string();
        if server_path.is_empty() {
            return Err(Error::InvalidAddress {
                url: address.url.clone(),
                reason: "missing socket path".into(),
            });
        }

        let bind_path = std::env::temp_dir().join(format!(".pier-{}", Uuid::new_v4()));
        let _ = std::fs::remove_file(&bind_path);
        let socket = UnixDatagram::bind(&bind_path)?;
        socket.connect(&server_path)?;
        debug!(
            target = "transport",
            local = %bind_path.display(),
            remote = %server_path,
            "unix socket connected"
        );

        let socket = Arc::new(socket);
        let reader = tokio::spawn(read_loop(
            Arc::clone(&socket),
            self.events.clone(),
            Arc::clone(&self.closing),
            bind_path.clone(),
        ));

        let mut state = self.state.lock().unwrap();
        if let Some(old) = state.reader.take() {
            old.abort();
        }
        state.socket = Some(socket);
        state.bind_path = Some(bind_path);
        state.reader = Some(reader);
        state.remote = Some(server_path);
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        self.closing.store(true, Ordering::SeqCst);
        let (socket, reader, bind_path) = {
            let mut state = self.state.lock().unwrap();
            (state.socket.take(), state.reader.take(), state.bind_path.take())
        };
        if socket.is_none() {
            return Err(Error::NotOpened);
        }
        if let Some(reader) = reader {
            reader.abort();
        }
        drop(socket);
        if let Some(path) = bind_path {
            let _ = std::fs::remove_file(&path);
        }
        let _ = self.events.send(TransportEvent::Closed { graceful: true });
        Ok(())
    }

    async fn send(&self, message: &Value) -> Result<(), Error> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(Error::NotOpened);
        }
        let socket = { self.state.lock().unwrap().socket.clone() };
        let socket = socket.ok_or(Error::NotOpened)?;
        let bytes = serde_json::to_vec(message)?;
        socket.send(&bytes).await?;
        Ok(())
    }

    fn remote_hostname(&self) -> Option<String> {
        self.state.lock().unwrap().remote.clone()
    }
}

impl Drop for UnixTransport {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(reader) = state.reader.take() {
                reader.abort();
            }
            if let Some(path) = state.bind_path.take() {
                let _ = std::fs::remove_file(&path);
            }
        }
    }
}

async fn read_loop(
    socket: Arc<UnixDatagram>,
    events: mpsc::UnboundedSender<TransportEvent>,
    closing: Arc<AtomicBool>,
    bind_path: PathBuf,
) {
    let mut buf = vec![0u8; RECV_BUFFER_BYTES];
    loop {
        match socket.recv(&mut buf).await {
            Ok(len) => match serde_json::from_slice::<Value>(&buf[..len]) {
                Ok(msg) => {
                    let _ = events.send(TransportEvent::Message(msg));
                }
                Err(err) => warn!(target = "transport", %err, "dropping unparsable datagram"),
            },
            Err(err) => {
                if !closing.load(Ordering::SeqCst) {
                    warn!(target = "transport", %err, "unix socket error");
                }
                break;
            }
        }
    }
    let _ = std::fs::remove_file(&bind_path);
    let _ = events.send(TransportEvent::Closed {
        graceful: closing.load(Ordering::SeqCst),
    });
}
