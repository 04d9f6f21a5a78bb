//! WebSocket transport.
//!
//! Speaks the `janus-protocol` (or `janus-admin-protocol`) subprotocol over
//! `ws`/`wss`, or over a Unix stream socket for the `ws+unix`/`wss+unix`
//! schemes. A reader task feeds parsed envelopes to the connection and a
//! ping task probes liveness; a missed pong terminates the socket without a
//! close handshake so the failure cascades like any other drop.

use super::{Transport, TransportEvent};
use crate::config::{ClientConfig, ServerAddress};
use crate::errors::Error;
use crate::protocol;
use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde_json::Value;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::UnixStream;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{client_async, connect_async};
use tracing::{debug, trace, warn};
use url::Url;

const PING_TIME_SECS: u64 = 10;
const PING_TIME_WAIT_SECS: u64 = 5;

type WsSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
type WsSource = Pin<Box<dyn Stream<Item = Result<Message, WsError>> + Send>>;

pub struct WebSocketTransport {
    admin: bool,
    handshake_timeout: Duration,
    events: mpsc::UnboundedSender<TransportEvent>,
    closing: Arc<AtomicBool>,
    state: Mutex<WsState>,
}

#[derive(Default)]
struct WsState {
    sink: Option<Arc<AsyncMutex<WsSink>>>,
    tasks: Vec<JoinHandle<()>>,
    remote: Option<String>,
}

impl WebSocketTransport {
    pub fn new(config: &ClientConfig, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            admin: config.is_admin,
            handshake_timeout: Duration::from_millis(config.ws_options.handshake_timeout_ms),
            events,
            closing: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(WsState::default()),
        }
    }

    fn subprotocol(&self) -> &'static str {
        if self.admin {
            protocol::WS_ADMIN_SUBPROTOCOL
        } else {
            protocol::WS_SUBPROTOCOL
        }
    }

    async fn handshake(&self, address: &ServerAddress) -> Result<(WsSink, WsSource, Option<String>), Error> {
        let url = Url::parse(&address.url).map_err(|err| Error::InvalidAddress {
            url: address.url.clone(),
            reason: err.to_string(),
        })?;
        match url.scheme() {
            "ws" | "wss" => {
                let mut request = address.url.as_str().into_client_request()?;
                request.headers_mut().insert(
                    "Sec-WebSocket-Protocol",
                    HeaderValue::from_static(self.subprotocol()),
                );
                let (stream, _response) =
                    tokio::time::timeout(self.handshake_timeout, connect_async(request))
                        .await
                        .map_err(|_| Error::Transport("websocket handshake timed out".into()))??;
                let (sink, source) = stream.split();
                let remote = url.host_str().map(|h| h.to_string());
                Ok((Box::pin(sink), Box::pin(source), remote))
            }
            "ws+unix" | "wss+unix" => {
                // The path names the socket; the HTTP side of the handshake
                // still needs a nominal authority.
                let path = url.path().to_string();
                let stream = UnixStream::connect(&path).await?;
                let mut request = "ws://localhost/janus".into_client_request()?;
                request.headers_mut().insert(
                    "Sec-WebSocket-Protocol",
                    HeaderValue::from_static(self.subprotocol()),
                );
                let (stream, _response) =
                    tokio::time::timeout(self.handshake_timeout, client_async(request, stream))
                        .await
                        .map_err(|_| Error::Transport("websocket handshake timed out".into()))??;
                let (sink, source) = stream.split();
                Ok((Box::pin(sink), Box::pin(source), Some(path)))
            }
            other => Err(Error::InvalidAddress {
                url: address.url.clone(),
                reason: format!("unsupported websocket scheme '{other}'"),
            }),
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, address: &ServerAddress) -> Result<(), Error> {
        let (sink, source, remote) = self.handshake(address).await?;
        debug!(target = "transport", url = %address.url, "websocket connected");

        let sink = Arc::new(AsyncMutex::new(sink));
        let (pong_tx, pong_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let reader = tokio::spawn(read_loop(
            source,
            self.events.clone(),
            pong_tx,
            Arc::clone(&self.closing),
        ));
        let pinger = tokio::spawn(ping_loop(
            Arc::clone(&sink),
            pong_rx,
            self.events.clone(),
            Arc::clone(&self.closing),
            reader.abort_handle(),
        ));

        let mut state = self.state.lock().unwrap();
        for task in state.tasks.drain(..) {
            task.abort();
        }
        state.sink = Some(sink);
        state.tasks = vec![reader, pinger];
        state.remote = remote;
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        self.closing.store(true, Ordering::SeqCst);
        let sink = { self.state.lock().unwrap().sink.clone() };
        let sink = sink.ok_or(Error::NotOpened)?;
        let mut guard = sink.lock().await;
        // The reader observes the answering close frame and reports the
        // (graceful) closure.
        guard.send(Message::Close(None)).await?;
        guard.flush().await?;
        Ok(())
    }

    async fn send(&self, message: &Value) -> Result<(), Error> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(Error::NotOpened);
        }
        let sink = { self.state.lock().unwrap().sink.clone() };
        let sink = sink.ok_or(Error::NotOpened)?;
        let text = serde_json::to_string(message)?;
        trace!(target = "transport", len = text.len(), "ws_out");
        sink.lock().await.send(Message::Text(text)).await?;
        Ok(())
    }

    fn remote_hostname(&self) -> Option<String> {
        self.state.lock().unwrap().remote.clone()
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Ok(state) = self.state.lock() {
            for task in &state.tasks {
                task.abort();
            }
        }
    }
}

async fn read_loop(
    mut source: WsSource,
    events: mpsc::UnboundedSender<TransportEvent>,
    pong_tx: mpsc::UnboundedSender<Vec<u8>>,
    closing: Arc<AtomicBool>,
) {
    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<Value>(&text) {
                Ok(msg) => {
                    let _ = events.send(TransportEvent::Message(msg));
                }
                Err(err) => warn!(target = "transport", %err, "dropping unparsable text frame"),
            },
            Ok(Message::Binary(data)) => match serde_json::from_slice::<Value>(&data) {
                Ok(msg) => {
                    let _ = events.send(TransportEvent::Message(msg));
                }
                Err(err) => warn!(target = "transport", %err, "dropping unparsable binary frame"),
            },
            Ok(Message::Pong(payload)) => {
                let _ = pong_tx.send(payload);
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                match &err {
                    WsError::ConnectionClosed
                    | WsError::AlreadyClosed
                    | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                        debug!(target = "transport", "websocket closed: {err}");
                    }
                    _ => warn!(target = "transport", "websocket error: {err}"),
                }
                break;
            }
        }
    }
    let _ = events.send(TransportEvent::Closed {
        graceful: closing.load(Ordering::SeqCst),
    });
}

/// Probe liveness with timestamped ping frames. A pong must echo the
/// payload within the wait window or the socket is torn down abruptly.
async fn ping_loop(
    sink: Arc<AsyncMutex<WsSink>>,
    mut pong_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    closing: Arc<AtomicBool>,
    reader: tokio::task::AbortHandle,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(PING_TIME_SECS));
    // The first tick fires immediately; the probe starts one period in.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if closing.load(Ordering::SeqCst) {
            break;
        }
        let payload = now_millis().to_string().into_bytes();
        if sink
            .lock()
            .await
            .send(Message::Ping(payload.clone()))
            .await
            .is_err()
        {
            break;
        }
        trace!(target = "transport", "ping sent");
        let answered = tokio::time::timeout(Duration::from_secs(PING_TIME_WAIT_SECS), async {
            while let Some(pong) = pong_rx.recv().await {
                if pong == payload {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false);
        if !answered {
            warn!(target = "transport", "pong missed, terminating websocket");
            reader.abort();
            let _ = events.send(TransportEvent::Closed {
                graceful: closing.load(Ordering::SeqCst),
            });
            break;
        }
        trace!(target = "transport", "pong received");
    }
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}
