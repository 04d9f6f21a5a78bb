//! Transport abstraction over the gateway link.
//!
//! A transport moves JSON envelopes over one physical channel and reports
//! inbound traffic plus closure through a [`TransportEvent`] channel handed
//! to it at construction. The concrete variant is chosen by the URL scheme
//! of the first configured address; [`ConnectionTransport`] wraps it with
//! the retry/failover walk over the address pool.

use crate::config::{AddressPool, ClientConfig, ServerAddress};
use crate::errors::Error;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;

pub mod mock;
pub mod unix;
pub mod websocket;

/// Traffic surfaced by a transport to its connection.
#[derive(Debug)]
pub enum TransportEvent {
    /// A parsed inbound envelope.
    Message(Value),
    /// The channel is gone; `graceful` distinguishes a user-initiated close
    /// from an unexpected drop.
    Closed { graceful: bool },
}

/// One bidirectional JSON channel to the gateway.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the channel against one address. Called again with the next
    /// address by the failover loop when an attempt fails.
    async fn open(&self, address: &ServerAddress) -> Result<(), Error>;

    /// Graceful close.
    async fn close(&self) -> Result<(), Error>;

    /// Serialize the envelope and perform one write.
    async fn send(&self, message: &Value) -> Result<(), Error>;

    fn remote_hostname(&self) -> Option<String>;
}

/// Build the concrete transport for a configuration.
pub(crate) fn from_config(
    config: &ClientConfig,
    events: mpsc::UnboundedSender<TransportEvent>,
) -> Box<dyn Transport> {
    let scheme = config
        .addresses
        .first()
        .and_then(|address| Url::parse(&address.url).ok())
        .map(|url| url.scheme().to_string())
        .unwrap_or_default();
    match scheme.as_str() {
        "ws" | "wss" | "ws+unix" | "wss+unix" => {
            Box::new(websocket::WebSocketTransport::new(config, events))
        }
        "file" => Box::new(unix::UnixTransport::new(events)),
        other => {
            warn!(target = "transport", scheme = other, "no transport for scheme");
            Box::new(UnsupportedTransport)
        }
    }
}

/// Placeholder used when no transport matches the configured scheme. Every
/// operation fails by naming itself.
struct UnsupportedTransport;

#[async_trait]
impl Transport for UnsupportedTransport {
    async fn open(&self, _address: &ServerAddress) -> Result<(), Error> {
        Err(Error::Unsupported("open"))
    }

    async fn close(&self) -> Result<(), Error> {
        Err(Error::Unsupported("close"))
    }

    async fn send(&self, _message: &Value) -> Result<(), Error> {
        Err(Error::Unsupported("send"))
    }

    fn remote_hostname(&self) -> Option<String> {
        None
    }
}

/// The connection-facing wrapper: owns the concrete transport, the address
/// walk and the open/closed status flags.
pub(crate) struct ConnectionTransport {
    inner: Box<dyn Transport>,
    pool: Arc<AddressPool>,
    retry_time: Duration,
    max_retries: u32,
    opened: AtomicBool,
    closing: AtomicBool,
}

impl ConnectionTransport {
    pub(crate) fn new(
        inner: Box<dyn Transport>,
        pool: Arc<AddressPool>,
        config: &ClientConfig,
    ) -> Self {
        Self {
            inner,
            pool,
            retry_time: Duration::from_secs(config.retry_time_secs),
            max_retries: config.max_retries,
            opened: AtomicBool::new(false),
            closing: AtomicBool::new(false),
        }
    }

    /// Drive the open with retry/failover: every failed attempt advances the
    /// address pool; after `max_retries + 1` attempts the last error
    /// propagates. A close issued mid-retry aborts the loop.
    pub(crate) async fn attempt_open(&self) -> Result<(), Error> {
        self.opened.store(false, Ordering::SeqCst);
        let mut attempts: u32 = 0;
        loop {
            if self.closing.load(Ordering::SeqCst) {
                return Err(Error::ConnectionClosed);
            }
            let address = self.pool.current();
            debug!(
                target = "transport",
                url = %address.url,
                attempt = attempts + 1,
                "opening transport"
            );
            match self.inner.open(&address).await {
                Ok(()) => {
                    self.opened.store(true, Ordering::SeqCst);
                    return Ok(());
                }
                Err(err) => {
                    attempts += 1;
                    self.pool.advance();
                    if attempts >= self.max_retries + 1 {
                        warn!(
                            target = "transport",
                            url = %address.url,
                            attempts,
                            error = %err,
                            "giving up on transport open"
                        );
                        return Err(err);
                    }
                    warn!(
                        target = "transport",
                        url = %address.url,
                        error = %err,
                        retry_in_secs = self.retry_time.as_secs(),
                        "transport open failed, trying next address"
                    );
                    tokio::time::sleep(self.retry_time).await;
                }
            }
        }
    }

    pub(crate) async fn close(&self) -> Result<(), Error> {
        self.closing.store(true, Ordering::SeqCst);
        self.inner.close().await
    }

    pub(crate) async fn send(&self, message: &Value) -> Result<(), Error> {
        if !self.opened.load(Ordering::SeqCst) || self.closing.load(Ordering::SeqCst) {
            return Err(Error::NotOpened);
        }
        self.inner.send(message).await
    }

    pub(crate) fn remote_hostname(&self) -> Option<String> {
        self.inner.remote_hostname()
    }
}
