//! Client adapter for the Janus WebRTC signaling gateway.
//!
//! The crate implements the protocol runtime: a Connection → Session →
//! Handle hierarchy multiplexing request/response transactions over one
//! WebSocket or Unix datagram link, with keepalive probing, async event
//! dispatch and cascading teardown.
//!
//! ```no_run
//! use pier::{ClientConfig, Connection, ServerAddress};
//!
//! # async fn run() -> Result<(), pier::Error> {
//! let config = ClientConfig::new(ServerAddress::new("ws://127.0.0.1:8188/janus"));
//! let connection = Connection::open(config).await?;
//! let session = connection.create(None).await?;
//! let handle = session.attach("janus.plugin.echotest", None).await?;
//! let _response = handle.message(serde_json::json!({ "audio": true }), None).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod errors;
pub mod events;
pub mod handle;
pub mod protocol;
pub mod session;
pub mod telemetry;
pub mod transport;

mod tid;
mod transaction;

pub use config::{ClientConfig, ServerAddress, WsOptions};
pub use connection::Connection;
pub use errors::Error;
pub use events::{
    ConnectionEvent, HandleEvent, MediaEvent, PluginEvent, SessionEvent, SlowlinkEvent,
    TrickleEvent,
};
pub use handle::{Handle, PluginHandler};
pub use session::Session;
