//! Client configuration: server addresses, transport tuning, and the
//! circular address rotation used by the reconnect loop.

use crate::errors::Error;
use serde::Deserialize;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const DEFAULT_RETRY_TIME_SECS: u64 = 10;
pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_KA_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_WS_HANDSHAKE_TIMEOUT_MS: u64 = 5000;

/// One gateway endpoint and the credentials it expects.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerAddress {
    pub url: String,
    #[serde(default)]
    pub apisecret: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

impl ServerAddress {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            apisecret: None,
            token: None,
        }
    }
}

/// WebSocket socket options.
#[derive(Debug, Clone, Deserialize)]
pub struct WsOptions {
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
}

fn default_handshake_timeout() -> u64 {
    DEFAULT_WS_HANDSHAKE_TIMEOUT_MS
}

impl Default for WsOptions {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: DEFAULT_WS_HANDSHAKE_TIMEOUT_MS,
        }
    }
}

/// Accepts either a single address object or an ordered list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum AddressField {
    One(ServerAddress),
    Many(Vec<ServerAddress>),
}

impl From<AddressField> for Vec<ServerAddress> {
    fn from(field: AddressField) -> Self {
        match field {
            AddressField::One(address) => vec![address],
            AddressField::Many(list) => list,
        }
    }
}

/// Raw configuration object as recognized from JSON.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfig {
    address: AddressField,
    #[serde(default)]
    pub server_key: Option<String>,
    #[serde(default)]
    pub retry_time_secs: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub is_admin: Option<bool>,
    #[serde(default)]
    pub ws_options: Option<WsOptions>,
    #[serde(default)]
    pub ka_interval_secs: Option<u64>,
}

/// Validated configuration consumed by [`crate::Connection::open`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub addresses: Vec<ServerAddress>,
    pub retry_time_secs: u64,
    pub max_retries: u32,
    pub is_admin: bool,
    pub ws_options: WsOptions,
    pub ka_interval_secs: u64,
}

impl ClientConfig {
    pub fn new(address: ServerAddress) -> Self {
        Self::with_addresses(vec![address])
    }

    pub fn with_addresses(addresses: Vec<ServerAddress>) -> Self {
        Self {
            addresses,
            retry_time_secs: DEFAULT_RETRY_TIME_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            is_admin: false,
            ws_options: WsOptions::default(),
            ka_interval_secs: DEFAULT_KA_INTERVAL_SECS,
        }
    }

    pub fn admin(mut self) -> Self {
        self.is_admin = true;
        self
    }

    /// Parse a JSON configuration object.
    pub fn from_value(raw: Value) -> Result<Self, Error> {
        let raw: RawConfig = serde_json::from_value(raw)?;
        let config = Self::from_raw(raw);
        config.validate()?;
        Ok(config)
    }

    fn from_raw(raw: RawConfig) -> Self {
        Self {
            addresses: raw.address.into(),
            retry_time_secs: raw.retry_time_secs.unwrap_or(DEFAULT_RETRY_TIME_SECS),
            max_retries: raw.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            is_admin: raw.is_admin.unwrap_or(false),
            ws_options: raw.ws_options.unwrap_or_default(),
            ka_interval_secs: raw.ka_interval_secs.unwrap_or(DEFAULT_KA_INTERVAL_SECS),
        }
    }

    /// The address list must be non-empty and every entry must carry a url.
    pub fn validate(&self) -> Result<(), Error> {
        if self.addresses.is_empty() {
            return Err(Error::NoAddresses);
        }
        for address in &self.addresses {
            if address.url.is_empty() {
                return Err(Error::InvalidAddress {
                    url: String::new(),
                    reason: "empty url".into(),
                });
            }
        }
        Ok(())
    }
}

/// Select one server entry out of a multi-server table.
///
/// `key` may be a numeric index or a string label; a missing or unmatched
/// key falls back to index 0. Accepts both arrays and keyed objects.
pub fn select_server<'a>(servers: &'a Value, key: Option<&str>) -> Option<&'a Value> {
    match servers {
        Value::Array(list) => {
            let index = key
                .and_then(|k| k.parse::<usize>().ok())
                .filter(|i| *i < list.len())
                .unwrap_or(0);
            list.get(index)
        }
        Value::Object(map) => match key.and_then(|k| map.get(k)) {
            Some(entry) => Some(entry),
            None => map.values().next(),
        },
        _ => None,
    }
}

/// Circular walk over the configured addresses.
///
/// `current()` returns the entry selected for the next open attempt;
/// `advance()` moves to the following entry (wrapping) and returns it.
#[derive(Debug)]
pub struct AddressPool {
    addresses: Vec<ServerAddress>,
    index: AtomicUsize,
}

impl AddressPool {
    pub fn new(addresses: Vec<ServerAddress>) -> Self {
        Self {
            addresses,
            index: AtomicUsize::new(0),
        }
    }

    pub fn current(&self) -> ServerAddress {
        self.addresses[self.index.load(Ordering::Relaxed) % self.addresses.len()].clone()
    }

    pub fn advance(&self) -> ServerAddress {
        let next = self.index.fetch_add(1, Ordering::Relaxed) + 1;
        self.addresses[next % self.addresses.len()].clone()
    }

    pub fn position(&self) -> usize {
        self.index.load(Ordering::Relaxed) % self.addresses.len()
    }
}
