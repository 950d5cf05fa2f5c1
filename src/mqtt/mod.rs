//! # MQTT Link Module
//!
//! Owns everything between the operator and the car's broker: the session
//! lifecycle, the topic layout, the wire payloads, and the typed event
//! channels the surrounding application renders.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── codec.rs      - Wire payloads <-> typed values
//! ├── topics.rs     - iot-car/<device>/<channel> layout and inbound routing
//! ├── events.rs     - Latest-value notification channels
//! ├── transport.rs  - Connector / Session / SessionListener seams
//! ├── driver.rs     - rumqttc session driver (statum state machine)
//! ├── publisher.rs  - Drive command publishing
//! └── manager.rs    - Connection state machine
//! ```
//!
//! ## Control Flow
//!
//! ```text
//! connect() ──► Connector::open ──► driver task ──► on_connected ──► subscribe
//!                                        │
//!                      on_message ◄──────┘
//!                          │
//!                   classify + decode ──► EventSink ──► application
//!
//! send(action) ──► CommandMessage ──► encode ──► Session::publish (QoS 1)
//! ```
//!
//! The surrounding application supplies a [`BrokerEndpoint`] and
//! [`ConnectOptions`] on every `connect()`; nothing in here persists them.

pub mod codec;
pub mod driver;
pub mod events;
pub mod manager;
pub mod publisher;
pub mod topics;
pub mod transport;

#[cfg(test)]
pub(crate) mod mock;

use std::fmt;
use std::time::Duration;

use crate::error::LinkError;

pub const DEFAULT_PORT: u16 = 1883;

/// rumqttc rejects keep-alive intervals below five seconds
pub const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

/// Lifecycle of the broker session as seen by the application
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        write!(f, "{}", text)
    }
}

/// Where the broker is and which car to talk to.
///
/// Read once per `connect()`; changing it means disconnecting and connecting again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub device_id: String,
}

impl BrokerEndpoint {
    pub fn new(host: impl Into<String>, port: u16, device_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            device_id: device_id.into(),
        }
    }

    /// Parses `tcp://host[:port]` (the scheme is optional, the port defaults to 1883)
    pub fn parse(url: &str, device_id: impl Into<String>) -> Result<Self, LinkError> {
        let device_id = device_id.into();
        let address = url.trim();
        let address = match address.split_once("://") {
            Some(("tcp", rest)) | Some(("mqtt", rest)) => rest,
            Some((scheme, _)) => {
                return Err(LinkError::InvalidEndpoint(format!(
                    "unsupported scheme '{}'",
                    scheme
                )))
            }
            None => address,
        };
        let address = address.trim_end_matches('/');

        let (host, port) = match address.strip_prefix('[') {
            // Bracketed IPv6 literal, `[::1]` or `[::1]:1883`
            Some(rest) => {
                let (host, tail) = rest.split_once(']').ok_or_else(|| {
                    LinkError::InvalidEndpoint(format!("unterminated IPv6 address '{}'", address))
                })?;
                let port = match tail.strip_prefix(':') {
                    Some(port) => parse_port(port)?,
                    None if tail.is_empty() => DEFAULT_PORT,
                    None => {
                        return Err(LinkError::InvalidEndpoint(format!(
                            "unexpected '{}' after IPv6 address",
                            tail
                        )))
                    }
                };
                (host, port)
            }
            None => match address.rsplit_once(':') {
                Some((host, port)) => (host, parse_port(port)?),
                None => (address, DEFAULT_PORT),
            },
        };

        let endpoint = Self::new(host, port, device_id);
        endpoint.validate()?;
        Ok(endpoint)
    }

    pub fn validate(&self) -> Result<(), LinkError> {
        if self.host.trim().is_empty() {
            return Err(LinkError::InvalidEndpoint("empty broker host".to_string()));
        }
        if self.port == 0 {
            return Err(LinkError::InvalidEndpoint("port 0".to_string()));
        }
        if self.device_id.trim().is_empty() {
            return Err(LinkError::InvalidEndpoint("empty device id".to_string()));
        }
        if self.device_id.contains(['/', '+', '#']) {
            return Err(LinkError::InvalidEndpoint(format!(
                "device id '{}' contains topic separators or wildcards",
                self.device_id
            )));
        }
        Ok(())
    }

    pub fn url(&self) -> String {
        if self.host.contains(':') {
            format!("tcp://[{}]:{}", self.host, self.port)
        } else {
            format!("tcp://{}:{}", self.host, self.port)
        }
    }
}

fn parse_port(port: &str) -> Result<u16, LinkError> {
    port.parse::<u16>()
        .map_err(|e| LinkError::InvalidEndpoint(format!("invalid port '{}': {}", port, e)))
}

impl fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.url(), self.device_id)
    }
}

/// Session options that do not change the state machine
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Anonymous access is the baseline; credentials are passed only when both are set
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    /// Pause between background reconnect attempts after a lost connection
    pub reconnect_delay: Duration,
    /// Capacity of the transport's outgoing request queue
    pub request_capacity: usize,
}

impl ConnectOptions {
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(user), Some(pw)) if !user.is_empty() => Some((user, pw)),
            _ => None,
        }
    }

    pub fn effective_keep_alive(&self) -> Duration {
        self.keep_alive.max(MIN_KEEP_ALIVE)
    }
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            keep_alive: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(2),
            request_capacity: 10,
        }
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("keep_alive", &self.keep_alive)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("request_capacity", &self.request_capacity)
            .finish()
    }
}
