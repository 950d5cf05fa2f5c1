//! Connection manager: the broker session state machine
//!
//! # State Machine
//!
//! ```text
//!                 connect()
//! Disconnected ─────────────► Connecting
//!      ▲  ▲                     │     │
//!      │  │ connect failed      │     │ session established
//!      │  └─────────────────────┘     ▼      (subscribe telemetry QoS 0,
//!      │                          Connected          status QoS 1)
//!      │   disconnect() / lost        │
//!      └──────────────────────────────┘
//! ```
//!
//! After a lost connection the session stays open underneath and the
//! transport keeps reconnecting; a successful reconnect moves the manager back
//! to `Connected` and re-installs both subscriptions. `disconnect()` closes
//! that background session too.
//!
//! Every transition and the event it emits happen under one lock, so once
//! `disconnect()` returns no observer can see `Connected` or fresh telemetry
//! from the old session. Each opened session carries a generation number;
//! callbacks from an older generation are dropped.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::codec::{
    decode_status, decode_telemetry, CommandMessage, DeviceStatus, DriveAction, TelemetryReading,
};
use super::events::EventSink;
use super::publisher::CommandPublisher;
use super::topics::{classify, topics_for, Channel, DeviceTopics};
use super::transport::{Connector, MqttConnector, Session, SessionListener, SessionRequest};
use super::{BrokerEndpoint, ConnectOptions, ConnectionState};
use crate::error::{ErrorEvent, LinkError, Operation};

const CLIENT_ID_PREFIX: &str = "carlink";

/// The session currently owned by the manager
struct ActiveLink {
    session: Arc<dyn Session>,
    endpoint: BrokerEndpoint,
    topics: DeviceTopics,
}

struct Machine {
    state: ConnectionState,
    generation: u64,
    link: Option<ActiveLink>,
    last_command: Option<CommandMessage>,
}

struct Shared {
    connector: Box<dyn Connector>,
    events: EventSink,
    machine: Mutex<Machine>,
}

/// Owns the broker session for one car and exposes its events.
///
/// Cheap to clone; all clones drive the same session. Every method is
/// synchronous and non-blocking, so it can be called from a UI thread or from
/// inside a tokio task alike.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(connector: impl Connector + 'static) -> Self {
        Self {
            shared: Arc::new(Shared {
                connector: Box::new(connector),
                events: EventSink::new(),
                machine: Mutex::new(Machine {
                    state: ConnectionState::Disconnected,
                    generation: 0,
                    link: None,
                    last_command: None,
                }),
            }),
        }
    }

    /// Manager backed by rumqttc on the current tokio runtime
    pub fn with_mqtt() -> Result<Self, LinkError> {
        Ok(Self::new(MqttConnector::current()?))
    }

    /// Starts a session to `endpoint`.
    ///
    /// Returns once the session is opening; the outcome arrives on the
    /// connection and error channels. Calling it while connecting or
    /// connected is a no-op.
    pub fn connect(
        &self,
        endpoint: BrokerEndpoint,
        options: ConnectOptions,
    ) -> Result<(), LinkError> {
        if let Err(e) = endpoint.validate() {
            warn!("Refusing to connect: {}", e);
            self.shared.events.emit_error(ErrorEvent::new(Operation::Connect, e.clone()));
            return Err(e);
        }

        let mut guard = self.shared.machine.lock();
        let machine = &mut *guard;

        if machine.state != ConnectionState::Disconnected {
            debug!("connect() ignored, already {}", machine.state);
            return Ok(());
        }

        if let Some(stale) = machine.link.take() {
            info!("Dropping background reconnect to {}", stale.endpoint);
            stale.session.close();
        }

        machine.generation += 1;
        let generation = machine.generation;
        let request = SessionRequest {
            endpoint: endpoint.clone(),
            options,
            client_id: fresh_client_id(),
        };
        let listener = Arc::new(LinkListener {
            shared: Arc::downgrade(&self.shared),
            generation,
        });

        info!("Connecting to {} as {}", endpoint, request.client_id);
        machine.state = ConnectionState::Connecting;
        self.shared.events.emit_connection(ConnectionState::Connecting);

        match self.shared.connector.open(request, listener) {
            Ok(session) => {
                machine.link = Some(ActiveLink {
                    session,
                    topics: topics_for(&endpoint.device_id),
                    endpoint,
                });
                Ok(())
            }
            Err(e) => {
                let e = match e {
                    LinkError::ConnectFailure(_) | LinkError::InvalidEndpoint(_) => e,
                    other => LinkError::ConnectFailure(other.to_string()),
                };
                error!("Could not open session: {}", e);
                machine.state = ConnectionState::Disconnected;
                self.shared.events.emit_connection(ConnectionState::Disconnected);
                self.shared.events.emit_error(ErrorEvent::new(Operation::Connect, e.clone()));
                Err(e)
            }
        }
    }

    /// Closes the session. Safe to call in any state; never reports an error.
    pub fn disconnect(&self) {
        let mut guard = self.shared.machine.lock();
        let machine = &mut *guard;

        match machine.state {
            ConnectionState::Connected => {
                if let Some(link) = machine.link.take() {
                    info!("Disconnecting from {}", link.endpoint);
                    link.session.close();
                }
                machine.generation += 1;
                machine.state = ConnectionState::Disconnected;
                self.shared.events.emit_connection(ConnectionState::Disconnected);
                self.shared.events.emit_reset();
            }
            ConnectionState::Connecting => {
                debug!("disconnect() ignored while connecting");
            }
            ConnectionState::Disconnected => {
                if let Some(link) = machine.link.take() {
                    info!("Stopping background reconnect to {}", link.endpoint);
                    link.session.close();
                    machine.generation += 1;
                } else {
                    debug!("disconnect() ignored, already disconnected");
                }
            }
        }
    }

    /// Publishes `action` to the car with a fresh command id.
    ///
    /// Unknown actions are sent as they are. Without a connected session the
    /// command is dropped and `NotConnected` is reported.
    pub fn send(&self, action: &str) -> Result<CommandMessage, LinkError> {
        let mut guard = self.shared.machine.lock();
        let machine = &mut *guard;

        let link = match (&machine.state, machine.link.as_ref()) {
            (ConnectionState::Connected, Some(link)) => link,
            _ => {
                warn!("Dropping command '{}': not connected", action);
                self.shared
                    .events
                    .emit_error(ErrorEvent::new(Operation::Publish, LinkError::NotConnected));
                return Err(LinkError::NotConnected);
            }
        };

        match CommandPublisher::new(link.session.as_ref(), &link.topics.command).send(action) {
            Ok(command) => {
                machine.last_command = Some(command.clone());
                Ok(command)
            }
            Err(e) => {
                error!("Command '{}' failed: {}", action, e);
                self.shared.events.emit_error(ErrorEvent::new(Operation::Publish, e.clone()));
                Err(e)
            }
        }
    }

    pub fn drive(&self, action: DriveAction) -> Result<CommandMessage, LinkError> {
        self.send(action.as_str())
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.machine.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Endpoint of the session currently owned, if any
    pub fn endpoint(&self) -> Option<BrokerEndpoint> {
        self.shared
            .machine
            .lock()
            .link
            .as_ref()
            .map(|link| link.endpoint.clone())
    }

    pub fn last_command(&self) -> Option<CommandMessage> {
        self.shared.machine.lock().last_command.clone()
    }

    pub fn events(&self) -> &EventSink {
        &self.shared.events
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.shared.events.subscribe_connection()
    }

    pub fn subscribe_telemetry(&self) -> watch::Receiver<TelemetryReading> {
        self.shared.events.subscribe_telemetry()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<DeviceStatus> {
        self.shared.events.subscribe_status()
    }

    pub fn subscribe_errors(&self) -> watch::Receiver<Option<ErrorEvent>> {
        self.shared.events.subscribe_errors()
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(link) = self.machine.get_mut().link.take() {
            link.session.close();
        }
    }
}

impl Shared {
    fn handle_connected(&self, generation: u64) {
        let mut guard = self.machine.lock();
        let machine = &mut *guard;

        if machine.generation != generation {
            debug!("Ignoring connect from superseded session {}", generation);
            return;
        }
        let Some(link) = machine.link.as_ref() else {
            return;
        };
        if machine.state == ConnectionState::Connected {
            return;
        }

        info!("Connected to {}", link.endpoint);
        machine.state = ConnectionState::Connected;
        self.events.emit_connection(ConnectionState::Connected);

        for (topic, qos) in link.topics.subscriptions() {
            match link.session.subscribe(topic, qos) {
                Ok(()) => info!("Subscribed to {} ({:?})", topic, qos),
                Err(e) => {
                    error!("Subscription to {} failed: {}", topic, e);
                    self.events.emit_error(ErrorEvent::new(Operation::Subscribe, e));
                }
            }
        }
    }

    fn handle_connect_failed(&self, generation: u64, reason: String) {
        let mut guard = self.machine.lock();
        let machine = &mut *guard;

        if machine.generation != generation || machine.state != ConnectionState::Connecting {
            debug!("Ignoring connect failure from session {}: {}", generation, reason);
            return;
        }

        error!("Connect failed: {}", reason);
        machine.link = None;
        machine.state = ConnectionState::Disconnected;
        self.events.emit_connection(ConnectionState::Disconnected);
        self.events.emit_error(ErrorEvent::new(
            Operation::Connect,
            LinkError::ConnectFailure(reason),
        ));
    }

    fn handle_connection_lost(&self, generation: u64, reason: String) {
        let mut guard = self.machine.lock();
        let machine = &mut *guard;

        if machine.generation != generation || machine.state != ConnectionState::Connected {
            debug!("Ignoring connection loss from session {}: {}", generation, reason);
            return;
        }

        warn!("Connection lost, reconnecting in the background: {}", reason);
        machine.state = ConnectionState::Disconnected;
        self.events.emit_connection(ConnectionState::Disconnected);
        self.events.emit_reset();
        self.events.emit_error(ErrorEvent::new(
            Operation::Connection,
            LinkError::ConnectionLost(reason),
        ));
    }

    fn handle_message(&self, generation: u64, topic: &str, payload: &[u8]) {
        let machine = self.machine.lock();

        if machine.generation != generation || machine.state != ConnectionState::Connected {
            debug!("Dropping stray message on {}", topic);
            return;
        }

        let decoded = match classify(topic) {
            Some(Channel::Telemetry) => decode_telemetry(payload).map(|reading| {
                debug!("Telemetry: {}", reading);
                self.events.emit_telemetry(reading);
            }),
            Some(Channel::Status) => decode_status(payload).map(|status| {
                info!("Device status: {}", status);
                self.events.emit_status(status);
            }),
            Some(Channel::Command) | None => {
                debug!("Ignoring message on unrouted topic {}", topic);
                Ok(())
            }
        };

        if let Err(e) = decoded {
            warn!("Dropping message on {}: {}", topic, e);
            self.events.emit_error(ErrorEvent::new(Operation::Receive, e));
        }
    }
}

/// Listener handed to the transport for one session generation
struct LinkListener {
    shared: Weak<Shared>,
    generation: u64,
}

impl SessionListener for LinkListener {
    fn on_connected(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.handle_connected(self.generation);
        }
    }

    fn on_connect_failed(&self, reason: String) {
        if let Some(shared) = self.shared.upgrade() {
            shared.handle_connect_failed(self.generation, reason);
        }
    }

    fn on_connection_lost(&self, reason: String) {
        if let Some(shared) = self.shared.upgrade() {
            shared.handle_connection_lost(self.generation, reason);
        }
    }

    fn on_message(&self, topic: &str, payload: &[u8]) {
        if let Some(shared) = self.shared.upgrade() {
            shared.handle_message(self.generation, topic, payload);
        }
    }
}

fn fresh_client_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", CLIENT_ID_PREFIX, &suffix[..12])
}
