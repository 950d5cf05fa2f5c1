//! Seams between the connection manager and the MQTT client library
//!
//! The manager only talks to these traits. [`MqttConnector`] is the rumqttc
//! implementation used by the binary; unit tests plug in an in-memory one.
//!
//! Implementations must not block and must not call a [`SessionListener`]
//! from inside `open`, `subscribe`, `publish` or `close`: the manager calls
//! them while holding its state lock.

use rumqttc::{AsyncClient, MqttOptions, QoS};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::driver::SessionDriver;
use super::{BrokerEndpoint, ConnectOptions};
use crate::error::LinkError;

/// Everything needed to open one broker session
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub endpoint: BrokerEndpoint,
    pub options: ConnectOptions,
    /// Fresh for every session so two controllers never collide on the broker
    pub client_id: String,
}

/// Callbacks from the transport, delivered on the transport's own task
pub trait SessionListener: Send + Sync {
    /// The broker accepted the session (first connect or a background reconnect)
    fn on_connected(&self);

    /// The initial connect failed. No further callbacks follow.
    fn on_connect_failed(&self, reason: String);

    /// An established session dropped; the transport keeps reconnecting
    fn on_connection_lost(&self, reason: String);

    fn on_message(&self, topic: &str, payload: &[u8]);
}

/// A live (or reconnecting) broker session
pub trait Session: Send + Sync {
    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), LinkError>;

    fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<(), LinkError>;

    /// Tears the session down and stops any background reconnects
    fn close(&self);
}

/// Opens sessions against a broker
pub trait Connector: Send + Sync {
    fn open(
        &self,
        request: SessionRequest,
        listener: Arc<dyn SessionListener>,
    ) -> Result<Arc<dyn Session>, LinkError>;
}

/// rumqttc-backed connector; each session gets its own driver task
#[derive(Debug, Clone)]
pub struct MqttConnector {
    runtime: Handle,
}

impl MqttConnector {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }

    /// Uses the runtime of the calling context
    pub fn current() -> Result<Self, LinkError> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| LinkError::ConnectFailure(format!("no tokio runtime available: {}", e)))
    }
}

impl Connector for MqttConnector {
    fn open(
        &self,
        request: SessionRequest,
        listener: Arc<dyn SessionListener>,
    ) -> Result<Arc<dyn Session>, LinkError> {
        request.endpoint.validate()?;

        let mut mqtt_options = MqttOptions::new(
            request.client_id.clone(),
            request.endpoint.host.clone(),
            request.endpoint.port,
        );
        mqtt_options
            .set_keep_alive(request.options.effective_keep_alive())
            .set_clean_session(true);
        if let Some((user, pw)) = request.options.credentials() {
            mqtt_options.set_credentials(user, pw);
        }

        let (client, event_loop) = AsyncClient::new(mqtt_options, request.options.request_capacity);
        let shutdown = CancellationToken::new();

        let driver = SessionDriver::create(
            event_loop,
            listener,
            request.options.reconnect_delay,
            shutdown.clone(),
        );

        info!(
            "Opening MQTT session {} to {}",
            request.client_id,
            request.endpoint.url()
        );
        self.runtime.spawn(driver.run());

        Ok(Arc::new(MqttSession {
            client,
            shutdown,
            client_id: request.client_id,
        }))
    }
}

/// Handle to a rumqttc session; requests are queued, never awaited
pub struct MqttSession {
    client: AsyncClient,
    shutdown: CancellationToken,
    client_id: String,
}

impl Session for MqttSession {
    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), LinkError> {
        self.client
            .try_subscribe(topic, qos)
            .map_err(|e| LinkError::SubscribeFailure(format!("{}: {}", topic, e)))?;
        debug!("Queued subscription to {} ({:?})", topic, qos);
        Ok(())
    }

    fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<(), LinkError> {
        if self.shutdown.is_cancelled() {
            return Err(LinkError::PublishFailure("session closed".to_string()));
        }
        self.client
            .try_publish(topic, qos, false, payload)
            .map_err(|e| LinkError::PublishFailure(e.to_string()))
    }

    fn close(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!("Closing MQTT session {}", self.client_id);
        if let Err(e) = self.client.try_disconnect() {
            warn!("Could not queue DISCONNECT for {}: {}", self.client_id, e);
        }
        self.shutdown.cancel();
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
