//! Session driver with statum state machine for the rumqttc event loop
//!
//! One driver task per session. It polls the rumqttc `EventLoop` and turns
//! what it sees into [`SessionListener`] callbacks.
//!
//! # State Machine
//!
//! ```text
//! Dialing ──(ConnAck)──► Online ──(cancel)──► Closed
//!    │                   │    ▲
//!    │ (error)           │    │ (ConnAck after reconnect)
//!    ▼                   ▼    │
//!  ended            offline, retry every reconnect_delay
//! ```
//!
//! A failed initial connect ends the task after one `on_connect_failed`.
//! Once online, losing the broker is reported once with `on_connection_lost`
//! and the loop keeps polling; rumqttc reconnects on the next poll.

use rumqttc::{Event, EventLoop, Incoming, Outgoing};
use statum::{machine, state};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::transport::SessionListener;

/// Upper bound for flushing the DISCONNECT packet on shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// States for the session driver lifecycle using statum
#[state]
#[derive(Debug, Clone)]
pub enum DriverState {
    Dialing, // Waiting for the first ConnAck
    Online,  // Session established at least once, forwarding traffic
    Closed,  // Shutdown requested, flushing DISCONNECT
}

#[machine]
pub struct SessionDriver<S: DriverState> {
    event_loop: EventLoop,
    listener: Arc<dyn SessionListener>,
    reconnect_delay: Duration,
    shutdown: CancellationToken,
}

impl SessionDriver<Dialing> {
    pub fn create(
        event_loop: EventLoop,
        listener: Arc<dyn SessionListener>,
        reconnect_delay: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self::new(event_loop, listener, reconnect_delay, shutdown)
    }

    /// Drives the whole session; this is the body of the spawned task
    pub async fn run(self) {
        if let Some(online) = self.dial().await {
            let closed = online.run_until_shutdown().await;
            closed.drain().await;
        }
        debug!("Session driver finished");
    }

    /// Polls until the broker accepts the session.
    ///
    /// Returns `None` when the connect failed (after reporting it) or when the
    /// session was closed before it was established.
    pub async fn dial(mut self) -> Option<SessionDriver<Online>> {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("Session closed while dialing");
                    return None;
                }

                event = self.event_loop.poll() => match event {
                    Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                        info!("Broker accepted session ({:?})", ack.code);
                        self.listener.on_connected();
                        return Some(self.transition());
                    }
                    Ok(other) => {
                        debug!("Event before ConnAck: {:?}", other);
                    }
                    Err(e) => {
                        warn!("Initial connect failed: {}", e);
                        self.listener.on_connect_failed(e.to_string());
                        return None;
                    }
                }
            }
        }
    }
}

impl SessionDriver<Online> {
    /// Forwards inbound traffic until the session is closed
    pub async fn run_until_shutdown(mut self) -> SessionDriver<Closed> {
        let mut online = true;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown requested for MQTT session");
                    break;
                }

                event = self.event_loop.poll() => match event {
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        self.listener.on_message(&publish.topic, &publish.payload);
                    }
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        if !online {
                            info!("Reconnected to broker");
                            online = true;
                            self.listener.on_connected();
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if online {
                            warn!("MQTT connection lost: {}", e);
                            online = false;
                            self.listener.on_connection_lost(e.to_string());
                        } else {
                            debug!("Reconnect attempt failed: {}", e);
                        }

                        tokio::select! {
                            _ = self.shutdown.cancelled() => break,
                            _ = tokio::time::sleep(self.reconnect_delay) => {}
                        }
                    }
                }
            }
        }

        self.transition()
    }
}

impl SessionDriver<Closed> {
    /// Gives rumqttc a bounded chance to send the queued DISCONNECT
    pub async fn drain(mut self) {
        let flushed = tokio::time::timeout(DRAIN_TIMEOUT, async {
            loop {
                match self.event_loop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => return true,
                    Ok(_) => {}
                    Err(_) => return false,
                }
            }
        })
        .await;

        match flushed {
            Ok(true) => debug!("DISCONNECT sent"),
            Ok(false) => debug!("Session already gone while closing"),
            Err(_) => debug!("Timed out flushing DISCONNECT"),
        }
    }
}
