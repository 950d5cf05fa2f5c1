//! Event sink: the boundary the surrounding application observes
//!
//! Four independent `watch` channels, one per notification kind. A watch
//! channel only holds the latest value, so a slow renderer never builds a
//! backlog of telemetry, and a receiver created with `subscribe_*` only wakes
//! up for values sent after it attached.
//!
//! ```text
//! transport task ──► EventSink ──► watch::Receiver<ConnectionState>
//!                              ├─► watch::Receiver<TelemetryReading>
//!                              ├─► watch::Receiver<DeviceStatus>
//!                              └─► watch::Receiver<Option<ErrorEvent>>
//! ```

use tokio::sync::watch;
use tracing::debug;

use super::codec::{DeviceStatus, TelemetryReading};
use super::ConnectionState;
use crate::error::ErrorEvent;

#[derive(Debug)]
pub struct EventSink {
    connection: watch::Sender<ConnectionState>,
    telemetry: watch::Sender<TelemetryReading>,
    status: watch::Sender<DeviceStatus>,
    errors: watch::Sender<Option<ErrorEvent>>,
}

impl EventSink {
    pub fn new() -> Self {
        let (connection, _) = watch::channel(ConnectionState::Disconnected);
        let (telemetry, _) = watch::channel(TelemetryReading::reset());
        let (status, _) = watch::channel(DeviceStatus::default());
        let (errors, _) = watch::channel(None);

        Self {
            connection,
            telemetry,
            status,
            errors,
        }
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }

    pub fn subscribe_telemetry(&self) -> watch::Receiver<TelemetryReading> {
        self.telemetry.subscribe()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<DeviceStatus> {
        self.status.subscribe()
    }

    pub fn subscribe_errors(&self) -> watch::Receiver<Option<ErrorEvent>> {
        self.errors.subscribe()
    }

    /// Publishes a connection state. Repeating the current state notifies nobody.
    pub fn emit_connection(&self, state: ConnectionState) -> bool {
        let changed = self.connection.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            debug!("Connection state -> {:?}", state);
        }
        changed
    }

    pub fn emit_telemetry(&self, reading: TelemetryReading) {
        self.telemetry.send_replace(reading);
    }

    pub fn emit_status(&self, status: DeviceStatus) {
        self.status.send_replace(status);
    }

    pub fn emit_error(&self, event: ErrorEvent) {
        self.errors.send_replace(Some(event));
    }

    /// Telemetry and status go back to their "no data" values
    pub fn emit_reset(&self) {
        self.emit_telemetry(TelemetryReading::reset());
        self.emit_status(DeviceStatus::default());
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    pub fn latest_telemetry(&self) -> TelemetryReading {
        self.telemetry.borrow().clone()
    }

    pub fn latest_status(&self) -> DeviceStatus {
        self.status.borrow().clone()
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{LinkError, Operation};

    #[test]
    fn test_late_observer_sees_only_future_values() {
        let sink = EventSink::new();
        sink.emit_connection(ConnectionState::Connecting);

        let mut rx = sink.subscribe_connection();
        assert!(!rx.has_changed().unwrap());

        sink.emit_connection(ConnectionState::Connected);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), ConnectionState::Connected);
    }

    #[test]
    fn test_repeated_state_is_not_re_sent() {
        let sink = EventSink::new();
        let mut rx = sink.subscribe_connection();

        assert!(!sink.emit_connection(ConnectionState::Disconnected));
        assert!(!rx.has_changed().unwrap());

        assert!(sink.emit_connection(ConnectionState::Connecting));
        rx.borrow_and_update();
        assert!(!sink.emit_connection(ConnectionState::Connecting));
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_connection_state_tracks_last_emit() {
        let sink = EventSink::new();
        assert_eq!(sink.connection_state(), ConnectionState::Disconnected);

        sink.emit_connection(ConnectionState::Connecting);
        sink.emit_connection(ConnectionState::Connected);
        assert_eq!(sink.connection_state(), ConnectionState::Connected);
    }

    #[test]
    fn test_most_recent_telemetry_wins() {
        let sink = EventSink::new();
        let mut rx = sink.subscribe_telemetry();

        for battery in [10, 20, 30] {
            let mut reading = TelemetryReading::reset();
            reading.battery_percent = battery;
            sink.emit_telemetry(reading);
        }

        assert_eq!(rx.borrow_and_update().battery_percent, 30);
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_emit_without_observers_does_not_fail() {
        let sink = EventSink::new();
        sink.emit_error(ErrorEvent::new(Operation::Publish, LinkError::NotConnected));
        sink.emit_status(DeviceStatus {
            device_id: "car-001".into(),
            status: "online".into(),
            firmware_version: "1.0".into(),
        });
        assert!(sink.latest_status().is_online());
    }

    #[tokio::test]
    async fn test_observer_on_another_task() {
        let sink = std::sync::Arc::new(EventSink::new());
        let mut rx = sink.subscribe_errors();

        let observer = tokio::spawn(async move {
            rx.changed().await.unwrap();
            rx.borrow_and_update().clone()
        });

        let producer = sink.clone();
        std::thread::spawn(move || {
            producer.emit_error(ErrorEvent::new(
                Operation::Connection,
                LinkError::ConnectionLost("eof".into()),
            ));
        })
        .join()
        .unwrap();

        let event = observer.await.unwrap().unwrap();
        assert_eq!(event.operation, Operation::Connection);
    }
}
