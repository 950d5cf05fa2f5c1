//! Operator side of a remote-controlled car that talks over MQTT.
//!
//! The car publishes telemetry and status on `iot-car/<device>/…` and listens
//! for drive commands. [`ConnectionManager`] owns the broker session and
//! exposes the car's latest state as watch channels.

pub mod config;
pub mod error;
pub mod mqtt;

pub use config::AppConfig;
pub use error::{ErrorEvent, LinkError, Operation};
pub use mqtt::codec::{CommandMessage, DeviceStatus, DriveAction, TelemetryReading};
pub use mqtt::manager::ConnectionManager;
pub use mqtt::{BrokerEndpoint, ConnectOptions, ConnectionState};
