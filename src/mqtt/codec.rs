//! Message codec for the car's wire payloads
//!
//! Outbound commands are encoded as compact JSON with exactly two fields,
//! `action` and `command_id`. Inbound telemetry and status payloads are decoded
//! field by field with a default for everything that is missing or has the
//! wrong type, so only a payload that is not a JSON object at all fails.

use chrono::{DateTime, Local};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

use crate::error::LinkError;

/// `current_action` value used when the device did not send one
pub const UNKNOWN_ACTION: &str = "unknown";

/// `status` value used when a status payload has no `status` field
pub const UNKNOWN_STATUS: &str = "unknown";

static COMMAND_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// One telemetry sample from the car
///
/// `observed_at` is stamped locally on receipt. The device does not send a
/// timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryReading {
    pub battery_percent: i32,
    pub distance_front_cm: i32,
    pub temperature_c: i32,
    pub current_action: String,
    pub wifi_rssi_dbm: i32,
    pub free_heap_bytes: i32,
    pub observed_at: DateTime<Local>,
}

impl TelemetryReading {
    /// The "no data yet" value, emitted initially and on every disconnect
    pub fn reset() -> Self {
        Self {
            battery_percent: 0,
            distance_front_cm: 0,
            temperature_c: 0,
            current_action: UNKNOWN_ACTION.to_string(),
            wifi_rssi_dbm: 0,
            free_heap_bytes: 0,
            observed_at: Local::now(),
        }
    }

    /// True for the reset value, whatever its timestamp
    pub fn is_reset(&self) -> bool {
        self.battery_percent == 0
            && self.distance_front_cm == 0
            && self.temperature_c == 0
            && self.wifi_rssi_dbm == 0
            && self.free_heap_bytes == 0
            && self.current_action == UNKNOWN_ACTION
    }

    pub fn battery_display(&self) -> String {
        format!("{}%", self.battery_percent)
    }

    pub fn distance_display(&self) -> String {
        format!("{}cm", self.distance_front_cm)
    }

    pub fn temperature_display(&self) -> String {
        format!("{}°C", self.temperature_c)
    }

    pub fn rssi_display(&self) -> String {
        format!("{} dBm", self.wifi_rssi_dbm)
    }

    pub fn free_heap_display(&self) -> String {
        format!("{} KB", self.free_heap_bytes / 1024)
    }

    /// "IDLE" while stopped, otherwise the action in upper case
    pub fn action_display(&self) -> String {
        if self.current_action.is_empty() || self.current_action.eq_ignore_ascii_case("stop") {
            "IDLE".to_string()
        } else {
            self.current_action.to_uppercase()
        }
    }
}

impl Default for TelemetryReading {
    fn default() -> Self {
        Self::reset()
    }
}

impl fmt::Display for TelemetryReading {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "battery={} distance={} temp={} action={} rssi={} heap={}",
            self.battery_display(),
            self.distance_display(),
            self.temperature_display(),
            self.action_display(),
            self.rssi_display(),
            self.free_heap_display()
        )
    }
}

/// Online/offline report published by the car
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStatus {
    pub device_id: String,
    pub status: String,
    pub firmware_version: String,
}

impl DeviceStatus {
    pub fn is_online(&self) -> bool {
        self.status == "online"
    }
}

impl Default for DeviceStatus {
    /// The "unknown" status: empty identity, reported as offline
    fn default() -> Self {
        Self {
            device_id: String::new(),
            status: "offline".to_string(),
            firmware_version: String::new(),
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} is {} (firmware {})",
            self.device_id, self.status, self.firmware_version
        )
    }
}

/// A drive command on its way to the car
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandMessage {
    pub action: String,
    pub command_id: String,
}

impl CommandMessage {
    pub fn new(action: impl Into<String>, command_id: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            command_id: command_id.into(),
        }
    }

    /// Builds a command with an id that is unique within this process
    pub fn with_fresh_id(action: impl Into<String>) -> Self {
        Self::new(action, next_command_id())
    }
}

/// `cmd-<millis>-<sequence>`; the sequence keeps ids distinct within one millisecond
pub fn next_command_id() -> String {
    let sequence = COMMAND_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("cmd-{}-{}", Local::now().timestamp_millis(), sequence)
}

/// The actions the current firmware understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriveAction {
    Forward,
    Backward,
    Left,
    Right,
    Stop,
}

impl DriveAction {
    pub const ALL: [DriveAction; 5] = [
        DriveAction::Forward,
        DriveAction::Backward,
        DriveAction::Left,
        DriveAction::Right,
        DriveAction::Stop,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DriveAction::Forward => "forward",
            DriveAction::Backward => "backward",
            DriveAction::Left => "left",
            DriveAction::Right => "right",
            DriveAction::Stop => "stop",
        }
    }
}

impl fmt::Display for DriveAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown drive action: {0}")]
pub struct UnknownAction(pub String);

impl FromStr for DriveAction {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "forward" => Ok(DriveAction::Forward),
            "backward" | "back" => Ok(DriveAction::Backward),
            "left" => Ok(DriveAction::Left),
            "right" => Ok(DriveAction::Right),
            "stop" => Ok(DriveAction::Stop),
            _ => Err(UnknownAction(s.to_string())),
        }
    }
}

/// Encodes a command as `{"action":"…","command_id":"…"}`
///
/// The action is not validated so newer firmware actions pass through.
pub fn encode_command(command: &CommandMessage) -> Vec<u8> {
    let mut fields = Map::new();
    fields.insert("action".to_string(), Value::from(command.action.as_str()));
    fields.insert(
        "command_id".to_string(),
        Value::from(command.command_id.as_str()),
    );
    Value::Object(fields).to_string().into_bytes()
}

/// Decodes a telemetry payload, falling back to defaults field by field
pub fn decode_telemetry(payload: &[u8]) -> Result<TelemetryReading, LinkError> {
    let fields = parse_object(payload)?;

    Ok(TelemetryReading {
        battery_percent: int_field(&fields, "battery"),
        distance_front_cm: int_field(&fields, "distance_front"),
        temperature_c: int_field(&fields, "temperature"),
        current_action: str_field(&fields, "current_action", UNKNOWN_ACTION),
        wifi_rssi_dbm: int_field(&fields, "wifi_rssi"),
        free_heap_bytes: int_field(&fields, "free_heap"),
        observed_at: Local::now(),
    })
}

/// Decodes a status payload with the same tolerant policy as telemetry
pub fn decode_status(payload: &[u8]) -> Result<DeviceStatus, LinkError> {
    let fields = parse_object(payload)?;

    Ok(DeviceStatus {
        device_id: str_field(&fields, "device_id", ""),
        status: str_field(&fields, "status", UNKNOWN_STATUS),
        firmware_version: str_field(&fields, "firmware", ""),
    })
}

fn parse_object(payload: &[u8]) -> Result<Map<String, Value>, LinkError> {
    match serde_json::from_slice::<Value>(payload) {
        Ok(Value::Object(fields)) => Ok(fields),
        Ok(other) => Err(LinkError::MalformedPayload(format!(
            "expected an object, got {}",
            json_kind(&other)
        ))),
        Err(e) => Err(LinkError::MalformedPayload(e.to_string())),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// Floats are truncated, out-of-range values saturate, anything else reads as 0.
fn int_field(fields: &Map<String, Value>, key: &str) -> i32 {
    fields
        .get(key)
        .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
        .map(|n| n.clamp(i32::MIN as i64, i32::MAX as i64) as i32)
        .unwrap_or(0)
}

fn str_field(fields: &Map<String, Value>, key: &str, default: &str) -> String {
    fields
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or(default)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_telemetry_uses_defaults() {
        let reading = decode_telemetry(br#"{"battery":50}"#).unwrap();
        assert_eq!(reading.battery_percent, 50);
        assert_eq!(reading.distance_front_cm, 0);
        assert_eq!(reading.temperature_c, 0);
        assert_eq!(reading.current_action, "unknown");
        assert_eq!(reading.wifi_rssi_dbm, 0);
        assert_eq!(reading.free_heap_bytes, 0);
    }

    #[test]
    fn test_observed_at_ignores_device_timestamp() {
        let before = Local::now();
        let reading = decode_telemetry(br#"{"battery":10,"timestamp":1}"#).unwrap();
        let after = Local::now();

        assert_eq!(reading.battery_percent, 10);
        assert!(before <= reading.observed_at && reading.observed_at <= after);
    }

    #[test]
    fn test_full_telemetry() {
        let payload = br#"{"battery":87,"distance_front":42,"temperature":31,"current_action":"forward","wifi_rssi":-61,"free_heap":204800}"#;
        let reading = decode_telemetry(payload).unwrap();
        assert_eq!(reading.battery_percent, 87);
        assert_eq!(reading.distance_front_cm, 42);
        assert_eq!(reading.temperature_c, 31);
        assert_eq!(reading.current_action, "forward");
        assert_eq!(reading.wifi_rssi_dbm, -61);
        assert_eq!(reading.free_heap_bytes, 204800);
        assert_eq!(reading.free_heap_display(), "200 KB");
        assert_eq!(reading.action_display(), "FORWARD");
    }

    #[test]
    fn test_wrong_field_types_fall_back() {
        let reading =
            decode_telemetry(br#"{"battery":"full","temperature":21.7,"current_action":7}"#)
                .unwrap();
        assert_eq!(reading.battery_percent, 0);
        assert_eq!(reading.temperature_c, 21);
        assert_eq!(reading.current_action, "unknown");
    }

    #[test]
    fn test_truncated_payload_is_malformed() {
        let result = decode_telemetry(br#"{"battery":5"#);
        assert!(matches!(result, Err(LinkError::MalformedPayload(_))));

        let result = decode_status(b"online");
        assert!(matches!(result, Err(LinkError::MalformedPayload(_))));
    }

    #[test]
    fn test_non_object_json_is_malformed() {
        let result = decode_telemetry(b"[1,2,3]");
        match result {
            Err(LinkError::MalformedPayload(reason)) => assert!(reason.contains("an array")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_status_defaults() {
        let status = decode_status(br#"{"device_id":"car-001"}"#).unwrap();
        assert_eq!(status.device_id, "car-001");
        assert_eq!(status.status, "unknown");
        assert_eq!(status.firmware_version, "");

        let status =
            decode_status(br#"{"device_id":"car-001","status":"online","firmware":"test-v1.0"}"#)
                .unwrap();
        assert!(status.is_online());
        assert_eq!(status.firmware_version, "test-v1.0");
    }

    #[test]
    fn test_default_status_is_offline() {
        let status = DeviceStatus::default();
        assert_eq!(status.status, "offline");
        assert!(!status.is_online());
        assert!(status.device_id.is_empty());
    }

    #[test]
    fn test_encode_command_matches_firmware_fields() {
        let bytes = encode_command(&CommandMessage::new("forward", "cmd-1"));
        let parsed: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed, serde_json::json!({"action": "forward", "command_id": "cmd-1"}));
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"action":"forward","command_id":"cmd-1"}"#
        );
    }

    #[test]
    fn test_encode_keeps_unknown_actions() {
        let bytes = encode_command(&CommandMessage::new("honk", "cmd-9"));
        let parsed: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed["action"], "honk");
    }

    #[test]
    fn test_fresh_ids_are_distinct() {
        let first = CommandMessage::with_fresh_id("forward");
        let second = CommandMessage::with_fresh_id("forward");
        assert_ne!(first.command_id, second.command_id);
        assert!(first.command_id.starts_with("cmd-"));
    }

    #[test]
    fn test_drive_action_parsing() {
        assert_eq!("Forward".parse::<DriveAction>(), Ok(DriveAction::Forward));
        assert_eq!("back".parse::<DriveAction>(), Ok(DriveAction::Backward));
        assert!("jump".parse::<DriveAction>().is_err());
        for action in DriveAction::ALL {
            assert_eq!(action.as_str().parse::<DriveAction>(), Ok(action));
        }
    }

    #[test]
    fn test_reset_reading() {
        let reading = TelemetryReading::reset();
        assert!(reading.is_reset());
        assert_eq!(reading.action_display(), "UNKNOWN");

        let mut stopped = TelemetryReading::reset();
        stopped.current_action = "stop".into();
        assert_eq!(stopped.action_display(), "IDLE");
        assert!(!stopped.is_reset());
    }
}
