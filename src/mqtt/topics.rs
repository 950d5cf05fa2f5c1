//! Topic layout for a single car: `iot-car/<device_id>/<channel>`

use rumqttc::QoS;
use std::fmt;

pub const TOPIC_NAMESPACE: &str = "iot-car";

/// Logical channels of a car
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Telemetry,
    Status,
    Command,
}

impl Channel {
    pub fn suffix(&self) -> &'static str {
        match self {
            Channel::Telemetry => "telemetry",
            Channel::Status => "status",
            Channel::Command => "command",
        }
    }

    /// Delivery level used for this channel.
    ///
    /// Telemetry is frequent and loss tolerant. Status changes are rare and
    /// must not be missed. Commands are published at least once.
    pub fn qos(&self) -> QoS {
        match self {
            Channel::Telemetry => QoS::AtMostOnce,
            Channel::Status | Channel::Command => QoS::AtLeastOnce,
        }
    }

    fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "telemetry" => Some(Channel::Telemetry),
            "status" => Some(Channel::Status),
            "command" => Some(Channel::Command),
            _ => None,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.suffix())
    }
}

/// The three topics of one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTopics {
    pub telemetry: String,
    pub status: String,
    pub command: String,
}

impl DeviceTopics {
    pub fn topic(&self, channel: Channel) -> &str {
        match channel {
            Channel::Telemetry => &self.telemetry,
            Channel::Status => &self.status,
            Channel::Command => &self.command,
        }
    }

    /// Topics the controller subscribes to, with their delivery level
    pub fn subscriptions(&self) -> [(&str, QoS); 2] {
        [
            (self.telemetry.as_str(), Channel::Telemetry.qos()),
            (self.status.as_str(), Channel::Status.qos()),
        ]
    }
}

pub fn topics_for(device_id: &str) -> DeviceTopics {
    let topic = |channel: Channel| format!("{}/{}/{}", TOPIC_NAMESPACE, device_id, channel);
    DeviceTopics {
        telemetry: topic(Channel::Telemetry),
        status: topic(Channel::Status),
        command: topic(Channel::Command),
    }
}

/// Classifies an inbound topic by its last level.
///
/// Only the suffix is checked so broker-added prefixes still route.
pub fn classify(topic: &str) -> Option<Channel> {
    if !topic.contains('/') {
        return None;
    }
    topic.rsplit('/').next().and_then(Channel::from_suffix)
}
