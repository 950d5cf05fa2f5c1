//! Command publisher: builds, encodes and publishes drive commands

use tracing::info;

use super::codec::{encode_command, CommandMessage};
use super::topics::Channel;
use super::transport::Session;
use crate::error::LinkError;

/// Publishes commands to one device's command topic.
///
/// Fire-and-forget: the publish is queued at QoS 1 and no reply from the car
/// is awaited. A failed publish is not retried; a late drive command is worse
/// than a lost one.
pub struct CommandPublisher<'a> {
    session: &'a dyn Session,
    topic: &'a str,
}

impl<'a> CommandPublisher<'a> {
    pub fn new(session: &'a dyn Session, topic: &'a str) -> Self {
        Self { session, topic }
    }

    pub fn send(&self, action: &str) -> Result<CommandMessage, LinkError> {
        let command = CommandMessage::with_fresh_id(action);
        let payload = encode_command(&command);

        self.session
            .publish(self.topic, Channel::Command.qos(), payload)
            .map_err(|e| match e {
                LinkError::PublishFailure(_) | LinkError::NotConnected => e,
                other => LinkError::PublishFailure(other.to_string()),
            })?;

        info!(
            "Sent command '{}' ({}) to {}",
            command.action, command.command_id, self.topic
        );
        Ok(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::mock::MockSession;
    use rumqttc::QoS;

    #[test]
    fn test_send_publishes_encoded_command() {
        let session = MockSession::default();
        let publisher = CommandPublisher::new(&session, "iot-car/car-001/command");

        let command = publisher.send("left").unwrap();

        let published = session.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "iot-car/car-001/command");
        assert_eq!(published[0].qos, QoS::AtLeastOnce);
        let body: serde_json::Value = serde_json::from_slice(&published[0].payload).unwrap();
        assert_eq!(body["action"], "left");
        assert_eq!(body["command_id"], command.command_id.as_str());
    }

    #[test]
    fn test_transport_refusal_is_a_publish_failure() {
        let session = MockSession::default();
        session.fail_publishes(true);
        let publisher = CommandPublisher::new(&session, "iot-car/car-001/command");

        let result = publisher.send("stop");
        assert!(matches!(result, Err(LinkError::PublishFailure(_))));
        assert!(session.published().is_empty());
    }
}
