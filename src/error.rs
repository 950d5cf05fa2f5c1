//! Error taxonomy for the car link
//!
//! Every failure in this crate is non-fatal. Operations return a [`LinkError`]
//! to their direct caller and the connection manager also reports it on the
//! error channel as an [`ErrorEvent`], so a passive observer (the renderer)
//! sees the same failure without being the caller.

use chrono::{DateTime, Local};
use std::fmt;
use thiserror::Error;

/// Errors produced by the codec, the transport and the connection manager
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    /// Transport failure while the session was still being established.
    ///
    /// State returns to `Disconnected`. The initial connect is never retried
    /// automatically.
    #[error("Connection failed: {0}")]
    ConnectFailure(String),

    /// Unsolicited drop of an established session.
    ///
    /// State becomes `Disconnected` and the transport keeps retrying in the
    /// background.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Inbound payload that is not valid object notation. The message is dropped.
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// A command was sent while no session was connected. The command is dropped.
    #[error("Not connected")]
    NotConnected,

    /// The transport refused a publish. The command is dropped, no retry.
    #[error("Publish failed: {0}")]
    PublishFailure(String),

    /// The transport refused a subscription request.
    #[error("Subscribe failed: {0}")]
    SubscribeFailure(String),

    /// Broker connection string or device identifier could not be used.
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

impl LinkError {
    /// `NotConnected` counts as a publish failure: both mean the command was dropped.
    pub fn is_publish_failure(&self) -> bool {
        matches!(self, LinkError::NotConnected | LinkError::PublishFailure(_))
    }

    /// Errors that come with a transition to `Disconnected`
    pub fn affects_connection(&self) -> bool {
        matches!(
            self,
            LinkError::ConnectFailure(_) | LinkError::ConnectionLost(_)
        )
    }
}

/// The operation an error originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Connect,
    Connection,
    Receive,
    Subscribe,
    Publish,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Operation::Connect => "connect",
            Operation::Connection => "connection",
            Operation::Receive => "receive",
            Operation::Subscribe => "subscribe",
            Operation::Publish => "publish",
        };
        write!(f, "{}", name)
    }
}

/// A single error notification as delivered on the error channel
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorEvent {
    pub operation: Operation,
    pub error: LinkError,
    pub at: DateTime<Local>,
}

impl ErrorEvent {
    pub fn new(operation: Operation, error: LinkError) -> Self {
        Self {
            operation,
            error,
            at: Local::now(),
        }
    }

    /// Human readable text for the notification
    pub fn message(&self) -> String {
        self.error.to_string()
    }
}

impl fmt::Display for ErrorEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} [{}] {}",
            self.at.format("%H:%M:%S%.3f"),
            self.operation,
            self.error
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_connected_is_a_publish_failure() {
        assert!(LinkError::NotConnected.is_publish_failure());
        assert!(LinkError::PublishFailure("queue full".into()).is_publish_failure());
        assert!(!LinkError::ConnectionLost("eof".into()).is_publish_failure());
    }

    #[test]
    fn test_error_event_message() {
        let event = ErrorEvent::new(
            Operation::Connect,
            LinkError::ConnectFailure("connection refused".into()),
        );
        assert_eq!(event.message(), "Connection failed: connection refused");
        assert!(event.error.affects_connection());
        assert!(event.to_string().contains("[connect]"));
    }
}
