//! In-memory transport for tests without a broker
//!
//! Records every subscription and publish, and hands the listener of each
//! opened session back to the test so it can play the transport's part.

use parking_lot::Mutex;
use rumqttc::QoS;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use super::transport::{Connector, Session, SessionListener, SessionRequest};
use crate::error::LinkError;

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub qos: QoS,
    pub payload: Vec<u8>,
}

#[derive(Default)]
pub struct MockSession {
    subscriptions: Mutex<Vec<(String, QoS)>>,
    published: Mutex<Vec<MockMessage>>,
    close_calls: AtomicUsize,
    fail_publish: AtomicBool,
}

impl MockSession {
    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        self.subscriptions.lock().clone()
    }

    pub fn published(&self) -> Vec<MockMessage> {
        self.published.lock().clone()
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }
}

impl Session for MockSession {
    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), LinkError> {
        self.subscriptions.lock().push((topic.to_string(), qos));
        Ok(())
    }

    fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<(), LinkError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(LinkError::PublishFailure("request queue full".to_string()));
        }
        self.published.lock().push(MockMessage {
            topic: topic.to_string(),
            qos,
            payload,
        });
        Ok(())
    }

    fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// One `open` call as seen by the mock
#[derive(Clone)]
pub struct OpenedSession {
    pub request: SessionRequest,
    pub listener: Arc<dyn SessionListener>,
    pub session: Arc<MockSession>,
}

#[derive(Clone, Default)]
pub struct MockConnector {
    opened: Arc<Mutex<Vec<OpenedSession>>>,
    next_failure: Arc<Mutex<Option<LinkError>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `open` fails synchronously with `error`
    pub fn fail_next_open(&self, error: LinkError) {
        *self.next_failure.lock() = Some(error);
    }

    pub fn open_count(&self) -> usize {
        self.opened.lock().len()
    }

    pub fn opened(&self, index: usize) -> OpenedSession {
        self.opened.lock()[index].clone()
    }

    pub fn last(&self) -> OpenedSession {
        let opened = self.opened.lock();
        opened[opened.len() - 1].clone()
    }
}

impl Connector for MockConnector {
    fn open(
        &self,
        request: SessionRequest,
        listener: Arc<dyn SessionListener>,
    ) -> Result<Arc<dyn Session>, LinkError> {
        if let Some(error) = self.next_failure.lock().take() {
            return Err(error);
        }

        let session = Arc::new(MockSession::default());
        self.opened.lock().push(OpenedSession {
            request,
            listener,
            session: session.clone(),
        });
        Ok(session)
    }
}
