//! Transport seam between a session and the broker client library
//!
//! A transport exposes the broker primitives (connect, subscribe, unsubscribe,
//! publish) and reports inbound frames and connection loss through an event
//! sink. It never retries on its own; retry policy belongs to the session.

use crate::session::QoS;
use bytes::Bytes;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod mqtt;

pub use mqtt::MqttTransport;

/// Username/password pair resolved from the environment
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

// Keep passwords out of Debug output
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Will message registered with the broker at connect time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retained: bool,
}

/// Options passed to every connect attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub broker_url: String,
    pub client_id: String,
    pub credentials: Option<Credentials>,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub clean_session: bool,
    pub last_will: Option<LastWill>,
}

/// Events a transport pushes to its sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message { topic: String, payload: Bytes },
    /// `intentional` is true when the loss was requested through `disconnect`
    ConnectionLost { intentional: bool, reason: String },
}

/// Failures reported by a transport
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("rejected by broker: {0}")]
    Rejected(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("not connected")]
    NotConnected,
    /// Options can never succeed as given; retrying is pointless
    #[error("invalid connect options: {0}")]
    InvalidOptions(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::InvalidOptions(_))
    }
}

/// Broker client primitives used by a session
///
/// `subscribe`, `unsubscribe` and `publish` resolve once the implementation
/// considers the request delivered. How strong that is depends on the
/// implementation; [`MqttTransport`] resolves on hand-off to its client.
/// A broker refusal is reported as [`TransportError::Rejected`]; other errors
/// mean the link is unusable.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Establish a connection; resolves once the broker acknowledged it
    async fn connect(&mut self, options: &ConnectOptions) -> Result<(), TransportError>;

    /// Close the connection; a subsequent `ConnectionLost` is marked intentional
    async fn disconnect(&mut self) -> Result<(), TransportError>;

    async fn subscribe(&self, pattern: &str, qos: QoS) -> Result<(), TransportError>;

    async fn unsubscribe(&self, pattern: &str) -> Result<(), TransportError>;

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retained: bool,
    ) -> Result<(), TransportError>;

    /// Install or detach (`None`) the receiver of inbound messages and connection loss
    fn set_event_sink(&self, sink: Option<mpsc::UnboundedSender<TransportEvent>>);
}
