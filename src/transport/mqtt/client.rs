//! Impure I/O for the rumqttc-backed transport
//!
//! Each `connect` builds a fresh client and event loop, polls until the broker
//! acknowledges the connection, then hands the event loop to a background task
//! that forwards inbound publishes and reports the first connection loss. The
//! task stops after a loss; the session decides whether to connect again.

use super::options::{configure_mqtt_options, to_mqtt_qos};
use super::routing::{route_mqtt_event, EventRoute};
use crate::session::QoS;
use crate::transport::{ConnectOptions, Transport, TransportError, TransportEvent};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rumqttc::v5::{AsyncClient, EventLoop};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type EventSink = Arc<Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>>;

const REQUEST_CHANNEL_CAPACITY: usize = 10;
const POLL_TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Transport over an MQTT v5 broker
///
/// `connect` resolves on CONNACK. `subscribe`, `unsubscribe` and `publish`
/// resolve once rumqttc has accepted the request onto its outgoing channel;
/// SUBACK, UNSUBACK and PUBACK are handled by the event loop and not awaited.
/// An `Ok` therefore means the request was handed off, and a failure is only
/// reported when the client is gone. Refusals never surface as
/// [`TransportError::Rejected`] here.
#[derive(Default)]
pub struct MqttTransport {
    client: Arc<Mutex<Option<AsyncClient>>>,
    sink: EventSink,
    /// Set while we are the ones closing the connection
    closing: Arc<AtomicBool>,
    poll_handle: Option<JoinHandle<()>>,
}

impl MqttTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&self) -> Result<AsyncClient, TransportError> {
        self.client.lock().clone().ok_or(TransportError::NotConnected)
    }

    fn stop_poll_task(&mut self) {
        if let Some(handle) = self.poll_handle.take() {
            handle.abort();
        }
    }

    /// Poll until CONNACK; any error or refusal fails the attempt
    async fn wait_for_connack(event_loop: &mut EventLoop) -> Result<(), TransportError> {
        loop {
            let event = event_loop
                .poll()
                .await
                .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

            match route_mqtt_event(&event) {
                EventRoute::ConnectionAcknowledged => return Ok(()),
                EventRoute::ConnectionRefused(code) => return Err(TransportError::Rejected(code)),
                route => debug!(target: "mqtt_transport", ?route, "Event before CONNACK"),
            }
        }
    }

    async fn run_event_loop(mut event_loop: EventLoop, sink: EventSink, closing: Arc<AtomicBool>) {
        let reason = loop {
            match event_loop.poll().await {
                Ok(event) => match route_mqtt_event(&event) {
                    EventRoute::MessageReceived { topic, payload } => {
                        debug!(target: "mqtt_transport", topic = %topic, bytes = payload.len(), "Inbound message");
                        Self::emit(&sink, TransportEvent::Message { topic, payload });
                    }
                    EventRoute::Disconnected => break "broker sent DISCONNECT".to_string(),
                    EventRoute::DisconnectSent => break "client disconnected".to_string(),
                    EventRoute::ConnectionRefused(code) => break format!("connection refused: {code}"),
                    EventRoute::ConnectionAcknowledged | EventRoute::Other => {}
                },
                Err(e) => break e.to_string(),
            }
        };

        let intentional = closing.load(Ordering::SeqCst);
        if intentional {
            info!(target: "mqtt_transport", "MQTT connection closed");
        } else {
            warn!(target: "mqtt_transport", reason = %reason, "MQTT connection lost");
        }
        Self::emit(
            &sink,
            TransportEvent::ConnectionLost {
                intentional,
                reason,
            },
        );
    }

    fn emit(sink: &EventSink, event: TransportEvent) {
        let sender = sink.lock().clone();
        if let Some(sender) = sender {
            // Receiver gone means the session is shutting down
            let _ = sender.send(event);
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&mut self, options: &ConnectOptions) -> Result<(), TransportError> {
        self.stop_poll_task();

        let mqtt_options = configure_mqtt_options(options)?;
        let (client, mut event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);
        self.closing.store(false, Ordering::SeqCst);

        Self::wait_for_connack(&mut event_loop).await?;
        info!(target: "mqtt_transport", broker = %options.broker_url, client_id = %options.client_id, "MQTT connection acknowledged");

        *self.client.lock() = Some(client);
        self.poll_handle = Some(tokio::spawn(Self::run_event_loop(
            event_loop,
            self.sink.clone(),
            self.closing.clone(),
        )));
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.closing.store(true, Ordering::SeqCst);

        let client = self.client.lock().take();
        let result = match client {
            Some(client) => client
                .disconnect()
                .await
                .map_err(|e| TransportError::ConnectionFailed(e.to_string())),
            None => Ok(()),
        };

        if let Some(handle) = self.poll_handle.take() {
            match tokio::time::timeout(POLL_TASK_SHUTDOWN_TIMEOUT, handle).await {
                Ok(Ok(())) => debug!(target: "mqtt_transport", "Poll task stopped"),
                Ok(Err(e)) if !e.is_cancelled() => {
                    warn!(target: "mqtt_transport", "Poll task ended with error: {}", e);
                }
                Err(_) => warn!(target: "mqtt_transport", "Poll task did not stop in time"),
                _ => {}
            }
        }

        result
    }

    async fn subscribe(&self, pattern: &str, qos: QoS) -> Result<(), TransportError> {
        self.client()?
            .subscribe(pattern, to_mqtt_qos(qos))
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))
    }

    async fn unsubscribe(&self, pattern: &str) -> Result<(), TransportError> {
        self.client()?
            .unsubscribe(pattern)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retained: bool,
    ) -> Result<(), TransportError> {
        self.client()?
            .publish(topic, to_mqtt_qos(qos), retained, payload)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))
    }

    fn set_event_sink(&self, sink: Option<mpsc::UnboundedSender<TransportEvent>>) {
        *self.sink.lock() = sink;
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.stop_poll_task();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(url: &str) -> ConnectOptions {
        ConnectOptions {
            broker_url: url.to_string(),
            client_id: "fleet_test".to_string(),
            credentials: None,
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(1),
            clean_session: true,
            last_will: None,
        }
    }

    #[tokio::test]
    async fn test_operations_before_connect_fail() {
        let transport = MqttTransport::new();
        assert_eq!(
            transport.subscribe("machines/+/status", QoS::AtMostOnce).await,
            Err(TransportError::NotConnected)
        );
        assert_eq!(
            transport
                .publish("alerts/critical", Bytes::from_static(b"x"), QoS::AtMostOnce, false)
                .await,
            Err(TransportError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_requests_resolve_on_hand_off() {
        // No broker and no poll task
        let (client, _event_loop) = AsyncClient::new(
            rumqttc::v5::MqttOptions::new("fleet_test", "localhost", 1883),
            REQUEST_CHANNEL_CAPACITY,
        );
        let transport = MqttTransport::new();
        *transport.client.lock() = Some(client);

        assert_eq!(
            transport.subscribe("machines/+/status", QoS::AtLeastOnce).await,
            Ok(())
        );
        assert_eq!(
            transport
                .publish("alerts/critical", Bytes::from_static(b"x"), QoS::AtLeastOnce, false)
                .await,
            Ok(())
        );
    }

    #[tokio::test]
    async fn test_invalid_url_fails_before_network() {
        let mut transport = MqttTransport::new();
        let result = transport.connect(&options("http://localhost:80")).await;
        assert!(matches!(result, Err(TransportError::InvalidOptions(_))));
    }

    #[tokio::test]
    async fn test_disconnect_without_connection_is_ok() {
        let mut transport = MqttTransport::new();
        assert_eq!(transport.disconnect().await, Ok(()));
    }
}
