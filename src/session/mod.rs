//! Resilient publish/subscribe session
//!
//! A [`Session`] keeps one logical connection to a broker alive across
//! transport drops. Subscriptions survive reconnection and are replayed,
//! messages published while offline are queued and delivered in order once
//! the connection is back, and reconnection is bounded by the configured
//! attempt limit.
//!
//! # Architecture
//!
//! - [`connection`] - connection state and the per-session connection record
//! - [`reconnect`] - pure backoff, retry and health decisions
//! - [`registry`] - subscription table and handler trait
//! - [`queue`] - offline FIFO queue
//! - [`dispatcher`] - inbound fan-out with handler isolation
//! - [`events`] - connection and error listeners
//! - `manager` - the actor that owns all of the above
//!
//! # Usage
//!
//! ```rust,no_run
//! use fleetbus::{HandlerResult, PublishOptions, QoS, Session, SessionConfig};
//! use fleetbus::transport::MqttTransport;
//!
//! # tokio_test::block_on(async {
//! let config = SessionConfig::local("mqtt://localhost:1883");
//! let session = Session::new(config, MqttTransport::new())?;
//!
//! session
//!     .subscribe("machines/+/status", QoS::AtLeastOnce, |topic: &str, payload: &[u8]| -> HandlerResult {
//!         println!("{topic}: {}", String::from_utf8_lossy(payload));
//!         Ok(())
//!     })
//!     .await?;
//! session.connect().await?;
//! session
//!     .publish("alerts/critical", "low-stock", PublishOptions::default())
//!     .await?;
//! session.disconnect().await;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod connection;
pub mod dispatcher;
pub mod events;
mod manager;
pub mod message;
pub mod queue;
pub mod reconnect;
pub mod registry;

pub use connection::{Connection, ConnectionState};
pub use dispatcher::{DispatchReport, Dispatcher};
pub use events::{ConnectionEvent, ListenerId, ListenerSet, Listeners};
pub use message::{OutboundMessage, PublishOptions, QoS};
pub use queue::{DrainFailure, OfflineQueue, OverflowPolicy, QueuedMessage};
pub use reconnect::{BackoffStrategy, HealthMetrics, ReconnectConfig, ReconnectionDecision};
pub use registry::{HandlerError, HandlerResult, MessageHandler, SubscriptionEntry, SubscriptionRegistry};

use crate::config::SessionConfig;
use crate::error::{SessionError, SessionResult};
use crate::topic::{validate_topic_name, TopicPattern};
use crate::transport::Transport;
use bytes::Bytes;
use manager::{Command, ConnectionManager};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn, Instrument};

const COMMAND_CHANNEL_CAPACITY: usize = 64;
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Handle to a running session
///
/// Dropping the handle tears the session down in the background; call
/// [`Session::disconnect`] to wait for the teardown to finish.
pub struct Session {
    client_id: String,
    commands: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    listeners: Arc<Listeners>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Validate `config` and start the session actor.
    ///
    /// Must be called from within a tokio runtime. The session starts
    /// `Disconnected`; call [`Session::connect`] to go online.
    pub fn new<T>(config: SessionConfig, transport: T) -> SessionResult<Self>
    where
        T: Transport + 'static,
    {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| SessionError::config("Session::new must be called within a tokio runtime"))?;

        let connection = Connection::from_config(&config);
        let client_id = connection.client_id.clone();
        let queue = OfflineQueue::new(config.offline_queue.capacity, config.offline_queue.overflow);

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listeners = Arc::new(Listeners::default());

        let manager = ConnectionManager::new(
            transport,
            connection,
            queue,
            listeners.clone(),
            state_tx,
            commands_rx,
            shutdown_rx,
        );
        let span = crate::session_span!(client_id = %client_id);
        let handle = runtime.spawn(manager.run().instrument(span));

        Ok(Self {
            client_id,
            commands: commands_tx,
            state_rx,
            shutdown_tx,
            listeners,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Receiver that observes every state change
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn is_disposed(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Connect, resolving once the first attempt succeeds or fails.
    ///
    /// A retryable failure still schedules automatic reconnection; later
    /// attempts are observable only through connection listeners.
    pub async fn connect(&self) -> SessionResult<()> {
        self.request(|reply| Command::Connect { reply }).await
    }

    /// Register `handler` for `pattern`, replacing any handler already registered for it.
    ///
    /// While disconnected the subscription is stored and issued on the next
    /// connection. Handlers run on the session task and should return quickly.
    pub async fn subscribe<H>(&self, pattern: &str, qos: QoS, handler: H) -> SessionResult<()>
    where
        H: MessageHandler + 'static,
    {
        let pattern = TopicPattern::parse(pattern).map_err(|source| SessionError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;

        let entry = SubscriptionEntry {
            pattern,
            qos,
            handler: Arc::new(handler),
        };
        self.request(|reply| Command::Subscribe { entry, reply }).await
    }

    /// Remove the subscription for `pattern`; unknown patterns are ignored
    pub async fn unsubscribe(&self, pattern: &str) -> SessionResult<()> {
        let pattern = pattern.to_string();
        self.request(|reply| Command::Unsubscribe { pattern, reply }).await
    }

    /// Publish, or queue for delivery after reconnection when offline
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        options: PublishOptions,
    ) -> SessionResult<()> {
        validate_topic_name(topic).map_err(|source| SessionError::InvalidTopic {
            topic: topic.to_string(),
            source,
        })?;

        let message = OutboundMessage::new(topic, payload, options);
        self.request(|reply| Command::Publish { message, reply }).await
    }

    /// Publish `value` serialized as JSON
    pub async fn publish_json<V: Serialize + ?Sized>(
        &self,
        topic: &str,
        value: &V,
        options: PublishOptions,
    ) -> SessionResult<()> {
        let payload = serde_json::to_vec(value)?;
        self.publish(topic, payload, options).await
    }

    pub async fn health(&self) -> SessionResult<HealthMetrics> {
        self.request(|reply| Command::Health { reply }).await
    }

    pub fn on_connection<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.listeners.connection.add(listener)
    }

    pub fn off_connection(&self, id: ListenerId) -> bool {
        self.listeners.connection.remove(id)
    }

    pub fn on_error<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SessionError) + Send + Sync + 'static,
    {
        self.listeners.error.add(listener)
    }

    pub fn off_error(&self, id: ListenerId) -> bool {
        self.listeners.error.remove(id)
    }

    /// Tear the session down for good.
    ///
    /// Cancels any pending reconnect, rejects in-flight calls with
    /// `Disposed` and closes the transport. Safe to call more than once.
    pub async fn disconnect(&self) {
        self.shutdown_tx.send_replace(true);

        let handle = self.handle.lock().take();
        let Some(handle) = handle else {
            return;
        };

        match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
            Ok(Ok(())) => info!(client_id = %self.client_id, "Session shut down"),
            Ok(Err(e)) => warn!(client_id = %self.client_id, "Session task ended with error: {}", e),
            Err(_) => warn!(client_id = %self.client_id, "Session task did not shut down in time"),
        }
    }

    async fn request<R>(&self, build: impl FnOnce(oneshot::Sender<SessionResult<R>>) -> Command) -> SessionResult<R> {
        if self.is_disposed() {
            return Err(SessionError::Disposed);
        }

        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| SessionError::Disposed)?;
        response.await.unwrap_or(Err(SessionError::Disposed))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client_id", &self.client_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
