//! The connection manager actor
//!
//! One task owns the connection record, the subscription registry and the
//! offline queue. It wakes for façade commands, transport events, the
//! reconnect timer and shutdown, and handles them one at a time, so no state
//! here needs a lock.

use super::connection::{Connection, ConnectionState};
use super::dispatcher::Dispatcher;
use super::events::{ConnectionEvent, Listeners};
use super::message::OutboundMessage;
use super::queue::OfflineQueue;
use super::reconnect::{
    calculate_health_metrics, log_state_transition, should_attempt_reconnection, HealthInputs,
    HealthMetrics, ReconnectionDecision,
};
use super::registry::{SubscriptionEntry, SubscriptionRegistry};
use crate::error::{Operation, SessionError, SessionResult};
use crate::transport::{Transport, TransportError, TransportEvent};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn, Instrument};

type Reply<T> = oneshot::Sender<SessionResult<T>>;

/// Requests from the façade
pub(crate) enum Command {
    Connect { reply: Reply<()> },
    Subscribe { entry: SubscriptionEntry, reply: Reply<()> },
    Unsubscribe { pattern: String, reply: Reply<()> },
    Publish { message: OutboundMessage, reply: Reply<()> },
    Health { reply: Reply<HealthMetrics> },
}

impl Command {
    fn reject(self, error: SessionError) {
        // Caller may have stopped waiting
        match self {
            Command::Connect { reply }
            | Command::Subscribe { reply, .. }
            | Command::Unsubscribe { reply, .. }
            | Command::Publish { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Command::Health { reply } => {
                let _ = reply.send(Err(error));
            }
        }
    }
}

enum Wake {
    Shutdown,
    Transport(TransportEvent),
    RetryDue,
    Command(Command),
}

enum AttemptOutcome {
    Connected,
    Failed(TransportError),
    /// Shutdown arrived while the attempt was in flight
    Interrupted,
}

/// Resolve `fut` unless shutdown is signalled first
async fn guarded<F: Future>(shutdown: &mut watch::Receiver<bool>, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = wait_for_shutdown(shutdown) => None,
        output = fut => Some(output),
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender counts as shutdown
    let _ = shutdown.wait_for(|requested| *requested).await;
}

pub(crate) struct ConnectionManager<T: Transport> {
    transport: T,
    connection: Connection,
    registry: SubscriptionRegistry,
    queue: OfflineQueue,
    listeners: Arc<Listeners>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: mpsc::UnboundedReceiver<TransportEvent>,
    commands: mpsc::Receiver<Command>,
    shutdown: watch::Receiver<bool>,
    retry_at: Option<Instant>,
    last_message_time: Option<std::time::Instant>,
}

impl<T: Transport> ConnectionManager<T> {
    pub(crate) fn new(
        transport: T,
        connection: Connection,
        queue: OfflineQueue,
        listeners: Arc<Listeners>,
        state_tx: watch::Sender<ConnectionState>,
        commands: mpsc::Receiver<Command>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            connection,
            registry: SubscriptionRegistry::new(),
            queue,
            listeners,
            state_tx,
            events_tx,
            events_rx,
            commands,
            shutdown,
            retry_at: None,
            last_message_time: None,
        }
    }

    pub(crate) async fn run(mut self) {
        self.transport.set_event_sink(Some(self.events_tx.clone()));
        info!(client_id = %self.connection.client_id, "Session started");

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let retry_at = self.retry_at;
            let wake = tokio::select! {
                biased;
                _ = self.shutdown.changed() => Wake::Shutdown,
                Some(event) = self.events_rx.recv() => Wake::Transport(event),
                _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => Wake::RetryDue,
                command = self.commands.recv() => match command {
                    Some(command) => Wake::Command(command),
                    None => Wake::Shutdown,
                },
            };

            match wake {
                Wake::Shutdown => break,
                Wake::Transport(event) => self.handle_transport_event(event),
                Wake::RetryDue => self.handle_retry().await,
                Wake::Command(command) => self.handle_command(command).await,
            }
        }

        self.dispose().await;
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { reply } => {
                let result = self.handle_connect().await;
                let _ = reply.send(result);
            }
            Command::Subscribe { entry, reply } => {
                let result = self.handle_subscribe(entry).await;
                let _ = reply.send(result);
            }
            Command::Unsubscribe { pattern, reply } => {
                let result = self.handle_unsubscribe(&pattern).await;
                let _ = reply.send(result);
            }
            Command::Publish { message, reply } => {
                let result = self.handle_publish(message).await;
                let _ = reply.send(result);
            }
            Command::Health { reply } => {
                let _ = reply.send(Ok(self.health()));
            }
        }
    }

    async fn handle_connect(&mut self) -> SessionResult<()> {
        match self.connection.state {
            ConnectionState::Connected | ConnectionState::Connecting => return Ok(()),
            ConnectionState::Disposed => return Err(SessionError::Disposed),
            ConnectionState::Disconnected | ConnectionState::Reconnecting { .. } => {}
        }

        // A manual connect starts a fresh cycle
        self.connection.attempts = 0;
        self.retry_at = None;

        match self.attempt_connect().await {
            AttemptOutcome::Connected => Ok(()),
            AttemptOutcome::Interrupted => Err(SessionError::Disposed),
            AttemptOutcome::Failed(e) => {
                let error = SessionError::connection(e.to_string());
                self.report(error.clone());
                if e.is_retryable() {
                    self.schedule_or_exhaust();
                } else {
                    self.set_state(ConnectionState::Disconnected);
                }
                Err(error)
            }
        }
    }

    async fn handle_retry(&mut self) {
        self.retry_at = None;
        self.connection.attempts += 1;
        let attempt = self.connection.attempts;

        match self.attempt_connect().await {
            AttemptOutcome::Connected => {
                info!(attempt, "Reconnected");
            }
            AttemptOutcome::Interrupted => {}
            AttemptOutcome::Failed(e) if e.is_retryable() => {
                warn!(attempt, error = %e, "Reconnect attempt failed");
                self.schedule_or_exhaust();
            }
            AttemptOutcome::Failed(e) => {
                self.set_state(ConnectionState::Disconnected);
                self.report(SessionError::connection(e.to_string()));
            }
        }
    }

    /// One connect attempt; on success replays subscriptions and drains the queue
    async fn attempt_connect(&mut self) -> AttemptOutcome {
        self.set_state(ConnectionState::Connecting);
        self.connection.refresh_credentials();

        let timeout = self.connection.connect_timeout;
        let attempt = tokio::time::timeout(timeout, self.transport.connect(&self.connection.options))
            .instrument(crate::transport_span!(operation = "connect", attempt = self.connection.attempts));

        let result = match guarded(&mut self.shutdown, attempt).await {
            None => return AttemptOutcome::Interrupted,
            Some(Ok(result)) => result,
            Some(Err(_elapsed)) => Err(TransportError::Timeout(timeout)),
        };

        if let Err(e) = result {
            return AttemptOutcome::Failed(e);
        }

        self.connection.mark_connected();
        self.set_state(ConnectionState::Connected);

        let Some(replay) = guarded(&mut self.shutdown, self.registry.replay_all(&self.transport)).await else {
            return AttemptOutcome::Interrupted;
        };
        if replay.replayed > 0 {
            debug!(count = replay.replayed, "Subscriptions replayed");
        }
        for failure in replay.failures {
            self.report(failure);
        }

        if !self.drain_queue().await {
            return AttemptOutcome::Interrupted;
        }

        self.listeners.connection.notify(&ConnectionEvent::Connected);
        AttemptOutcome::Connected
    }

    /// Returns false if interrupted by shutdown.
    ///
    /// A drain that stops leaves the remainder queued until the next
    /// connection; publishes in the meantime go straight to the transport.
    async fn drain_queue(&mut self) -> bool {
        if self.queue.is_empty() {
            return true;
        }

        let pending = self.queue.len();
        match guarded(&mut self.shutdown, self.queue.drain(&self.transport)).await {
            None => false,
            Some(Ok(sent)) => {
                info!(sent, pending, "Offline queue drained");
                true
            }
            Some(Err(failure)) => {
                warn!(
                    sent = failure.sent,
                    remaining = self.queue.len(),
                    "Offline queue drain stopped"
                );
                self.report(failure.error);
                true
            }
        }
    }

    fn schedule_or_exhaust(&mut self) {
        let decision = should_attempt_reconnection(
            self.connection.attempts,
            &self.connection.reconnect,
            *self.shutdown.borrow(),
        );

        match decision {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                if attempt == 1 {
                    debug!(
                        max_wait_ms = self.connection.reconnect.calculate_max_total_time(),
                        "Reconnection cycle started"
                    );
                }
                info!(
                    "Reconnection {}/{} in {}ms",
                    attempt, self.connection.reconnect.max_attempts, delay_ms
                );
                self.set_state(ConnectionState::Reconnecting { attempt });
                self.retry_at = Some(Instant::now() + Duration::from_millis(delay_ms));
            }
            ReconnectionDecision::AbortShutdownRequested => {
                self.retry_at = None;
            }
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                self.retry_at = None;
                self.set_state(ConnectionState::Disconnected);
                self.report(SessionError::ReconnectExhausted {
                    attempts: self.connection.attempts,
                });
            }
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Message { topic, payload } => {
                self.last_message_time = Some(std::time::Instant::now());
                let report = Dispatcher::dispatch(&self.registry, &topic, &payload);
                for failure in report.failures {
                    self.report(failure);
                }
            }
            TransportEvent::ConnectionLost {
                intentional,
                reason,
            } => {
                if !self.connection.state.is_connected() {
                    debug!(state = %self.connection.state, reason = %reason, "Ignoring connection loss");
                    return;
                }

                self.connection.mark_disconnected();
                self.listeners
                    .connection
                    .notify(&ConnectionEvent::Disconnected { reason });

                if intentional {
                    self.set_state(ConnectionState::Disconnected);
                } else {
                    self.connection.attempts = 0;
                    self.schedule_or_exhaust();
                }
            }
        }
    }

    async fn handle_subscribe(&mut self, entry: SubscriptionEntry) -> SessionResult<()> {
        let pattern = entry.pattern.as_str().to_string();
        let qos = entry.qos;

        if self.registry.insert(entry) {
            debug!(pattern = %pattern, "Replaced existing subscription");
        }

        if !self.connection.state.is_connected() {
            debug!(pattern = %pattern, "Subscription stored until connected");
            return Ok(());
        }

        let call = self
            .transport
            .subscribe(&pattern, qos)
            .instrument(crate::transport_span!(operation = "subscribe", pattern = %pattern));

        match guarded(&mut self.shutdown, call).await {
            None => Err(SessionError::Disposed),
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => {
                // Entry stays registered and is replayed on the next connection
                let error = SessionError::transport(Operation::Subscribe, pattern, e.to_string());
                self.report(error.clone());
                Err(error)
            }
        }
    }

    async fn handle_unsubscribe(&mut self, pattern: &str) -> SessionResult<()> {
        if self.registry.remove(pattern).is_none() {
            debug!(pattern = %pattern, "Unsubscribe for unknown pattern ignored");
            return Ok(());
        }

        if !self.connection.state.is_connected() {
            return Ok(());
        }

        let call = self
            .transport
            .unsubscribe(pattern)
            .instrument(crate::transport_span!(operation = "unsubscribe", pattern = %pattern));

        match guarded(&mut self.shutdown, call).await {
            None => Err(SessionError::Disposed),
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => {
                let error = SessionError::transport(Operation::Unsubscribe, pattern, e.to_string());
                self.report(error.clone());
                Err(error)
            }
        }
    }

    async fn handle_publish(&mut self, message: OutboundMessage) -> SessionResult<()> {
        if !self.connection.state.is_connected() {
            if let Some(dropped) = self.queue.enqueue(message.into())? {
                warn!(
                    topic = %dropped.topic,
                    enqueued_at = %dropped.enqueued_at,
                    "Offline queue full, dropped oldest message"
                );
            }
            debug!(queued = self.queue.len(), "Message queued");
            return Ok(());
        }

        // Anything still queued here is left over from a stopped drain
        let call = self
            .transport
            .publish(&message.topic, message.payload.clone(), message.qos, message.retained)
            .instrument(crate::transport_span!(operation = "publish", topic = %message.topic));

        match guarded(&mut self.shutdown, call).await {
            None => Err(SessionError::Disposed),
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => {
                let error = SessionError::transport(Operation::Publish, message.topic, e.to_string());
                self.report(error.clone());
                Err(error)
            }
        }
    }

    fn health(&self) -> HealthMetrics {
        calculate_health_metrics(HealthInputs {
            state: self.connection.state,
            connected_since: self.connection.connected_since,
            last_message_time: self.last_message_time,
            reconnect_attempts: self.connection.attempts,
            total_reconnects: self.connection.total_reconnects(),
            subscriptions: self.registry.len(),
            queued_messages: self.queue.len(),
        })
    }

    fn set_state(&mut self, next: ConnectionState) {
        let previous = self.connection.state;
        if previous == next {
            return;
        }
        log_state_transition(&previous, &next);
        self.connection.state = next;
        self.state_tx.send_replace(next);
    }

    fn report(&self, error: SessionError) {
        if error.is_session_wide() {
            error!(error = %error, "Session error");
        } else {
            warn!(error = %error, "Session error");
        }
        self.listeners.error.notify(&error);
    }

    async fn dispose(mut self) {
        let was_connected = self.connection.state.is_connected();
        self.retry_at = None;
        self.set_state(ConnectionState::Disposed);

        self.transport.set_event_sink(None);
        let timeout = self.connection.connect_timeout;
        match tokio::time::timeout(timeout, self.transport.disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Transport disconnect failed during disposal"),
            Err(_) => warn!("Transport disconnect timed out during disposal"),
        }

        if was_connected {
            self.listeners.connection.notify(&ConnectionEvent::Disconnected {
                reason: "session disposed".to_string(),
            });
        }

        self.registry.clear();
        self.queue.clear();
        self.listeners.clear();

        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            command.reject(SessionError::Disposed);
        }

        info!(client_id = %self.connection.client_id, "Session disposed");
    }
}
