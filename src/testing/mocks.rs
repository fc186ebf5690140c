//! Mock transport for testing
//!
//! `MockTransport` is cheaply cloneable; hand one clone to a session and keep
//! another to script behaviour, inject inbound traffic and inspect calls.

use crate::session::{OutboundMessage, PublishOptions, QoS};
use crate::transport::{ConnectOptions, Transport, TransportError, TransportEvent};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// One call made against the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Connect,
    Disconnect,
    Subscribe(String, QoS),
    Unsubscribe(String),
    Publish(String),
}

#[derive(Debug)]
struct MockState {
    calls: Vec<TransportCall>,
    published: Vec<OutboundMessage>,
    connect_script: VecDeque<Result<(), TransportError>>,
    default_connect: Result<(), TransportError>,
    connect_delay: Option<Duration>,
    /// Applied to subscribe, unsubscribe and publish
    call_delay: Option<Duration>,
    fail_subscribe: HashSet<String>,
    fail_publish: HashMap<String, TransportError>,
    sink: Option<mpsc::UnboundedSender<TransportEvent>>,
    connected: bool,
    last_options: Option<ConnectOptions>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            calls: Vec::new(),
            published: Vec::new(),
            connect_script: VecDeque::new(),
            default_connect: Ok(()),
            connect_delay: None,
            call_delay: None,
            fail_subscribe: HashSet::new(),
            fail_publish: HashMap::new(),
            sink: None,
            connected: false,
            last_options: None,
        }
    }
}

/// In-memory transport recording every call
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mock that behaves as if a connection were already established
    pub fn connected() -> Self {
        let transport = Self::new();
        transport.state.lock().connected = true;
        transport
    }

    /// Mock whose connect attempts all fail with `error`
    pub fn refusing(error: TransportError) -> Self {
        let transport = Self::new();
        transport.refuse_connections(error);
        transport
    }

    /// Outcomes for the next connect attempts, consumed in order
    pub fn script_connects<I>(&self, outcomes: I)
    where
        I: IntoIterator<Item = Result<(), TransportError>>,
    {
        self.state.lock().connect_script.extend(outcomes);
    }

    /// Fail every unscripted connect attempt
    pub fn refuse_connections(&self, error: TransportError) {
        self.state.lock().default_connect = Err(error);
    }

    pub fn accept_connections(&self) {
        self.state.lock().default_connect = Ok(());
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().connect_delay = Some(delay);
    }

    /// Hold subscribe, unsubscribe and publish calls for `delay` before answering
    pub fn set_call_delay(&self, delay: Duration) {
        self.state.lock().call_delay = Some(delay);
    }

    pub fn fail_subscribe_to(&self, pattern: &str) {
        self.state.lock().fail_subscribe.insert(pattern.to_string());
    }

    /// Refuse publishes to `topic` the way a broker ACL would
    pub fn fail_publish_to(&self, topic: &str) {
        self.fail_publish_with(topic, TransportError::Rejected(format!("publish to {topic} refused")));
    }

    pub fn fail_publish_with(&self, topic: &str, error: TransportError) {
        self.state.lock().fail_publish.insert(topic.to_string(), error);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.fail_subscribe.clear();
        state.fail_publish.clear();
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn connect_count(&self) -> usize {
        self.count(|call| matches!(call, TransportCall::Connect))
    }

    /// Patterns passed to `subscribe`, in call order
    pub fn subscribed(&self) -> Vec<String> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                TransportCall::Subscribe(pattern, _) => Some(pattern.clone()),
                _ => None,
            })
            .collect()
    }

    /// Messages the mock accepted, in order
    pub fn published(&self) -> Vec<OutboundMessage> {
        self.state.lock().published.clone()
    }

    pub fn published_payloads(&self) -> Vec<Bytes> {
        self.published().into_iter().map(|m| m.payload).collect()
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// True while a session is attached to the mock
    pub fn has_sink(&self) -> bool {
        self.state.lock().sink.is_some()
    }

    pub fn last_connect_options(&self) -> Option<ConnectOptions> {
        self.state.lock().last_options.clone()
    }

    /// Push an inbound message; false when no sink is attached
    pub fn deliver(&self, topic: &str, payload: impl Into<Bytes>) -> bool {
        self.emit(TransportEvent::Message {
            topic: topic.to_string(),
            payload: payload.into(),
        })
    }

    /// Simulate the broker dropping the connection
    pub fn drop_connection(&self, reason: &str) -> bool {
        self.state.lock().connected = false;
        self.emit(TransportEvent::ConnectionLost {
            intentional: false,
            reason: reason.to_string(),
        })
    }

    /// Simulate a close the client asked for
    pub fn close_intentionally(&self) -> bool {
        self.state.lock().connected = false;
        self.emit(TransportEvent::ConnectionLost {
            intentional: true,
            reason: "closed by client".to_string(),
        })
    }

    fn emit(&self, event: TransportEvent) -> bool {
        let sink = self.state.lock().sink.clone();
        match sink {
            Some(sink) => sink.send(event).is_ok(),
            None => false,
        }
    }

    /// Log the call, then wait out any configured call delay without holding the lock
    async fn begin_call(&self, call: TransportCall) {
        let delay = {
            let mut state = self.state.lock();
            state.calls.push(call);
            state.call_delay
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn count(&self, predicate: impl Fn(&TransportCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|call| predicate(call)).count()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&mut self, options: &ConnectOptions) -> Result<(), TransportError> {
        let delay = {
            let mut state = self.state.lock();
            state.calls.push(TransportCall::Connect);
            state.last_options = Some(options.clone());
            state.connect_delay
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        let outcome = match state.connect_script.pop_front() {
            Some(outcome) => outcome,
            None => state.default_connect.clone(),
        };
        state.connected = outcome.is_ok();
        outcome
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.calls.push(TransportCall::Disconnect);
        state.connected = false;
        Ok(())
    }

    async fn subscribe(&self, pattern: &str, qos: QoS) -> Result<(), TransportError> {
        self.begin_call(TransportCall::Subscribe(pattern.to_string(), qos)).await;
        let state = self.state.lock();

        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        if state.fail_subscribe.contains(pattern) {
            return Err(TransportError::Rejected(format!("subscribe to {pattern} refused")));
        }
        Ok(())
    }

    async fn unsubscribe(&self, pattern: &str) -> Result<(), TransportError> {
        self.begin_call(TransportCall::Unsubscribe(pattern.to_string())).await;
        let state = self.state.lock();

        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retained: bool,
    ) -> Result<(), TransportError> {
        self.begin_call(TransportCall::Publish(topic.to_string())).await;
        let mut state = self.state.lock();

        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        if let Some(error) = state.fail_publish.get(topic) {
            return Err(error.clone());
        }

        let options = PublishOptions { qos, retained };
        state.published.push(OutboundMessage::new(topic, payload, options));
        Ok(())
    }

    fn set_event_sink(&self, sink: Option<mpsc::UnboundedSender<TransportEvent>>) {
        self.state.lock().sink = sink;
    }
}
