//! Test helpers and utilities for integration tests

// Each test binary uses a different subset
#![allow(dead_code)]

use fleetbus::{ConnectionEvent, ConnectionState, HandlerResult, Session, SessionConfig, SessionError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const WAIT: Duration = Duration::from_secs(2);

/// Configuration with a fixed client id and fast retries
pub fn test_config(max_attempts: u32, delay_ms: u64) -> SessionConfig {
    let mut config = SessionConfig::local("mqtt://localhost:1883");
    config.session.client_id = Some("test-session".to_string());
    config.broker.connect_timeout_secs = 1;
    config.reconnect.max_attempts = max_attempts;
    config.reconnect.delay_ms = delay_ms;
    config
}

/// Collects every value a listener sees
#[derive(Clone)]
pub struct Recorder<T> {
    items: Arc<Mutex<Vec<T>>>,
}

impl<T: Clone> Recorder<T> {
    pub fn new() -> Self {
        Self {
            items: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn push(&self, item: T) {
        self.items.lock().push(item);
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.items.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }
}

pub fn record_errors(session: &Session) -> Recorder<SessionError> {
    let recorder = Recorder::new();
    let sink = recorder.clone();
    session.on_error(move |error| sink.push(error.clone()));
    recorder
}

pub fn record_connection_events(session: &Session) -> Recorder<ConnectionEvent> {
    let recorder = Recorder::new();
    let sink = recorder.clone();
    session.on_connection(move |event| sink.push(event.clone()));
    recorder
}

/// Handler forwarding every delivery to a channel
pub fn channel_handler() -> (
    impl Fn(&str, &[u8]) -> HandlerResult + Send + Sync + 'static,
    mpsc::UnboundedReceiver<(String, Vec<u8>)>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |topic: &str, payload: &[u8]| -> HandlerResult {
        let _ = tx.send((topic.to_string(), payload.to_vec()));
        Ok(())
    };
    (handler, rx)
}

/// Next delivery, or None if nothing arrives within `within`
pub async fn next_delivery(
    rx: &mut mpsc::UnboundedReceiver<(String, Vec<u8>)>,
    within: Duration,
) -> Option<(String, Vec<u8>)> {
    tokio::time::timeout(within, rx.recv()).await.ok().flatten()
}

/// Poll `condition` until it holds or `WAIT` elapses
pub async fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

pub async fn wait_for_state(session: &Session, predicate: impl Fn(&ConnectionState) -> bool) -> bool {
    let mut rx = session.watch_state();
    let result = tokio::time::timeout(WAIT, rx.wait_for(|state| predicate(state))).await;
    matches!(result, Ok(Ok(_)))
}
