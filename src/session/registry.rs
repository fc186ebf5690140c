//! Subscription table keyed by pattern

use super::message::QoS;
use crate::error::{Operation, SessionError};
use crate::topic::TopicPattern;
use crate::transport::Transport;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type HandlerResult = Result<(), HandlerError>;

/// Receives inbound messages for one subscription
pub trait MessageHandler: Send + Sync {
    fn handle(&self, topic: &str, payload: &[u8]) -> HandlerResult;
}

impl<F> MessageHandler for F
where
    F: Fn(&str, &[u8]) -> HandlerResult + Send + Sync,
{
    fn handle(&self, topic: &str, payload: &[u8]) -> HandlerResult {
        self(topic, payload)
    }
}

#[derive(Clone)]
pub struct SubscriptionEntry {
    pub pattern: TopicPattern,
    pub qos: QoS,
    pub handler: Arc<dyn MessageHandler>,
}

impl fmt::Debug for SubscriptionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionEntry")
            .field("pattern", &self.pattern.as_str())
            .field("qos", &self.qos)
            .finish_non_exhaustive()
    }
}

/// Result of re-issuing every subscription after a reconnect
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReplayReport {
    pub replayed: usize,
    pub failures: Vec<SessionError>,
}

/// Registration-ordered subscription table, one entry per exact pattern
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: Vec<SubscriptionEntry>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an entry; an existing entry for the same pattern is replaced in place.
    ///
    /// Returns true when an entry was replaced.
    pub fn insert(&mut self, entry: SubscriptionEntry) -> bool {
        match self
            .entries
            .iter_mut()
            .find(|existing| existing.pattern == entry.pattern)
        {
            Some(existing) => {
                *existing = entry;
                true
            }
            None => {
                self.entries.push(entry);
                false
            }
        }
    }

    pub fn remove(&mut self, pattern: &str) -> Option<SubscriptionEntry> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.pattern.as_str() == pattern)?;
        Some(self.entries.remove(index))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SubscriptionEntry> {
        self.entries.iter()
    }

    /// Entries whose pattern matches `topic`, in registration order
    pub fn matching<'a>(&'a self, topic: &'a str) -> impl Iterator<Item = &'a SubscriptionEntry> + 'a {
        self.entries
            .iter()
            .filter(move |entry| entry.pattern.matches(topic))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Re-issue a transport subscribe for every entry, continuing past failures
    pub async fn replay_all<T: Transport + ?Sized>(&self, transport: &T) -> ReplayReport {
        let mut report = ReplayReport::default();

        for entry in &self.entries {
            let pattern = entry.pattern.as_str();
            match transport.subscribe(pattern, entry.qos).await {
                Ok(()) => {
                    debug!(pattern = %pattern, qos = %entry.qos, "Replayed subscription");
                    report.replayed += 1;
                }
                Err(e) => {
                    warn!(pattern = %pattern, error = %e, "Failed to replay subscription");
                    report
                        .failures
                        .push(SessionError::transport(Operation::Replay, pattern, e.to_string()));
                }
            }
        }

        report
    }
}
