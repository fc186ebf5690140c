//! FIFO buffer for messages published while disconnected

use super::message::{OutboundMessage, QoS};
use crate::error::{Operation, SessionError};
use crate::transport::Transport;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::debug;

/// What happens when a bounded queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Refuse the new message; `publish` returns `QueueFull`
    #[default]
    RejectNewest,
    /// Discard the oldest queued message to make room
    DropOldest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retained: bool,
    pub enqueued_at: DateTime<Utc>,
}

impl From<OutboundMessage> for QueuedMessage {
    fn from(message: OutboundMessage) -> Self {
        Self {
            topic: message.topic,
            payload: message.payload,
            qos: message.qos,
            retained: message.retained,
            enqueued_at: Utc::now(),
        }
    }
}

/// Outcome of a drain that stopped early
#[derive(Debug, Clone, PartialEq)]
pub struct DrainFailure {
    /// Messages handed off before the failure
    pub sent: usize,
    pub error: SessionError,
}

#[derive(Debug, Default)]
pub struct OfflineQueue {
    messages: VecDeque<QueuedMessage>,
    capacity: Option<usize>,
    overflow: OverflowPolicy,
}

impl OfflineQueue {
    pub fn new(capacity: Option<usize>, overflow: OverflowPolicy) -> Self {
        Self {
            messages: VecDeque::new(),
            capacity,
            overflow,
        }
    }

    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Append a message.
    ///
    /// Returns the message that was discarded to make room under
    /// [`OverflowPolicy::DropOldest`].
    pub fn enqueue(&mut self, message: QueuedMessage) -> Result<Option<QueuedMessage>, SessionError> {
        let mut dropped = None;

        if let Some(capacity) = self.capacity {
            if self.messages.len() >= capacity {
                match self.overflow {
                    OverflowPolicy::RejectNewest => {
                        return Err(SessionError::QueueFull { capacity });
                    }
                    OverflowPolicy::DropOldest => dropped = self.messages.pop_front(),
                }
            }
        }

        self.messages.push_back(message);
        Ok(dropped)
    }

    pub fn pop(&mut self) -> Option<QueuedMessage> {
        self.messages.pop_front()
    }

    /// Put a message back at the head after a failed hand-off
    pub fn restore(&mut self, message: QueuedMessage) {
        self.messages.push_front(message);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedMessage> {
        self.messages.iter()
    }

    /// Hand every queued message to the transport in insertion order.
    ///
    /// On the first failure the failed message goes back to the head, so it
    /// and everything after it stay queued in their original order.
    pub async fn drain<T: Transport + ?Sized>(&mut self, transport: &T) -> Result<usize, DrainFailure> {
        let mut sent = 0;

        while let Some(message) = self.messages.pop_front() {
            let result = transport
                .publish(&message.topic, message.payload.clone(), message.qos, message.retained)
                .await;

            if let Err(e) = result {
                let error = SessionError::transport(Operation::Drain, message.topic.clone(), e.to_string());
                self.restore(message);
                return Err(DrainFailure { sent, error });
            }

            debug!(topic = %message.topic, "Delivered queued message");
            sent += 1;
        }

        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::PublishOptions;
    use crate::testing::mocks::MockTransport;
    use crate::transport::TransportError;

    fn message(topic: &str, payload: &'static str) -> QueuedMessage {
        OutboundMessage::new(topic, payload, PublishOptions::default()).into()
    }

    fn topics(queue: &OfflineQueue) -> Vec<String> {
        queue.iter().map(|m| m.topic.clone()).collect()
    }

    #[test]
    fn test_enqueue_preserves_order() {
        let mut queue = OfflineQueue::unbounded();
        queue.enqueue(message("a", "1")).unwrap();
        queue.enqueue(message("b", "2")).unwrap();
        queue.enqueue(message("c", "3")).unwrap();

        assert_eq!(topics(&queue), vec!["a", "b", "c"]);
        assert_eq!(queue.pop().unwrap().topic, "a");
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_reject_newest_when_full() {
        let mut queue = OfflineQueue::new(Some(2), OverflowPolicy::RejectNewest);
        queue.enqueue(message("a", "1")).unwrap();
        queue.enqueue(message("b", "2")).unwrap();

        assert_eq!(
            queue.enqueue(message("c", "3")),
            Err(SessionError::QueueFull { capacity: 2 })
        );
        assert_eq!(topics(&queue), vec!["a", "b"]);
    }

    #[test]
    fn test_drop_oldest_when_full() {
        let mut queue = OfflineQueue::new(Some(2), OverflowPolicy::DropOldest);
        queue.enqueue(message("a", "1")).unwrap();
        queue.enqueue(message("b", "2")).unwrap();

        let dropped = queue.enqueue(message("c", "3")).unwrap();
        assert_eq!(dropped.map(|m| m.topic), Some("a".to_string()));
        assert_eq!(topics(&queue), vec!["b", "c"]);
    }

    #[test]
    fn test_restore_puts_message_at_head() {
        let mut queue = OfflineQueue::unbounded();
        queue.enqueue(message("a", "1")).unwrap();
        queue.enqueue(message("b", "2")).unwrap();

        let head = queue.pop().unwrap();
        queue.restore(head);
        assert_eq!(topics(&queue), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_drain_sends_in_fifo_order() {
        let transport = MockTransport::connected();
        let mut queue = OfflineQueue::unbounded();
        queue.enqueue(message("alerts/critical", "low-stock")).unwrap();
        queue.enqueue(message("alerts/critical", "restocked")).unwrap();

        assert_eq!(queue.drain(&transport).await, Ok(2));
        assert!(queue.is_empty());

        let payloads: Vec<_> = transport
            .published()
            .into_iter()
            .map(|m| m.payload)
            .collect();
        assert_eq!(
            payloads,
            vec![Bytes::from_static(b"low-stock"), Bytes::from_static(b"restocked")]
        );
    }

    #[tokio::test]
    async fn test_failed_drain_keeps_remainder_in_order() {
        let transport = MockTransport::connected();
        transport.fail_publish_to("b");

        let mut queue = OfflineQueue::unbounded();
        queue.enqueue(message("a", "1")).unwrap();
        queue.enqueue(message("b", "2")).unwrap();
        queue.enqueue(message("c", "3")).unwrap();

        let failure = queue.drain(&transport).await.unwrap_err();
        assert_eq!(failure.sent, 1);
        assert!(matches!(
            failure.error,
            SessionError::Transport {
                operation: Operation::Drain,
                ..
            }
        ));
        assert_eq!(topics(&queue), vec!["b", "c"]);

        transport.clear_failures();
        assert_eq!(queue.drain(&transport).await, Ok(2));
        let sent: Vec<_> = transport.published().into_iter().map(|m| m.topic).collect();
        assert_eq!(sent, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_link_failure_stops_drain_like_a_refusal() {
        let transport = MockTransport::connected();
        transport.fail_publish_with("a", TransportError::NotConnected);

        let mut queue = OfflineQueue::unbounded();
        queue.enqueue(message("a", "1")).unwrap();
        queue.enqueue(message("b", "2")).unwrap();

        let failure = queue.drain(&transport).await.unwrap_err();
        assert_eq!(failure.sent, 0);
        assert_eq!(topics(&queue), vec!["a", "b"]);
        assert!(transport.published().is_empty());
    }
}
