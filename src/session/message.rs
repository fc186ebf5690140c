//! Message-level types shared by the session and its transport

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Delivery guarantee requested for a subscription or a published message
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum QoS {
    /// 0 - at most once
    #[default]
    AtMostOnce,
    /// 1 - at least once, may duplicate
    AtLeastOnce,
    /// 2 - exactly once
    ExactlyOnce,
}

impl QoS {
    pub fn level(self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

impl TryFrom<u8> for QoS {
    type Error = u8;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(other),
        }
    }
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.level())
    }
}

// Serialized as the numeric level so config files read `qos = 1`
impl Serialize for QoS {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.level())
    }
}

impl<'de> Deserialize<'de> for QoS {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let level = u8::deserialize(deserializer)?;
        QoS::try_from(level).map_err(|l| {
            serde::de::Error::custom(format!("invalid QoS level {l}, expected 0, 1 or 2"))
        })
    }
}

/// Options for [`crate::Session::publish`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishOptions {
    pub qos: QoS,
    pub retained: bool,
}

impl PublishOptions {
    pub fn qos(qos: QoS) -> Self {
        Self {
            qos,
            retained: false,
        }
    }

    pub fn retained(mut self) -> Self {
        self.retained = true;
        self
    }
}

/// Outbound message as handed to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retained: bool,
}

impl OutboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, options: PublishOptions) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: options.qos,
            retained: options.retained,
        }
    }
}
