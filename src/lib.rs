//! fleetbus - resilient publish/subscribe sessions for vending-fleet telemetry
//!
//! Live fleet screens (machine status, stock alarms, maintenance and payment
//! events) all sit on one broker session that must survive network drops.
//! This crate provides that session:
//!
//! - hierarchical topic matching with `+` and `#` wildcards
//! - subscriptions that are replayed after every reconnection
//! - an offline queue that delivers messages published while disconnected, in order
//! - bounded, optionally exponential, reconnection
//! - handler isolation: one failing handler never blocks the others
//!
//! # Quick Start
//!
//! ```rust
//! use fleetbus::topic::{matches, TopicPattern};
//!
//! assert!(matches("machines/12/status", "machines/+/status"));
//! assert!(matches("alerts/critical/stock", "alerts/#"));
//! assert!(!matches("alerts", "alerts/#"));
//!
//! let pattern = TopicPattern::parse("machines/+/stock/#").unwrap();
//! assert!(pattern.has_wildcards());
//! assert!(TopicPattern::parse("alerts/#/stock").is_err());
//! ```
//!
//! See [`Session`] for the session API.

pub mod config;
pub mod error;
pub mod observability;
pub mod session;
pub mod testing;
pub mod topic;
pub mod transport;

pub use config::{ConfigError, SessionConfig};
pub use error::{Operation, SessionError, SessionResult};
pub use session::{
    ConnectionEvent, ConnectionState, HandlerResult, HealthMetrics, ListenerId, MessageHandler,
    PublishOptions, QoS, Session,
};
pub use topic::{TopicError, TopicPattern};
pub use transport::{Transport, TransportError, TransportEvent};
