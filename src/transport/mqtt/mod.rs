//! rumqttc-backed transport
//!
//! Split the same way as the rest of the crate:
//!
//! - [`options`] - pure translation of connect options
//! - [`routing`] - pure classification of rumqttc events
//! - [`client`] - the impure [`MqttTransport`]

pub mod client;
pub mod options;
pub mod routing;

pub use client::MqttTransport;
pub use routing::EventRoute;
