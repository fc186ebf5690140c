//! Observability: structured logging and span helpers

pub mod logging;

pub use logging::{LogFormat, init_default_logging, init_logging};

// Span macros for structured logging
pub use logging::{dispatch_span, session_span, transport_span};
