//! Testing utilities
//!
//! An in-memory transport that lets sessions be exercised without a broker.

pub mod mocks;

pub use mocks::*;
