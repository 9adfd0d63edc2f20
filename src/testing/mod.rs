//! Testing utilities and mock implementations
//!
//! Scripted connectors and sessions for exercising connection, publish and
//! reconnection paths without a broker.

pub mod mocks;

pub use mocks::*;
