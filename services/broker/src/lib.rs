//! Broker service library crate.
//!
//! # Purpose
//! Exposes the service configuration and the in-memory connection transport
//! for use by the broker binary, the push demo and integration tests.
pub mod config;
pub mod transport;
