//! Tether - pooled HTTP/1.x client connections
//!
//! Connection reuse, the release contract that decides whether a connection
//! goes back to the pool, and the accounting that makes a forgotten release
//! visible.

pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod monitor;
pub mod pool;
pub mod transport;
