//! Connection reuse
//!
//! Idle connections are cached per [`Destination`] in a
//! [`ConnectionPool`]. A connection is either idle in the pool, borrowed by
//! exactly one request or response, or closed; it is removed from the pool
//! before it is handed out, never after.

pub mod destination;
pub mod idle;

pub use destination::{Destination, Scheme};
pub use idle::{CloseReason, ConnectionPool, ReturnOutcome};
