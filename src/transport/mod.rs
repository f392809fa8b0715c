//! Transport connections.
//!
//! [`Connector`] dials byte streams; [`ByteConnection`] wraps one stream with
//! the ownership state the pool and the executor hand back and forth.

pub mod connection;
pub mod connector;

pub use connection::{ByteConnection, ConnId, ConnectionState};
pub use connector::{Connection, Connector, TcpConnector};
