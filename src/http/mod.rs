//! HTTP/1.x message model and wire codec.
//!
//! The pool never looks inside messages; the executor uses this module to
//! turn a [`Request`](request::Request) into bytes and to read a
//! [`ResponseHead`](response::ResponseHead) plus body framing back off a
//! connection.
//!
//! - **`request`**: outgoing request model and builder
//! - **`response`**: status code and response head
//! - **`codec`**: request encoding, head parsing, body framing

pub mod codec;
pub mod request;
pub mod response;
