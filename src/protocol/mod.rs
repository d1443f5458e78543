//! Wire protocol for the cache program channel
//!
//! One JSON value per line in both directions. The daemon writes a handshake
//! listing its commands, then answers every request with exactly one response
//! carrying the request's `ID`. A `put` with a positive `BodySize` is followed
//! by one extra line holding the body as a base64 JSON string.

pub mod encoding;
mod message;

pub use message::{Command, Request, Response};
