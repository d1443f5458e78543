//! cacheprog - tiered build cache daemon
//!
//! Answers get/put/close requests from a build tool over line-delimited
//! JSON, serving from a local content-addressed directory with an optional
//! remote tier behind it.

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod remote;
pub mod storage;

pub use error::{CacheprogError, CacheprogResult};
