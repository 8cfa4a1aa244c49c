//! Protocol adapters
//!
//! This crate bridges external protocols with a Weave node. Today that is
//! the read-only HTTP query API.

pub mod http_server;

pub use http_server::{router, HttpServer, ServerConfig};
