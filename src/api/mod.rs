//! HTTP API Module
//!
//! Provides a REST API for replication status and operator controls.

mod http;

pub use http::{AppState, HttpServer};
