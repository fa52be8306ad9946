//! HTTP API Module
//!
//! Provides a REST API for client connections and cluster management.

mod http;

pub use http::{AppState, HttpServer};
