//! `nsvault` HTTP server.
//!
//! Wires the engine from `nsvault-core` to an Axum router serving the JSON
//! API at `/v1/*`.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;
