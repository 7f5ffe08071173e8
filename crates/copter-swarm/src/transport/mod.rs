//! Transport layer for copter-swarm.
//!
//! Currently provides HTTP transport via axum. Every transport drives the
//! same [`SwarmService`](crate::service::SwarmService) operations.

pub mod http;

pub use http::{ServerConfig, serve};
