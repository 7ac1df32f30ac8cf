//! # Data Retrieval Module
//!
//! HTTP access to the printer cloud proxy.
//!
//! - **`ky_http`**: a generic `ApiClient` built on `reqwest` and
//!   `reqwest-middleware`, with automatic retries and exponential backoff.
//! - **`proxy_client`**: the `UpstreamApi` implementation and wire DTOs.

#![forbid(unsafe_code)]

/// Generic HTTP API client with retry middleware.
pub mod ky_http;
/// Device listing, session start and realtime snapshots over HTTP.
pub mod proxy_client;

pub use ky_http::{ApiClient, ApiResponse};
pub use proxy_client::{map_snapshot, ProxyClient};
