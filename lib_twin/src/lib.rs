//! # lib_twin
//!
//! Digital-twin state synchronization for a fleet of networked 3D printers.
//! Devices are discovered from an upstream proxy, each gets a persisted
//! shadow, and watched devices are polled in bounded realtime sessions whose
//! changes are published as field-level diffs.
//!
//! Optional features pull in the concrete adapters: `connections` (Redis,
//! PostgreSQL), `retrieve` (HTTP proxy client) and `loggers` (tracing setup).

#![forbid(unsafe_code)]

pub mod configs;
pub mod core;
pub mod error;
pub mod model;
pub mod store;

#[cfg(feature = "connections")]
pub mod connections;
#[cfg(feature = "loggers")]
pub mod loggers;
#[cfg(feature = "retrieve")]
pub mod retrieve;

pub use error::{StoreError, TwinError, UpstreamError};
