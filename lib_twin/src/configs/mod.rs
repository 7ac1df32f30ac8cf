//! # Configuration Modules
//!
//! This module aggregates the option sections of the twin: upstream proxy,
//! shadow store, relational store, session orchestration, rate limits, fleet
//! cadence and logging.

/// Option sections and JSON file loading.
pub mod config_twin;

pub use config_twin::{
    ConfigError, LoggingOptions, PostgresOptions, ProxyOptions, RateLimitOptions,
    RealtimeOptions, RedisOptions, StateSyncOptions, TwinConfig,
};
