//! # Loggers
//!
//! Process-wide `tracing` setup shared by the binaries.

/// Console and rolling JSON file subscriber.
pub mod loggerlocal;

pub use loggerlocal::{init_tracing, LoggerError};
