/// CLI / environment / file configuration.
pub mod config;
/// Adapter construction and wiring.
pub mod runtime;
