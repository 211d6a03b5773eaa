//! Runtime glue: configuration, the block source contract, subscriber hook types, error types,
//! fatal error capture, telemetry, and the signal-aware runner.

pub mod config;
pub mod errors;
pub mod fatal;
pub mod hooks;
pub mod runner;
pub mod source;
pub mod telemetry;
