//! Runtime glue: configuration, the node executor capability and telemetry.

pub mod config;
pub mod executor;
pub mod telemetry;
