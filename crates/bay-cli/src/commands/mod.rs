//! CLI subcommand implementations.

pub mod devices;
pub mod export;
pub mod run;
pub mod stats;
