//! Golf-simulator bay booking CLI library.
//!
//! This crate provides the runtime loop and operator console around
//! `bay-core`.

pub mod backend;
mod cli;
pub mod commands;
mod config;
pub mod console;
pub mod power;
mod util;

pub use cli::{Cli, Commands};
pub use config::Config;
