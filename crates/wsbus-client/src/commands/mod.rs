//! Subcommand implementations.

pub mod bus;
pub mod config;
