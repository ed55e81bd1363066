//! Operator tooling for knnsync: catalog management and artifact
//! import/export against a local document store and an optional blob server.

pub mod commands;
pub mod config;
pub mod error;

pub use error::{CliError, CliResult};
