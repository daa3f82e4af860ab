//! Storage infrastructure: configuration file persistence.
//!
//! The `config` sub-module reads and writes the TOML configuration file and
//! supplies defaults when it does not exist yet.

pub mod config;
