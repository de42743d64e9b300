//! Storage infrastructure: configuration file loading.
//!
//! The `config` sub-module reads the broker's TOML file and supplies
//! defaults for everything the file leaves out.

pub mod config;
