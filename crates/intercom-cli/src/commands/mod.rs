//! CLI subcommand implementations.

pub mod clients;
pub mod push;
