//! Subcommand implementations.

pub mod jwt;
pub mod run;
