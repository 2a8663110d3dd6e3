//! CLI subcommand implementations.

pub mod audit;
pub mod preflight;
pub mod run;
