//! Command-line interface for jobgate.
//!
//! Provides the `simulate` command, which drives a dispatcher with a
//! synthetic, seedable workload.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands, SimulateArgs};
