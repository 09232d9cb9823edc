//! Command-line interface for keyed-queue.
//!
//! Provides the `simulate` command for exercising a scheduler with a
//! synthetic workload.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands, SimulateArgs};
