//! Command-line interface for batchrun.
//!
//! Provides the worker process plus commands for launching batches and
//! inspecting queue and progress state.

mod commands;

pub use commands::{load_manifest, load_rows, parse_cli, run, run_with_cli, Cli, Commands};
