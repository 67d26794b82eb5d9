//! Command-line interface for collection-scanner.
//!
//! This module provides CLI commands for scanning, importing, watching and
//! listing the collection.

mod commands;

pub use commands::{Cli, run_command};
