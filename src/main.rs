//! Collection Scanner - command-line front end.
//!
//! Runs scans, imports saved scanner output and watches the collection
//! folders, committing every result to the collection database.

mod cli;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Used when `RUST_LOG` is unset. Library logs use short targets
/// (`scanner::job`, `processor`, `db`) next to the crate's module paths.
const DEFAULT_LOG_FILTER: &str = "collection_scanner=info,scanner=info,processor=info,db=info";

fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();

    // Initialize logging
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(DEFAULT_LOG_FILTER)?,
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();

    cli::run_command(&args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::io::Write;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_default_filter_shows_library_warnings() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::registry()
            .with(fmt::layer().with_writer(move || writer.clone()).with_ansi(false))
            .with(EnvFilter::try_new(DEFAULT_LOG_FILTER).unwrap());

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(target: "scanner::manager", "Skipping directory");
            tracing::info!(target: "processor", "Committing scan results");
            tracing::warn!(target: "db", "Database warning");
            tracing::debug!(target: "scanner::job", "Launching scanner");
        });

        let output = String::from_utf8(captured.0.lock().clone()).unwrap();
        assert!(output.contains("Skipping directory"));
        assert!(output.contains("Committing scan results"));
        assert!(output.contains("Database warning"));
        assert!(!output.contains("Launching scanner"));
    }
}
