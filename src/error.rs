//! Crate-wide error types.
//!
//! Library modules use specific error types via `thiserror`, while the CLI
//! uses `anyhow` for convenient error propagation.
//!
//! # Design
//!
//! - [`ScanError`]: every way a scan request or scanner job can fail. It is
//!   `Clone` because it travels inside [`ScanEvent::Failed`](crate::scanner::ScanEvent).
//! - [`Error`]: top-level error for storage and processing
//! - Module-specific errors ([`WatchError`](crate::scanner::watcher::WatchError),
//!   [`ConfigError`](crate::config::ConfigError)) for detailed handling

use std::path::PathBuf;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure of a scan request or of a running scanner job.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScanError {
    /// Requested directory is not local or does not exist
    #[error("Invalid directory {path}: {reason}")]
    InvalidDirectory { path: String, reason: String },

    /// A job is already active on this manager
    #[error("A scan is already running")]
    AlreadyRunning,

    /// Nothing left to scan after filtering the request
    #[error("No valid directories to scan")]
    NoDirectories,

    /// The scanner binary could not be launched
    #[error("Unable to start scanner {path}: {reason}")]
    ProcessStart { path: PathBuf, reason: String },

    /// The scanner kept crashing
    #[error("The collection scanner crashed too often. Files that could not be scanned: {}", format_files(.bad_files))]
    TooManyCrashes { bad_files: Vec<PathBuf> },

    /// Malformed scanner output
    #[error("XML error in scanner output: {0}")]
    Xml(String),

    /// Output ended before the closing `</scanner>` tag
    #[error("Scanner output ended before the document was complete")]
    PrematureEnd,

    /// The batch file could not be written or read
    #[error("Batch file {path}: {reason}")]
    BatchFile { path: PathBuf, reason: String },

    /// Reading scanner output or spawning a helper thread failed
    #[error("IO error: {0}")]
    Io(String),

    /// The job was aborted on request
    #[error("Scan aborted: {0}")]
    Aborted(String),
}

impl ScanError {
    pub fn invalid_directory(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidDirectory {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn batch_file(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::BatchFile {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error is the result of an abort request.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted(_))
    }
}

impl From<std::io::Error> for ScanError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

fn format_files(files: &[PathBuf]) -> String {
    if files.is_empty() {
        return "(unknown)".to_string();
    }
    files
        .iter()
        .map(|f| f.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Top-level error.
///
/// Aggregates errors from all subsystems for unified handling.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration error
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Scan error
    #[error(transparent)]
    Scan(#[from] ScanError),

    /// Track or album could not be committed
    #[error("Commit error: {0}")]
    Commit(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create a commit error.
    pub fn commit(message: impl Into<String>) -> Self {
        Self::Commit(message.into())
    }

    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Add context to an error.
    pub fn context(self, ctx: impl Into<String>) -> Self {
        Self::WithContext {
            context: ctx.into(),
            source: Box::new(self),
        }
    }
}

/// Extension trait for adding context to Results.
pub trait ResultExt<T> {
    /// Add context to an error result.
    fn with_context(self, ctx: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn with_context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(ctx))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, std::io::Error> {
    fn with_context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Io(e).context(ctx))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, sqlx::Error> {
    fn with_context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Database(e).context(ctx))
    }
}
