//! Configuration system using TOML files.
//!
//! Config is stored in the OS-standard config directory:
//! - Windows: %APPDATA%\collection-scanner\config.toml
//! - macOS: ~/Library/Application Support/collection-scanner/config.toml
//! - Linux: ~/.config/collection-scanner/config.toml
//!
//! The config file is human-readable and editable. Command-line options
//! override what it says.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::scanner::ScannerOptions;
use crate::scanner::watcher::WatcherConfig;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Scanner subprocess settings
    pub scanner: ScannerConfig,

    /// Collection settings
    pub library: LibraryConfig,
}

/// How the scanner binary is run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Scanner binary, looked up on `PATH` when relative
    pub program: PathBuf,

    /// Extra arguments placed before the scanner flags
    pub args: Vec<String>,

    /// Descend into subdirectories
    pub recursive: bool,

    /// Guess the character set of badly tagged files
    pub charset_detection: bool,

    /// Run the scanner at idle priority
    pub idle_priority: bool,

    /// Record the file being scanned so a crash can skip it on restart
    pub crash_diagnostics: bool,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        let options = ScannerOptions::default();
        Self {
            program: options.program,
            args: Vec::new(),
            recursive: options.recursive,
            charset_detection: options.charset_detection,
            idle_priority: options.idle_priority,
            crash_diagnostics: options.crash_diagnostics,
        }
    }
}

impl ScannerConfig {
    pub fn to_options(&self) -> ScannerOptions {
        ScannerOptions {
            program: self.program.clone(),
            program_args: self.args.iter().map(Into::into).collect(),
            recursive: self.recursive,
            charset_detection: self.charset_detection,
            idle_priority: self.idle_priority,
            crash_diagnostics: self.crash_diagnostics,
            batch_dir: None,
        }
    }
}

/// Collection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    /// Collection folders
    pub paths: Vec<PathBuf>,

    /// Whether to watch for file changes
    pub monitor_changes: bool,

    /// Database file (defaults to collection.db in the config directory)
    pub database: Option<PathBuf>,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            monitor_changes: true,
            database: None,
        }
    }
}

impl Config {
    pub fn watcher_config(&self) -> WatcherConfig {
        WatcherConfig {
            monitor_changes: self.library.monitor_changes,
            recursive: self.scanner.recursive,
            collection_folders: self.library.paths.clone(),
        }
    }

    /// Database file to open, unless overridden on the command line.
    pub fn database_path(&self) -> Option<PathBuf> {
        self.library.database.clone().or_else(|| {
            config_dir().map(|d| d.join(crate::db::DEFAULT_DB_NAME))
        })
    }
}

// ============================================================================
// Config File Operations
// ============================================================================

/// Get the config directory path
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("collection-scanner"))
}

/// Get the full path to the config file
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("config.toml"))
}

/// Load configuration from the default location
///
/// Returns default config if file doesn't exist or can't be parsed.
pub fn load() -> Config {
    let Some(path) = config_path() else {
        tracing::warn!("Could not determine config directory, using defaults");
        return Config::default();
    };
    load_from(&path)
}

/// Load configuration from `path`
///
/// Logs warnings but doesn't fail - we always return a usable config.
pub fn load_from(path: &Path) -> Config {
    if !path.exists() {
        tracing::info!("No config file found at {:?}, using defaults", path);
        return Config::default();
    }

    match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => {
                tracing::info!("Loaded config from {:?}", path);
                config
            }
            Err(e) => {
                tracing::error!("Failed to parse config file {:?}: {}", path, e);
                tracing::warn!("Using default configuration");
                Config::default()
            }
        },
        Err(e) => {
            tracing::error!("Failed to read config file {:?}: {}", path, e);
            Config::default()
        }
    }
}

/// Save configuration to the default location
pub fn save(config: &Config) -> Result<(), ConfigError> {
    let path = config_path().ok_or(ConfigError::NoConfigDir)?;
    save_to(config, &path)
}

/// Save configuration to `path`
///
/// Creates the parent directory if it doesn't exist.
pub fn save_to(config: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| ConfigError::CreateDir(dir.to_path_buf(), e))?;
    }

    let contents = toml::to_string_pretty(config).map_err(ConfigError::Serialize)?;

    // Write atomically (write to temp, then rename)
    let temp_path = path.with_extension("toml.tmp");
    std::fs::write(&temp_path, &contents).map_err(|e| ConfigError::Write(temp_path.clone(), e))?;
    std::fs::rename(&temp_path, path)
        .map_err(|e| ConfigError::Rename(temp_path, path.to_path_buf(), e))?;

    tracing::info!("Saved config to {:?}", path);
    Ok(())
}

// ============================================================================
// Error Types
// ============================================================================

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("Failed to create config directory {0}: {1}")]
    CreateDir(PathBuf, std::io::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),

    #[error("Failed to write config to {0}: {1}")]
    Write(PathBuf, std::io::Error),

    #[error("Failed to rename temp file {0} to {1}: {2}")]
    Rename(PathBuf, PathBuf, std::io::Error),
}

// ============================================================================
// Tests
// ============================================================================
