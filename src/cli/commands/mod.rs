//! CLI command definitions and dispatch.
//!
//! Every subcommand shares one [`Session`]: the loaded configuration, a
//! tokio runtime driving the database pool, and the synchronous storage
//! adapter handed to the scan pipeline.
//! - `scan`: run the scanner over directories
//! - `import`: feed a saved scanner document through the same pipeline
//! - `watch`: rescan folders as they change
//! - `list`: print the stored collection
//! - `config`: print or save the effective configuration

mod scan;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::runtime::Runtime;

use collection_scanner::config::{self, Config};
use collection_scanner::db::{self, SqliteStorage};

pub use scan::{cmd_import, cmd_list, cmd_scan, cmd_version, cmd_watch};

/// Collection Scanner CLI
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Database path (overrides the configured one)
    #[arg(long, global = true, env = "COLLECTION_SCANNER_DB")]
    pub db: Option<PathBuf>,

    /// Config file (defaults to the OS config directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Scanner binary (overrides the configured one)
    #[arg(long, global = true, env = "COLLECTION_SCANNER_BIN")]
    pub scanner: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand)]
pub enum Commands {
    /// Scan directories (the collection folders when none are given)
    Scan {
        /// Rescan everything and overwrite stored tags
        #[arg(long, conflicts_with = "partial")]
        full: bool,
        /// Only touch the given directories
        #[arg(long)]
        partial: bool,
        /// Directories or file:// URLs to scan
        dirs: Vec<PathBuf>,
    },
    /// Commit a saved scanner document
    Import {
        /// Scanner output file
        file: PathBuf,
        /// Treat the document as a full scan
        #[arg(long)]
        full: bool,
    },
    /// Watch the collection folders and rescan what changes
    Watch {
        /// Skip the initial update scan
        #[arg(long)]
        no_initial_scan: bool,
    },
    /// List the stored collection
    List {
        /// List albums instead of tracks
        #[arg(long)]
        albums: bool,
    },
    /// Print the scanner binary's version
    Version,
    /// Print the effective configuration
    Config {
        /// Write it to the config file
        #[arg(long)]
        save: bool,
    },
}

/// State shared by the commands.
pub struct Session {
    pub storage: SqliteStorage,
    pub config: Config,
    pub rt: Runtime,
}

impl Session {
    fn open(cli: &Cli) -> anyhow::Result<Self> {
        let config = effective_config(cli);

        let db_path = config.database_path();
        if let Some(parent) = db_path.as_deref().and_then(|p| p.parent()) {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        let url = db::db_url(db_path.as_deref());

        let rt = Runtime::new()?;
        let pool = rt
            .block_on(db::init_db(&url))
            .with_context(|| format!("Failed to open database {url}"))?;
        let storage = SqliteStorage::new(pool, rt.handle().clone());

        Ok(Self {
            storage,
            config,
            rt,
        })
    }
}

fn load_config(cli: &Cli) -> Config {
    match &cli.config {
        Some(path) => config::load_from(path),
        None => config::load(),
    }
}

/// Configuration with the command-line overrides applied.
fn effective_config(cli: &Cli) -> Config {
    let mut config = load_config(cli);
    if let Some(program) = &cli.scanner {
        config.scanner.program = program.clone();
    }
    if let Some(db) = &cli.db {
        config.library.database = Some(db.clone());
    }
    config
}

fn cmd_config(cli: &Cli, save: bool) -> anyhow::Result<()> {
    let config = effective_config(cli);
    print!("{}", toml::to_string_pretty(&config)?);
    if save {
        match &cli.config {
            Some(path) => config::save_to(&config, path)?,
            None => config::save(&config)?,
        }
    }
    Ok(())
}

/// Run the specified CLI command.
pub fn run_command(cli: &Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Version => {
            let program = cli
                .scanner
                .clone()
                .unwrap_or_else(|| load_config(cli).scanner.program);
            return cmd_version(&program);
        }
        Commands::Config { save } => return cmd_config(cli, save),
        _ => {}
    }

    let session = Session::open(cli)?;
    match &cli.command {
        Commands::Scan {
            full,
            partial,
            dirs,
        } => cmd_scan(&session, dirs, *full, *partial),
        Commands::Import { file, full } => cmd_import(&session, file, *full),
        Commands::Watch { no_initial_scan } => cmd_watch(&session, !*no_initial_scan),
        Commands::List { albums } => cmd_list(&session, *albums),
        Commands::Version | Commands::Config { .. } => Ok(()),
    }
}
