//! Scanning, importing and watching commands.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use tracing::{info, warn};

use collection_scanner::db::{self, SqliteStorage};
use collection_scanner::model::ScanType;
use collection_scanner::processor::{ProcessorProgress, ScanResultProcessor};
use collection_scanner::scanner::watcher::DirectoryWatcher;
use collection_scanner::scanner::{ScanEvent, ScanManager, ScanRequester, scanner_version};

use super::Session;

const EVENT_CHANNEL_CAPACITY: usize = 64;

type Processor = Arc<Mutex<ScanResultProcessor<SqliteStorage>>>;

/// Manager plus processor, with the processor subscribed first so a run is
/// committed before its terminal event reaches the channel.
fn pipeline(session: &Session) -> (Arc<ScanManager>, Processor, Receiver<ScanEvent>) {
    let storage = session.storage.clone();
    let manager = Arc::new(
        ScanManager::new(session.config.scanner.to_options())
            .with_directory_times(Arc::new(storage.clone())),
    );
    let processor = ScanResultProcessor::new(storage.clone())
        .with_playlist_importer(Box::new(storage))
        .with_collection_folders(session.config.library.paths.clone())
        .with_progress(print_commit_progress)
        .subscribe_to(&manager);
    let events = manager.subscribe_channel(EVENT_CHANNEL_CAPACITY);
    (manager, processor, events)
}

fn print_commit_progress(progress: ProcessorProgress) {
    match progress {
        ProcessorProgress::Directories { done, total } => {
            print!("\rCommitting directories {done}/{total}...");
            let _ = std::io::stdout().flush();
        }
        ProcessorProgress::Albums { done, total } => {
            print!("\rCommitting albums {done}/{total}...     ");
            let _ = std::io::stdout().flush();
        }
        ProcessorProgress::Done => println!(),
    }
}

/// Print progress until the run ends, returning its terminal event.
fn follow_run(events: &Receiver<ScanEvent>) -> anyhow::Result<ScanEvent> {
    let mut expected = 0;
    let mut scanned = 0;
    loop {
        let event = events.recv().context("Scan manager went away")?;
        match &event {
            ScanEvent::Started(scan_type) => println!("Starting {scan_type}"),
            ScanEvent::DirectoryCount(count) => expected = *count,
            ScanEvent::IncrementalOutput => {}
            ScanEvent::DirectoryScanned(dir) => {
                scanned += 1;
                if scanned % 10 == 0 || scanned == expected {
                    print!("\rScanned {scanned}/{expected} directories ({})", dir.base_name());
                    let _ = std::io::stdout().flush();
                }
            }
            ScanEvent::Succeeded | ScanEvent::Failed(_) => return Ok(event),
        }
    }
}

fn report_outcome(event: &ScanEvent, processor: &Processor) -> anyhow::Result<()> {
    let processor = processor.lock();
    for error in processor.last_errors() {
        eprintln!("warning: {error}");
    }
    match event {
        ScanEvent::Failed(error) => bail!("Scan failed: {error}"),
        _ => {
            println!("Scan complete.");
            Ok(())
        }
    }
}

/// Scan `dirs`, or every collection folder when none are given.
pub fn cmd_scan(session: &Session, dirs: &[PathBuf], full: bool, partial: bool) -> anyhow::Result<()> {
    let folders = &session.config.library.paths;
    let dirs: Vec<PathBuf> = if dirs.is_empty() {
        folders.clone()
    } else {
        dirs.to_vec()
    };
    if dirs.is_empty() {
        bail!("Nothing to scan: pass directories or set library.paths in the config file");
    }

    let scan_type = if partial {
        ScanType::PartialUpdateScan
    } else {
        ScanType::classify(&dirs, folders, full)
    };

    let (manager, processor, events) = pipeline(session);
    manager.request_scan(&dirs, scan_type)?;
    let outcome = follow_run(&events)?;
    report_outcome(&outcome, &processor)
}

/// Commit a saved scanner document.
pub fn cmd_import(session: &Session, file: &Path, full: bool) -> anyhow::Result<()> {
    let input = std::fs::File::open(file)
        .with_context(|| format!("Failed to open {}", file.display()))?;
    let scan_type = if full {
        ScanType::FullScan
    } else {
        ScanType::UpdateScan
    };

    let (manager, processor, events) = pipeline(session);
    manager.request_import(std::io::BufReader::new(input), scan_type)?;
    let outcome = follow_run(&events)?;
    report_outcome(&outcome, &processor)
}

/// Watch the collection folders until interrupted.
pub fn cmd_watch(session: &Session, initial_scan: bool) -> anyhow::Result<()> {
    let folders = session.config.library.paths.clone();
    if folders.is_empty() {
        bail!("No collection folders configured (library.paths)");
    }

    let (manager, processor, events) = pipeline(session);
    if initial_scan {
        manager.request_scan(&folders, ScanType::UpdateScan)?;
    }

    let mut watcher_config = session.config.watcher_config();
    watcher_config.monitor_changes = true;
    let requester: Arc<dyn ScanRequester> = manager.clone();
    let _watcher = DirectoryWatcher::with_notify(requester, watcher_config)?;

    info!(target: "scanner::watcher", folders = folders.len(), "Watching collection");
    println!("Watching {} folder(s). Press Ctrl+C to stop.", folders.len());

    loop {
        let outcome = follow_run(&events)?;
        if let Err(e) = report_outcome(&outcome, &processor) {
            warn!(target: "scanner::watcher", error = %e, "Rescan failed");
        }
    }
}

/// List the stored tracks, or albums with `albums`.
pub fn cmd_list(session: &Session, albums: bool) -> anyhow::Result<()> {
    let pool = session.storage.pool();
    if albums {
        for album in session.rt.block_on(db::get_album_summaries(pool))? {
            let artist = album.artist_name.as_deref().unwrap_or("Various Artists");
            println!("{} - {} ({} tracks)", artist, album.name, album.track_count);
        }
    } else {
        for track in session.rt.block_on(db::get_all_tracks_with_album(pool))? {
            println!(
                "{} - {} [{}] {}",
                track.artist_name.as_deref().unwrap_or("Unknown Artist"),
                track.title,
                track.album_name.as_deref().unwrap_or(""),
                track.path
            );
        }
    }
    Ok(())
}

pub fn cmd_version(program: &Path) -> anyhow::Result<()> {
    let version = scanner_version(program)?;
    println!("{}: {}", program.display(), version);
    Ok(())
}
