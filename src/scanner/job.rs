//! One scan run: the scanner subprocess (or an import stream), its output
//! parser and crash recovery.
//!
//! # State machine
//!
//! ```text
//! Created -> Running -> (Restarting -> Running)* -> Succeeded | Failed | Aborted
//! ```
//!
//! The job is driven by [`ScannerJob::run`] on a worker thread. Output is
//! pumped from the subprocess by a helper thread into a bounded channel,
//! which the job polls with a timeout so an abort request is noticed
//! promptly even while the scanner is silent.

use std::collections::HashSet;
use std::ffi::OsString;
use std::io::{ErrorKind, Read};
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, bounded};
use parking_lot::Mutex;
use tempfile::TempPath;

use super::batch::BatchFile;
use super::state::ScannerStateRegion;
use super::xml::{ScannerEvent, ScannerXmlReader};
use super::{ScanEvent, Subscribers};
use crate::error::ScanError;
use crate::model::ScanType;

/// Crashes tolerated before the job gives up.
pub const MAX_RESTARTS: u32 = 40;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const READ_CHUNK: usize = 64 * 1024;
const OUTPUT_CHANNEL_CAPACITY: usize = 32;

/// How the scanner subprocess is launched.
#[derive(Debug, Clone)]
pub struct ScannerOptions {
    /// Scanner binary
    pub program: PathBuf,
    /// Arguments placed before the scanner flags (e.g. for a wrapper)
    pub program_args: Vec<OsString>,
    pub recursive: bool,
    pub charset_detection: bool,
    pub idle_priority: bool,
    /// Allocate the crash-diagnostics region
    pub crash_diagnostics: bool,
    /// Where the batch file is written (system temp dir if unset)
    pub batch_dir: Option<PathBuf>,
}

impl Default for ScannerOptions {
    fn default() -> Self {
        Self {
            program: PathBuf::from("collectionscanner"),
            program_args: Vec::new(),
            recursive: true,
            charset_detection: false,
            idle_priority: true,
            crash_diagnostics: true,
            batch_dir: None,
        }
    }
}

impl ScannerOptions {
    /// Command line for one launch of the scanner.
    fn arguments(
        &self,
        scan_type: ScanType,
        batch: Option<&std::path::Path>,
        state_key: Option<&std::path::Path>,
        restart: bool,
    ) -> Vec<OsString> {
        let mut args = self.program_args.clone();
        if self.idle_priority {
            args.push("--idlepriority".into());
        }
        if scan_type != ScanType::FullScan {
            args.push("-i".into());
        }
        if let Some(batch) = batch {
            args.push("--batch".into());
            args.push(batch.into());
        }
        if self.recursive {
            args.push("-r".into());
        }
        if self.charset_detection {
            args.push("-c".into());
        }
        if restart {
            args.push("-s".into());
        }
        if let Some(key) = state_key {
            args.push("--sharedmemory".into());
            args.push(key.into());
        }
        args
    }
}

/// Where the XML comes from.
pub enum ScanSource {
    /// Run the scanner over these directories
    Directories(Vec<PathBuf>),
    /// Read a previously saved scanner document
    Import(Box<dyn Read + Send>),
}

impl std::fmt::Debug for ScanSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Directories(dirs) => f.debug_tuple("Directories").field(dirs).finish(),
            Self::Import(_) => f.write_str("Import(..)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Created,
    Running,
    Restarting,
    Succeeded,
    Failed,
    Aborted,
}

/// Cooperative abort flag shared between a job and whoever started it.
#[derive(Debug, Default)]
pub struct AbortHandle {
    reason: Mutex<Option<String>>,
}

impl AbortHandle {
    /// Ask the job to stop. The first reason given is kept.
    pub fn request(&self, reason: impl Into<String>) {
        let mut current = self.reason.lock();
        if current.is_none() {
            *current = Some(reason.into());
        }
    }

    fn check(&self) -> Result<(), ScanError> {
        match self.reason.lock().as_ref() {
            Some(reason) => Err(ScanError::Aborted(reason.clone())),
            None => Ok(()),
        }
    }
}

enum OutputChunk {
    Data(Vec<u8>),
    Closed,
    Failed(String),
}

/// A running scanner process and the thread pumping its stdout.
struct ScannerProcess {
    child: Child,
    output: Receiver<OutputChunk>,
}

impl ScannerProcess {
    fn spawn(program: &std::path::Path, args: &[OsString]) -> Result<Self, ScanError> {
        let start_error = |reason: String| ScanError::ProcessStart {
            path: program.to_path_buf(),
            reason,
        };

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| start_error(e.to_string()))?;

        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(start_error("stdout not captured".to_string()));
        };

        match spawn_output_pump(stdout) {
            Ok(output) => {
                tracing::info!(
                    target: "scanner::job",
                    program = %program.display(),
                    pid = child.id(),
                    "Scanner process started"
                );
                Ok(Self { child, output })
            }
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                Err(start_error(e.to_string()))
            }
        }
    }

    fn wait(&mut self) -> Result<ExitStatus, ScanError> {
        Ok(self.child.wait()?)
    }

    fn kill(mut self) {
        // Already exited is fine
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn spawn_output_pump(mut stdout: ChildStdout) -> std::io::Result<Receiver<OutputChunk>> {
    let (tx, rx) = bounded(OUTPUT_CHANNEL_CAPACITY);
    thread::Builder::new()
        .name("scanner-output".into())
        .spawn(move || {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                let chunk = match stdout.read(&mut buf) {
                    Ok(0) => OutputChunk::Closed,
                    Ok(n) => OutputChunk::Data(buf[..n].to_vec()),
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => OutputChunk::Failed(e.to_string()),
                };
                let last = !matches!(chunk, OutputChunk::Data(_));
                if tx.send(chunk).is_err() || last {
                    break;
                }
            }
        })?;
    Ok(rx)
}

#[cfg(unix)]
fn is_abnormal(status: ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal().is_some()
}

#[cfg(not(unix))]
fn is_abnormal(status: ExitStatus) -> bool {
    !status.success()
}

/// A single scan run.
pub struct ScannerJob {
    scan_type: ScanType,
    source: Option<ScanSource>,
    options: ScannerOptions,
    known_directories: Vec<(PathBuf, i64)>,
    abort: Arc<AbortHandle>,
    subscribers: Arc<Subscribers>,

    state: JobState,
    reader: ScannerXmlReader,
    reported: HashSet<PathBuf>,
    bad_files: Vec<PathBuf>,
    restart_count: u32,
    process: Option<ScannerProcess>,
    state_region: Option<ScannerStateRegion>,
    batch_file: Option<TempPath>,
}

impl ScannerJob {
    pub fn new(
        scan_type: ScanType,
        source: ScanSource,
        options: ScannerOptions,
        abort: Arc<AbortHandle>,
        subscribers: Arc<Subscribers>,
    ) -> Self {
        Self {
            scan_type,
            source: Some(source),
            options,
            known_directories: Vec::new(),
            abort,
            subscribers,
            state: JobState::Created,
            reader: ScannerXmlReader::new(),
            reported: HashSet::new(),
            bad_files: Vec::new(),
            restart_count: 0,
            process: None,
            state_region: None,
            batch_file: None,
        }
    }

    /// Directory mtimes already known to the collection, for the batch file.
    pub fn with_known_directories(mut self, known: Vec<(PathBuf, i64)>) -> Self {
        self.known_directories = known;
        self
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Run to completion and return the final state.
    ///
    /// Emits `Started`, then progress, then exactly one terminal event.
    pub fn run(mut self) -> JobState {
        self.set_state(JobState::Running);
        self.emit(ScanEvent::Started(self.scan_type));

        let result = match self.source.take() {
            Some(ScanSource::Directories(dirs)) => self.run_scanner(&dirs),
            Some(ScanSource::Import(input)) => self.run_import(input),
            None => Err(ScanError::NoDirectories),
        };
        self.release();

        match result {
            Ok(()) => {
                self.set_state(JobState::Succeeded);
                tracing::info!(
                    target: "scanner::job",
                    directories = self.reported.len(),
                    restarts = self.restart_count,
                    "Scan finished"
                );
                self.emit(ScanEvent::Succeeded);
            }
            Err(err) => {
                if err.is_abort() {
                    self.set_state(JobState::Aborted);
                    tracing::info!(target: "scanner::job", reason = %err, "Scan aborted");
                } else {
                    self.set_state(JobState::Failed);
                    tracing::error!(target: "scanner::job", error = %err, "Scan failed");
                }
                self.emit(ScanEvent::Failed(err));
            }
        }
        self.state
    }

    fn run_scanner(&mut self, dirs: &[PathBuf]) -> Result<(), ScanError> {
        self.abort.check()?;

        if self.options.crash_diagnostics {
            match ScannerStateRegion::create() {
                Ok(region) => self.state_region = Some(region),
                Err(e) => tracing::warn!(
                    target: "scanner::job",
                    error = %e,
                    "Unable to create crash-diagnostics region, bad files will not be reported"
                ),
            }
        }

        let batch_dir = self
            .options
            .batch_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        let batch = BatchFile::new(dirs.to_vec()).with_time_definitions(self.known_directories.clone());
        self.batch_file = Some(batch.write_temp(&batch_dir)?);

        self.launch(false)?;

        loop {
            self.abort.check()?;

            let received = match self.process.as_ref() {
                Some(process) => process.output.recv_timeout(POLL_INTERVAL),
                None => return Err(ScanError::Io("scanner process missing".to_string())),
            };

            match received {
                Ok(OutputChunk::Data(bytes)) => {
                    if self.consume(&bytes)? {
                        return Ok(());
                    }
                }
                Ok(OutputChunk::Failed(reason)) => return Err(ScanError::Io(reason)),
                Err(RecvTimeoutError::Timeout) => {}
                Ok(OutputChunk::Closed) | Err(RecvTimeoutError::Disconnected) => {
                    let status = match self.process.as_mut() {
                        Some(process) => process.wait()?,
                        None => return Err(ScanError::Io("scanner process missing".to_string())),
                    };
                    self.process = None;

                    // abort wins over restart
                    self.abort.check()?;

                    if !is_abnormal(status) {
                        tracing::debug!(target: "scanner::job", %status, "Scanner exited");
                        return self.reader.finish();
                    }
                    self.restart_after_crash(status)?;
                }
            }
        }
    }

    fn run_import(&mut self, mut input: Box<dyn Read + Send>) -> Result<(), ScanError> {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            self.abort.check()?;
            let n = match input.read(&mut buf) {
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            if n == 0 {
                return self.reader.finish();
            }
            if self.consume(&buf[..n])? {
                return Ok(());
            }
        }
    }

    /// Parse a chunk and publish what it completed. Returns `true` once the
    /// document is closed.
    fn consume(&mut self, bytes: &[u8]) -> Result<bool, ScanError> {
        let mut finished = false;
        let parsed = self.reader.feed(bytes);
        for event in parsed.events {
            match event {
                ScannerEvent::DirectoryCount(count) => {
                    self.emit(ScanEvent::DirectoryCount(count));
                }
                ScannerEvent::Incremental => {
                    tracing::debug!(target: "scanner::job", "Scanner reports changed directories only");
                    self.emit(ScanEvent::IncrementalOutput);
                }
                ScannerEvent::Directory(dir) => {
                    if !self.reported.insert(dir.path.clone()) {
                        tracing::debug!(
                            target: "scanner::job",
                            path = %dir.path.display(),
                            "Directory already reported, ignoring"
                        );
                        continue;
                    }
                    self.emit(ScanEvent::DirectoryScanned(Arc::new(dir)));
                }
                ScannerEvent::Finished => finished = true,
            }
        }
        match parsed.error {
            Some(error) => Err(error),
            None => Ok(finished),
        }
    }

    fn restart_after_crash(&mut self, status: ExitStatus) -> Result<(), ScanError> {
        self.restart_count += 1;

        let progress = self
            .state_region
            .as_ref()
            .and_then(|region| region.read().ok())
            .unwrap_or_default();
        tracing::warn!(
            target: "scanner::job",
            %status,
            restarts = self.restart_count,
            directory = ?progress.last_directory,
            file = ?progress.last_file,
            "Scanner crashed"
        );
        if let Some(file) = progress.last_file {
            if !self.bad_files.contains(&file) {
                self.bad_files.push(file);
            }
        }

        if self.restart_count >= MAX_RESTARTS {
            return Err(ScanError::TooManyCrashes {
                bad_files: self.bad_files.clone(),
            });
        }

        self.set_state(JobState::Restarting);
        self.reader.restart();
        self.launch(true)?;
        self.set_state(JobState::Running);
        Ok(())
    }

    fn launch(&mut self, restart: bool) -> Result<(), ScanError> {
        // a restarted scanner reads the region to skip past the bad file
        if !restart {
            if let Some(region) = &self.state_region {
                if let Err(e) = region.clear() {
                    tracing::warn!(target: "scanner::job", error = %e, "Unable to reset crash-diagnostics region");
                }
            }
        }
        let args = self.options.arguments(
            self.scan_type,
            self.batch_file.as_deref(),
            self.state_region.as_ref().map(ScannerStateRegion::key),
            restart,
        );
        tracing::debug!(target: "scanner::job", ?args, restart, "Launching scanner");
        self.process = Some(ScannerProcess::spawn(&self.options.program, &args)?);
        Ok(())
    }

    fn release(&mut self) {
        if let Some(process) = self.process.take() {
            process.kill();
        }
        self.batch_file = None;
        self.state_region = None;
    }

    fn set_state(&mut self, state: JobState) {
        tracing::trace!(target: "scanner::job", from = ?self.state, to = ?state, "Job state");
        self.state = state;
    }

    fn emit(&self, event: ScanEvent) {
        self.subscribers.dispatch(&event);
    }
}

impl Drop for ScannerJob {
    fn drop(&mut self) {
        self.release();
    }
}
