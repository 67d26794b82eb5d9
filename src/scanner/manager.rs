//! Entry point for scan requests.
//!
//! The manager owns at most one [`ScannerJob`] at a time. Requests made
//! while a job is active are rejected, not queued.

use std::ffi::OsStr;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, bounded};
use parking_lot::{Mutex, RwLock};

use super::job::{AbortHandle, ScanSource, ScannerJob, ScannerOptions};
use super::{ScanEvent, ScanRequester, Subscribers};
use crate::error::ScanError;
use crate::model::ScanType;
use crate::storage::DirectoryTimes;

struct ActiveJob {
    id: u64,
    abort: Arc<AbortHandle>,
    _thread: JoinHandle<()>,
}

struct ManagerInner {
    options: ScannerOptions,
    directory_times: RwLock<Option<Arc<dyn DirectoryTimes>>>,
    subscribers: Arc<Subscribers>,
    active: Mutex<Option<ActiveJob>>,
    next_job_id: AtomicU64,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        if let Some(job) = self.active.get_mut().take() {
            job.abort.request("scan manager dropped");
        }
    }
}

/// Starts scanner jobs and forwards their events.
pub struct ScanManager {
    inner: Arc<ManagerInner>,
}

impl ScanManager {
    pub fn new(options: ScannerOptions) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                options,
                directory_times: RwLock::new(None),
                subscribers: Arc::new(Subscribers::new()),
                active: Mutex::new(None),
                next_job_id: AtomicU64::new(1),
            }),
        }
    }

    /// Source of known directory mtimes written to the batch file.
    pub fn with_directory_times(self, source: Arc<dyn DirectoryTimes>) -> Self {
        *self.inner.directory_times.write() = Some(source);
        self
    }

    /// Call `callback` for every event, synchronously on the job thread.
    pub fn subscribe(&self, callback: impl Fn(&ScanEvent) + Send + Sync + 'static) {
        self.inner.subscribers.add(callback);
    }

    /// Receive every event through a bounded channel.
    pub fn subscribe_channel(&self, capacity: usize) -> Receiver<ScanEvent> {
        let (tx, rx) = bounded(capacity);
        self.inner.subscribers.add_channel(tx);
        rx
    }

    /// Scan `directories` (paths or `file://` URLs).
    ///
    /// Non-local and missing directories are skipped with a warning.
    pub fn request_scan<I>(&self, directories: I, scan_type: ScanType) -> Result<(), ScanError>
    where
        I: IntoIterator,
        I::Item: AsRef<OsStr>,
    {
        let mut resolved: Vec<PathBuf> = Vec::new();
        for raw in directories {
            match resolve_local_directory(raw.as_ref()) {
                Ok(path) => {
                    if !resolved.contains(&path) {
                        resolved.push(path);
                    }
                }
                Err(e) => tracing::warn!(target: "scanner::manager", error = %e, "Skipping directory"),
            }
        }
        if resolved.is_empty() {
            tracing::warn!(target: "scanner::manager", %scan_type, "Nothing to scan");
            return Err(ScanError::NoDirectories);
        }

        tracing::info!(
            target: "scanner::manager",
            %scan_type,
            directories = resolved.len(),
            "Scan requested"
        );
        self.start(scan_type, ScanSource::Directories(resolved))
    }

    /// Run the same pipeline over a saved scanner document.
    pub fn request_import(
        &self,
        input: impl Read + Send + 'static,
        scan_type: ScanType,
    ) -> Result<(), ScanError> {
        tracing::info!(target: "scanner::manager", %scan_type, "Import requested");
        self.start(scan_type, ScanSource::Import(Box::new(input)))
    }

    /// Ask the active job to stop. Returns immediately.
    pub fn abort(&self) {
        self.abort_with("aborted by user");
    }

    pub fn abort_with(&self, reason: &str) {
        if let Some(job) = self.inner.active.lock().as_ref() {
            tracing::info!(target: "scanner::manager", reason, "Abort requested");
            job.abort.request(reason);
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.active.lock().is_some()
    }

    fn start(&self, scan_type: ScanType, source: ScanSource) -> Result<(), ScanError> {
        let mut active = self.inner.active.lock();
        if active.is_some() {
            tracing::error!(target: "scanner::manager", "Scan requested while another scan is running");
            return Err(ScanError::AlreadyRunning);
        }

        let known = match &source {
            ScanSource::Directories(_) => self
                .inner
                .directory_times
                .read()
                .as_ref()
                .map(|times| times.known_directories())
                .unwrap_or_default(),
            ScanSource::Import(_) => Vec::new(),
        };

        let id = self.inner.next_job_id.fetch_add(1, Ordering::Relaxed);
        let abort = Arc::new(AbortHandle::default());
        let job = ScannerJob::new(
            scan_type,
            source,
            self.inner.options.clone(),
            abort.clone(),
            self.inner.subscribers.clone(),
        )
        .with_known_directories(known);

        let weak: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        let thread = thread::Builder::new()
            .name("scanner-job".into())
            .spawn(move || {
                let state = job.run();
                tracing::debug!(target: "scanner::manager", job = id, ?state, "Job thread finished");
                if let Some(inner) = weak.upgrade() {
                    let mut active = inner.active.lock();
                    if active.as_ref().is_some_and(|job| job.id == id) {
                        *active = None;
                    }
                }
            })?;

        *active = Some(ActiveJob {
            id,
            abort,
            _thread: thread,
        });
        Ok(())
    }
}

impl ScanRequester for ScanManager {
    fn request_scan(&self, directories: Vec<PathBuf>, scan_type: ScanType) -> Result<(), ScanError> {
        ScanManager::request_scan(self, directories, scan_type)
    }
}

/// Turn a request entry into an existing local directory.
fn resolve_local_directory(raw: &OsStr) -> Result<PathBuf, ScanError> {
    let display = raw.to_string_lossy();
    let path = match raw.to_str().filter(|s| s.contains("://")) {
        Some(text) => {
            let url = url::Url::parse(text)
                .map_err(|e| ScanError::invalid_directory(text, e.to_string()))?;
            if url.scheme() != "file" {
                return Err(ScanError::invalid_directory(
                    text,
                    format!("non-local scheme {}", url.scheme()),
                ));
            }
            url.to_file_path()
                .map_err(|()| ScanError::invalid_directory(text, "not a local file URL"))?
        }
        None => PathBuf::from(raw),
    };

    if !path.is_dir() {
        return Err(ScanError::invalid_directory(display, "not an existing directory"));
    }
    Ok(path)
}

/// Version string reported by `<scanner> --version`.
pub fn scanner_version(program: &Path) -> Result<String, ScanError> {
    let output = Command::new(program)
        .arg("--version")
        .output()
        .map_err(|e| ScanError::ProcessStart {
            path: program.to_path_buf(),
            reason: e.to_string(),
        })?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
