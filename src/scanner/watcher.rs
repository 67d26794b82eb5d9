//! Directory watcher requesting incremental scans.
//!
//! A background thread keeps a filesystem watch on the configured collection
//! folders and turns change notifications into partial update scans.
//!
//! # Design
//!
//! - **Debounced**: every change (re)arms a 2 s timer; when it fires, the
//!   directories containing the changed paths go out as one
//!   [`ScanType::PartialUpdateScan`] request
//! - **Periodic**: the thread wakes every 60 s (or at once on a
//!   configuration change or abort) and syncs the watched set with the
//!   configured folders
//! - **Blockable**: while scanning is blocked, fired requests are deferred
//!   until unblocked
//! - **Retrying**: a request rejected because a scan is running goes back
//!   into the pending set and fires again after another debounce delay
//! - **Recovering**: when monitoring is switched back on, changes missed in
//!   between are picked up with a partial scan over all folders
//!
//! # Usage
//!
//! ```rust,ignore
//! let manager: Arc<ScanManager> = Arc::new(ScanManager::new(options));
//! let watcher = DirectoryWatcher::with_notify(manager, WatcherConfig {
//!     monitor_changes: true,
//!     recursive: true,
//!     collection_folders: vec!["/music".into()],
//! })?;
//!
//! // To stop watching:
//! drop(watcher);
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Condvar, Mutex};

use super::ScanRequester;
use crate::error::ScanError;
use crate::model::ScanType;

pub const WAKE_INTERVAL: Duration = Duration::from_secs(60);
pub const DEBOUNCE_DELAY: Duration = Duration::from_secs(2);

/// Kind of raw filesystem change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsEventKind {
    Created,
    Deleted,
    Modified,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
    pub kind: FsEventKind,
    pub path: PathBuf,
}

/// Filesystem watch capability.
pub trait FsWatch: Send {
    fn watch(&mut self, path: &Path, recursive: bool) -> Result<(), WatchError>;
    fn unwatch(&mut self, path: &Path) -> Result<(), WatchError>;
}

/// [`FsWatch`] backed by the platform's native notification API.
pub struct NotifyWatch {
    watcher: RecommendedWatcher,
}

impl NotifyWatch {
    /// Forward every relevant change to `on_event`, from notify's thread.
    pub fn new(on_event: impl Fn(FsEvent) + Send + 'static) -> Result<Self, WatchError> {
        let watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
            match result {
                Ok(event) => {
                    let Some(kind) = classify(&event.kind) else {
                        return;
                    };
                    for path in event.paths {
                        tracing::trace!(target: "scanner::watcher", path = %path.display(), ?kind, "Change");
                        on_event(FsEvent { kind, path });
                    }
                }
                Err(error) => {
                    tracing::warn!(target: "scanner::watcher", error = %error, "Watch error");
                }
            }
        })
        .map_err(|e| WatchError::Init(e.to_string()))?;
        Ok(Self { watcher })
    }
}

impl FsWatch for NotifyWatch {
    fn watch(&mut self, path: &Path, recursive: bool) -> Result<(), WatchError> {
        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        self.watcher
            .watch(path, mode)
            .map_err(|e| WatchError::Watch(format!("{}: {e}", path.display())))
    }

    fn unwatch(&mut self, path: &Path) -> Result<(), WatchError> {
        self.watcher
            .unwatch(path)
            .map_err(|e| WatchError::Watch(format!("{}: {e}", path.display())))
    }
}

fn classify(kind: &EventKind) -> Option<FsEventKind> {
    match kind {
        EventKind::Create(_) => Some(FsEventKind::Created),
        EventKind::Remove(_) => Some(FsEventKind::Deleted),
        EventKind::Modify(_) => Some(FsEventKind::Modified),
        _ => None,
    }
}

/// What to watch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatcherConfig {
    pub monitor_changes: bool,
    pub recursive: bool,
    pub collection_folders: Vec<PathBuf>,
}

/// Wake-up and debounce intervals.
#[derive(Debug, Clone, Copy)]
pub struct WatcherTimings {
    pub wake_interval: Duration,
    pub debounce: Duration,
}

impl Default for WatcherTimings {
    fn default() -> Self {
        Self {
            wake_interval: WAKE_INTERVAL,
            debounce: DEBOUNCE_DELAY,
        }
    }
}

#[derive(Debug, Default)]
struct WatcherState {
    abort: bool,
    config: WatcherConfig,
    config_changed: bool,
    blocked: bool,
    pending: BTreeSet<PathBuf>,
    debounce_deadline: Option<Instant>,
    /// The debounce fired while blocked
    deferred: bool,
}

#[derive(Debug, Default)]
struct WatcherShared {
    state: Mutex<WatcherState>,
    wake: Condvar,
}

/// Feeds raw changes into a [`DirectoryWatcher`].
#[derive(Debug, Clone)]
pub struct ChangeSink {
    shared: Arc<WatcherShared>,
    debounce: Duration,
}

impl ChangeSink {
    /// Record the directory containing the changed path and rearm the timer.
    pub fn notify(&self, event: FsEvent) {
        let dir = match event.kind {
            FsEventKind::Deleted => event.path.parent().map(Path::to_path_buf),
            _ if event.path.is_dir() => Some(event.path.clone()),
            _ => event.path.parent().map(Path::to_path_buf),
        }
        .unwrap_or(event.path);

        let mut state = self.shared.state.lock();
        state.pending.insert(dir);
        state.debounce_deadline = Some(Instant::now() + self.debounce);
        self.shared.wake.notify_one();
    }
}

/// Handle to the running watcher thread. Dropping it stops the thread.
pub struct DirectoryWatcher {
    shared: Arc<WatcherShared>,
    thread: Option<JoinHandle<()>>,
}

impl DirectoryWatcher {
    /// Start watching with the platform's native notifications.
    pub fn with_notify(
        requester: Arc<dyn ScanRequester>,
        config: WatcherConfig,
    ) -> Result<Self, WatchError> {
        Self::spawn(
            |sink| NotifyWatch::new(move |event| sink.notify(event)),
            requester,
            config,
            WatcherTimings::default(),
        )
    }

    /// Start the watcher thread around the watch built by `make_watch`.
    pub fn spawn<W, F>(
        make_watch: F,
        requester: Arc<dyn ScanRequester>,
        config: WatcherConfig,
        timings: WatcherTimings,
    ) -> Result<Self, WatchError>
    where
        W: FsWatch + 'static,
        F: FnOnce(ChangeSink) -> Result<W, WatchError>,
    {
        let shared = Arc::new(WatcherShared::default());
        {
            let mut state = shared.state.lock();
            state.config = config;
            state.config_changed = true;
        }

        let watch = make_watch(ChangeSink {
            shared: shared.clone(),
            debounce: timings.debounce,
        })?;

        let worker = Worker {
            shared: shared.clone(),
            watch,
            requester,
            timings,
            watched: BTreeMap::new(),
            watching: false,
            was_stopped: false,
        };
        let thread = thread::Builder::new()
            .name("directory-watcher".into())
            .spawn(move || worker.run())
            .map_err(|e| WatchError::Init(e.to_string()))?;

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Replace the configuration and wake the thread.
    pub fn set_configuration(&self, config: WatcherConfig) {
        let mut state = self.shared.state.lock();
        state.config = config;
        state.config_changed = true;
        self.shared.wake.notify_one();
    }

    /// While blocked, fired scan requests are held back.
    pub fn set_block_scanning(&self, blocked: bool) {
        let mut state = self.shared.state.lock();
        state.blocked = blocked;
        if !blocked && state.deferred {
            state.deferred = false;
            state.debounce_deadline = Some(Instant::now());
            self.shared.wake.notify_one();
        }
    }

    pub fn request_abort(&self) {
        let mut state = self.shared.state.lock();
        state.abort = true;
        self.shared.wake.notify_one();
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        self.request_abort();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        tracing::debug!(target: "scanner::watcher", "Directory watcher stopped");
    }
}

struct Worker<W: FsWatch> {
    shared: Arc<WatcherShared>,
    watch: W,
    requester: Arc<dyn ScanRequester>,
    timings: WatcherTimings,
    /// Watched folder -> recursive
    watched: BTreeMap<PathBuf, bool>,
    watching: bool,
    was_stopped: bool,
}

impl<W: FsWatch> Worker<W> {
    fn run(mut self) {
        let mut next_wake = Instant::now();
        loop {
            let mut flush = Vec::new();
            let mut config = None;
            {
                let mut state = self.shared.state.lock();
                let now = loop {
                    if state.abort {
                        drop(state);
                        self.stop_watching();
                        return;
                    }
                    let now = Instant::now();
                    let debounce_due = state.debounce_deadline.is_some_and(|d| d <= now);
                    if state.config_changed || debounce_due || now >= next_wake {
                        break now;
                    }
                    let deadline = state
                        .debounce_deadline
                        .map_or(next_wake, |d| d.min(next_wake));
                    self.shared.wake.wait_until(&mut state, deadline);
                };

                if state.debounce_deadline.is_some_and(|d| d <= now) {
                    state.debounce_deadline = None;
                    if state.blocked {
                        tracing::debug!(target: "scanner::watcher", pending = state.pending.len(), "Scanning blocked, deferring");
                        state.deferred = true;
                    } else {
                        flush = std::mem::take(&mut state.pending).into_iter().collect();
                    }
                }

                if state.config_changed || now >= next_wake {
                    state.config_changed = false;
                    config = Some(state.config.clone());
                    next_wake = now + self.timings.wake_interval;
                }
            }

            if !flush.is_empty() {
                self.request(flush, "Changes detected");
            }
            if let Some(config) = config {
                self.sync_watches(&config);
            }
        }
    }

    fn request(&self, directories: Vec<PathBuf>, reason: &str) {
        tracing::info!(target: "scanner::watcher", directories = directories.len(), reason, "Requesting partial scan");
        match self
            .requester
            .request_scan(directories.clone(), ScanType::PartialUpdateScan)
        {
            Ok(()) => {}
            Err(ScanError::AlreadyRunning) => {
                tracing::debug!(target: "scanner::watcher", "Scan in progress, retrying later");
                let mut state = self.shared.state.lock();
                state.pending.extend(directories);
                state.debounce_deadline = Some(Instant::now() + self.timings.debounce);
            }
            Err(e) => {
                tracing::warn!(target: "scanner::watcher", error = %e, "Scan request rejected");
            }
        }
    }

    fn sync_watches(&mut self, config: &WatcherConfig) {
        if !config.monitor_changes {
            if self.watching {
                self.stop_watching();
                self.was_stopped = true;
            }
            return;
        }

        if !self.watching && self.was_stopped && !config.collection_folders.is_empty() {
            self.request(config.collection_folders.clone(), "Monitoring restarted");
        }
        self.watching = true;
        self.was_stopped = false;

        let wanted: BTreeSet<&PathBuf> = config.collection_folders.iter().collect();
        let stale: Vec<PathBuf> = self
            .watched
            .iter()
            .filter(|(path, recursive)| !wanted.contains(path) || **recursive != config.recursive)
            .map(|(path, _)| path.clone())
            .collect();
        for path in stale {
            tracing::info!(target: "scanner::watcher", path = %path.display(), "Unwatching directory");
            if let Err(e) = self.watch.unwatch(&path) {
                tracing::warn!(target: "scanner::watcher", error = %e, "Unwatch failed");
            }
            self.watched.remove(&path);
        }

        for folder in wanted {
            if self.watched.contains_key(folder) {
                continue;
            }
            tracing::info!(target: "scanner::watcher", path = %folder.display(), recursive = config.recursive, "Watching directory");
            match self.watch.watch(folder, config.recursive) {
                Ok(()) => {
                    self.watched.insert(folder.clone(), config.recursive);
                }
                Err(e) => tracing::warn!(target: "scanner::watcher", error = %e, "Watch failed"),
            }
        }
    }

    fn stop_watching(&mut self) {
        for path in std::mem::take(&mut self.watched).into_keys() {
            if let Err(e) = self.watch.unwatch(&path) {
                tracing::warn!(target: "scanner::watcher", error = %e, "Unwatch failed");
            }
        }
        if self.watching {
            tracing::info!(target: "scanner::watcher", "Stopped monitoring changes");
        }
        self.watching = false;
    }
}

/// Errors that can occur during file watching.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WatchError {
    #[error("Failed to initialize watcher: {0}")]
    Init(String),
    #[error("Failed to watch path: {0}")]
    Watch(String),
}
