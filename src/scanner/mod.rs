//! Supervision of the external collection scanner.
//!
//! - [`ScanManager`] owns at most one [`ScannerJob`] and is the entry point
//!   for scan, import and abort requests
//! - [`ScannerJob`] runs the scanner subprocess on a worker thread, parses
//!   its streamed XML and restarts it after crashes
//! - [`DirectoryWatcher`](watcher::DirectoryWatcher) requests partial scans
//!   when watched folders change
//!
//! Progress is published as [`ScanEvent`]s, delivered synchronously on the
//! job thread.

pub mod batch;
pub mod job;
pub mod manager;
pub mod state;
pub mod watcher;
pub mod xml;

pub use job::{AbortHandle, JobState, MAX_RESTARTS, ScanSource, ScannerJob, ScannerOptions};
pub use manager::{ScanManager, scanner_version};

use std::path::PathBuf;
use std::sync::Arc;

use crossbeam_channel::Sender;
use parking_lot::RwLock;

use crate::error::ScanError;
use crate::model::{Directory, ScanType};

/// Progress of a scan run, in order:
/// `Started`, then any number of `DirectoryCount`/`IncrementalOutput`/
/// `DirectoryScanned`, then exactly one of `Succeeded`/`Failed`.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    Started(ScanType),
    /// Number of directories the scanner expects to report
    DirectoryCount(usize),
    /// The scanner only reports changed directories, so the run must be
    /// committed as a [`ScanType::PartialUpdateScan`]
    IncrementalOutput,
    /// A directory was parsed. Clone the `Arc` to keep it.
    DirectoryScanned(Arc<Directory>),
    Succeeded,
    Failed(ScanError),
}

impl ScanEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed(_))
    }
}

/// Anything that can start a scan. Implemented by [`ScanManager`].
pub trait ScanRequester: Send + Sync {
    fn request_scan(&self, directories: Vec<PathBuf>, scan_type: ScanType) -> Result<(), ScanError>;
}

type Callback = Box<dyn Fn(&ScanEvent) + Send + Sync>;

/// Registered event listeners.
///
/// Listeners run on the job thread and must not subscribe from inside a
/// callback.
#[derive(Default)]
pub struct Subscribers {
    callbacks: RwLock<Vec<Callback>>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, callback: impl Fn(&ScanEvent) + Send + Sync + 'static) {
        self.callbacks.write().push(Box::new(callback));
    }

    /// Forward events into a channel. A full channel blocks the job until
    /// the receiver catches up; a dropped receiver is ignored.
    pub fn add_channel(&self, sender: Sender<ScanEvent>) {
        self.add(move |event| {
            let _ = sender.send(event.clone());
        });
    }

    pub fn dispatch(&self, event: &ScanEvent) {
        for callback in self.callbacks.read().iter() {
            callback(event);
        }
    }

    pub fn len(&self) -> usize {
        self.callbacks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for Subscribers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscribers").field("count", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_dispatch_reaches_every_subscriber() {
        let subscribers = Subscribers::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = seen.clone();
        subscribers.add(move |e| first.lock().push(("first", e.clone())));
        let second = seen.clone();
        subscribers.add(move |e| second.lock().push(("second", e.clone())));

        subscribers.dispatch(&ScanEvent::Started(ScanType::UpdateScan));

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, "first");
        assert_eq!(seen[1].1, ScanEvent::Started(ScanType::UpdateScan));
    }

    #[test]
    fn test_channel_subscriber_survives_dropped_receiver() {
        let subscribers = Subscribers::new();
        let (tx, rx) = crossbeam_channel::bounded(4);
        subscribers.add_channel(tx);

        subscribers.dispatch(&ScanEvent::DirectoryCount(3));
        assert_eq!(rx.recv().unwrap(), ScanEvent::DirectoryCount(3));

        drop(rx);
        subscribers.dispatch(&ScanEvent::Succeeded);
    }

    #[test]
    fn test_terminal_events() {
        assert!(ScanEvent::Succeeded.is_terminal());
        assert!(ScanEvent::Failed(ScanError::PrematureEnd).is_terminal());
        assert!(!ScanEvent::DirectoryCount(1).is_terminal());
    }
}
