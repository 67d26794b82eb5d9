//! Test utilities and fixtures for collection-scanner tests.
//!
//! Builders for scanned directories and tracks, a temporary SQLite
//! storage, event collectors and (on unix) a shell script standing in for
//! the scanner binary.
//!
//! # Example
//!
//! ```ignore
//! use crate::test_utils::{temp_storage, thriller_directory};
//!
//! #[test]
//! fn test_something() {
//!     let (rt, storage, _dir) = temp_storage();
//!     let dir = thriller_directory();
//!     // ... test logic
//! }
//! ```

#[cfg(unix)]
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::runtime::Runtime;

use crate::db::SqliteStorage;
use crate::model::{Directory, Track};
#[cfg(unix)]
use crate::scanner::ScannerOptions;
use crate::scanner::{ScanEvent, Subscribers};

/// Track titles of the Thriller fixture, in album order.
pub const THRILLER_TITLES: [&str; 9] = [
    "Wanna Be Startin' Somethin'",
    "Baby Be Mine",
    "The Girl Is Mine",
    "Thriller",
    "Beat It",
    "Billie Jean",
    "Human Nature",
    "P.Y.T. (Pretty Young Thing)",
    "The Lady in My Life",
];

/// Creates a temporary database behind the synchronous storage adapter.
///
/// Keep the `TempDir` alive for the duration of your test. The runtime
/// drives the pool; the storage blocks on it, so call it from plain
/// `#[test]` functions rather than `#[tokio::test]`.
pub fn temp_storage() -> (Runtime, SqliteStorage, TempDir) {
    let dir = tempfile::tempdir().expect("Failed to create temp directory");
    let url = crate::db::db_url(Some(&dir.path().join("test.db")));

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .expect("Failed to build runtime");
    let pool = rt
        .block_on(crate::db::init_db(&url))
        .expect("Failed to initialize test database");
    let storage = SqliteStorage::new(pool, rt.handle().clone());

    (rt, storage, dir)
}

/// A track with the given identity and tags.
pub fn track(uid: &str, path: &str, artist: &str, album: &str) -> Track {
    let mut track = Track::new(uid, path);
    track.artist = artist.to_string();
    track.album = album.to_string();
    track
}

pub fn directory(path: &str, tracks: Vec<Track>) -> Directory {
    let mut dir = Directory::new(path);
    dir.mtime = 1_700_000_000;
    dir.tracks = tracks;
    dir
}

/// `/music/Pop/Thriller` with its nine tracks by Michael Jackson.
pub fn thriller_directory() -> Directory {
    let tracks = THRILLER_TITLES
        .iter()
        .enumerate()
        .map(|(i, title)| {
            let n = i + 1;
            let mut t = track(
                &format!("thriller-{n:02}"),
                &format!("/music/Pop/Thriller/{n:02}.mp3"),
                "Michael Jackson",
                "Thriller",
            );
            t.title = title.to_string();
            t.track_number = Some(n as i32);
            t.year = Some(1982);
            t.genre = "Pop".to_string();
            t
        })
        .collect();
    directory("/music/Pop/Thriller", tracks)
}

/// Record every event dispatched to `subscribers`.
pub fn collect_events(subscribers: &Subscribers) -> Arc<Mutex<Vec<ScanEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    subscribers.add(move |event| sink.lock().push(event.clone()));
    events
}

/// Paths of the scanned directories, in report order.
pub fn scanned_paths(events: &[ScanEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            ScanEvent::DirectoryScanned(dir) => Some(dir.path.display().to_string()),
            _ => None,
        })
        .collect()
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Argument parsing shared by every fake scanner script.
///
/// Exposes `$STATE` (diagnostics file), `$BATCH` (batch file) and `$SKIP`
/// (`1` when restarted after a crash).
#[cfg(unix)]
const FAKE_SCANNER_PRELUDE: &str = r#"STATE=""
BATCH=""
SKIP=0
while [ $# -gt 0 ]; do
    case "$1" in
        --sharedmemory) STATE="$2"; shift ;;
        --batch) BATCH="$2"; shift ;;
        -s) SKIP=1 ;;
    esac
    shift
done
"#;

/// Scanner options running `body` as a shell script inside `work_dir`.
///
/// The script is run through `/bin/sh` so it never needs an exec bit.
#[cfg(unix)]
pub fn fake_scanner(work_dir: &Path, body: &str) -> ScannerOptions {
    let script = work_dir.join("fake-scanner.sh");
    std::fs::write(&script, format!("{FAKE_SCANNER_PRELUDE}{body}"))
        .expect("Failed to write fake scanner");

    ScannerOptions {
        program: "/bin/sh".into(),
        program_args: vec![script.into_os_string()],
        crash_diagnostics: true,
        batch_dir: Some(work_dir.to_path_buf()),
        ..ScannerOptions::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_storage_creates_working_database() {
        let (rt, storage, _dir) = temp_storage();
        let count = rt.block_on(crate::db::count_tracks(storage.pool())).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_thriller_fixture() {
        let dir = thriller_directory();
        assert_eq!(dir.tracks.len(), 9);
        assert_eq!(dir.base_name(), "Thriller");
        assert_eq!(dir.tracks[5].title, "Billie Jean");
        assert!(dir.tracks.iter().all(|t| t.has_unique_id()));
    }

    #[test]
    fn test_collect_events() {
        let subscribers = Subscribers::new();
        let events = collect_events(&subscribers);
        subscribers.dispatch(&ScanEvent::DirectoryScanned(Arc::new(Directory::new("/music/a"))));
        subscribers.dispatch(&ScanEvent::Succeeded);

        let events = events.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(scanned_paths(&events), vec!["/music/a"]);
    }
}
