//! Storage seams used by the scan pipeline.
//!
//! The processor and the scan manager only see these traits; the SQLite
//! backend in [`crate::db`] implements them, and tests can substitute
//! their own.

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::model::{StoredDirectory, StoredTrack, Track};

/// How a reported track overwrites a stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    /// Every field is replaced by the reported value
    Overwrite,
    /// Empty or unknown reported values keep the stored value
    Merge,
}

/// Where committed scan results go.
pub trait CollectionStorage: Send {
    /// Id of the directory row, created or updated with `mtime`.
    fn directory_id(&self, path: &Path, mtime: i64) -> Result<i64>;

    fn stored_directories(&self) -> Result<Vec<StoredDirectory>>;

    /// Remove a directory together with its tracks.
    fn remove_directory(&self, directory_id: i64) -> Result<()>;

    /// Id of the album keyed by name and artist; an empty artist is a
    /// compilation.
    fn album_id(&self, name: &str, artist: &str) -> Result<i64>;

    /// Set the album cover. Without `replace`, an existing cover is kept.
    fn set_album_cover(&self, album_id: i64, cover: &Path, replace: bool) -> Result<()>;

    /// Insert or update a track matched by unique id. A different track
    /// stored at the same path is replaced.
    fn commit_track(
        &self,
        track: &Track,
        directory_id: i64,
        album_id: Option<i64>,
        mode: CommitMode,
    ) -> Result<i64>;

    fn tracks_in_directory(&self, directory_id: i64) -> Result<Vec<StoredTrack>>;

    fn remove_track(&self, track_id: i64) -> Result<()>;
}

/// Receives playlist files found during a scan.
pub trait PlaylistImporter: Send {
    fn import_playlist(&self, path: &Path) -> Result<()>;
}

/// Supplies the last known mtime of every stored directory.
pub trait DirectoryTimes: Send + Sync {
    fn known_directories(&self) -> Vec<(PathBuf, i64)>;
}
