use std::collections::BTreeSet;
use std::path::PathBuf;

use super::Track;

/// Tracks the scanner grouped under an explicit `<album>` element.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlbumGrouping {
    pub name: String,
    /// Indices into [`Directory::tracks`]
    pub tracks: Vec<usize>,
}

/// One scanned directory and everything found directly inside it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Directory {
    pub path: PathBuf,
    /// Path relative to the mount point
    pub rpath: String,
    /// Modification time (seconds since the epoch)
    pub mtime: i64,
    /// Not rescanned this run (unchanged since the last scan)
    pub skipped: bool,
    pub tracks: Vec<Track>,
    pub album_groupings: Vec<AlbumGrouping>,
    pub playlists: BTreeSet<PathBuf>,
    /// Cover image candidates
    pub covers: BTreeSet<PathBuf>,
}

impl Directory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Last path component, used as the album name for untagged directories.
    pub fn base_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }

    /// Distinct non-empty album names tagged on this directory's tracks.
    pub fn album_names(&self) -> BTreeSet<&str> {
        self.tracks
            .iter()
            .map(|t| t.album.as_str())
            .filter(|name| !name.is_empty())
            .collect()
    }
}
