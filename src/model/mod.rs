//! Core data models for the collection scanner.
//!
//! Transfer types produced by a scan run ([`Directory`], [`Track`]), the
//! run-scoped [`Album`] aggregate built by the processor, and the rows read
//! back from storage.
//!
//! # Database Schema
//!
//! The stored rows map to the following tables:
//! - `directories` - Scanned directories with their last mtime
//! - `artists` - Artist records with unique names
//! - `albums` - Albums with optional artist reference (none = compilation)
//! - `tracks` - Committed tracks keyed by unique id

mod album;
mod directory;
mod track;

pub use album::{Album, TrackRef};
pub use directory::{AlbumGrouping, Directory};
pub use track::{ReplayGain, Track, normalize_unique_id};

use std::fmt;
use std::path::{Path, PathBuf};

use sqlx::FromRow;

/// Kind of scan run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanType {
    /// Rescan everything, overwriting stored values
    FullScan,
    /// Rescan the whole collection, skipping unchanged directories
    UpdateScan,
    /// Rescan only the requested directories
    PartialUpdateScan,
}

impl ScanType {
    /// Whether anything not found in this run may be deleted collection-wide.
    pub fn covers_whole_collection(self) -> bool {
        !matches!(self, Self::PartialUpdateScan)
    }

    /// Pick the scan type for a request.
    ///
    /// An empty request or one naming exactly the collection folders is an
    /// update of the whole collection; anything else is partial.
    pub fn classify(requested: &[PathBuf], collection_folders: &[PathBuf], full: bool) -> Self {
        if full {
            return Self::FullScan;
        }
        if requested.is_empty() {
            return Self::UpdateScan;
        }
        let mut requested: Vec<&Path> = requested.iter().map(PathBuf::as_path).collect();
        let mut folders: Vec<&Path> = collection_folders.iter().map(PathBuf::as_path).collect();
        requested.sort();
        requested.dedup();
        folders.sort();
        folders.dedup();
        if requested == folders {
            Self::UpdateScan
        } else {
            Self::PartialUpdateScan
        }
    }
}

impl fmt::Display for ScanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::FullScan => "full scan",
            Self::UpdateScan => "update scan",
            Self::PartialUpdateScan => "partial update scan",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Stored rows
// ============================================================================

/// A directory as stored in the database.
#[derive(Debug, Clone, FromRow)]
pub struct StoredDirectory {
    pub id: i64,
    pub path: String,
    pub mtime: i64,
}

/// The identifying columns of a stored track.
#[derive(Debug, Clone, FromRow)]
pub struct StoredTrack {
    pub id: i64,
    pub uid: String,
    pub path: String,
}

/// A track joined with its album and artist names, for display.
#[derive(Debug, Clone, FromRow)]
pub struct TrackWithAlbum {
    pub id: i64,
    pub uid: String,
    pub path: String,
    pub title: String,
    pub artist_name: Option<String>,
    pub album_name: Option<String>,
    /// Album artist; `None` for compilations
    pub album_artist: Option<String>,
    pub year: Option<i64>,
    pub track_number: Option<i64>,
}

/// An album with its track count, for display.
#[derive(Debug, Clone, FromRow)]
pub struct AlbumSummary {
    pub id: i64,
    pub name: String,
    pub artist_name: Option<String>,
    pub cover: Option<String>,
    pub track_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_scan_type() {
        let folders = vec![PathBuf::from("/music"), PathBuf::from("/podcasts")];

        assert_eq!(ScanType::classify(&[], &folders, true), ScanType::FullScan);
        assert_eq!(ScanType::classify(&[], &folders, false), ScanType::UpdateScan);
        assert_eq!(
            ScanType::classify(
                &[PathBuf::from("/podcasts"), PathBuf::from("/music")],
                &folders,
                false
            ),
            ScanType::UpdateScan
        );
        assert_eq!(
            ScanType::classify(&[PathBuf::from("/music/Pop")], &folders, false),
            ScanType::PartialUpdateScan
        );
    }

    #[test]
    fn test_partial_scan_is_scoped() {
        assert!(ScanType::FullScan.covers_whole_collection());
        assert!(ScanType::UpdateScan.covers_whole_collection());
        assert!(!ScanType::PartialUpdateScan.covers_whole_collection());
    }
}
