//! A single audio file as reported by the scanner.

use std::path::PathBuf;

/// Replay-gain values in dB (peaks as reported by the scanner).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ReplayGain {
    pub track_gain: Option<f32>,
    pub track_peak: Option<f32>,
    pub album_gain: Option<f32>,
    pub album_peak: Option<f32>,
}

/// A scanned track.
///
/// Text fields are empty when the tag is missing; numeric fields are `None`
/// when the scanner did not report a value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Track {
    /// Stable unique id (leading `/` stripped)
    pub unique_id: String,
    /// Absolute file path
    pub path: PathBuf,
    /// Path relative to the mount point
    pub rpath: String,
    /// Scanner-specific file type code
    pub filetype: Option<i32>,

    pub title: String,
    pub artist: String,
    pub album_artist: String,
    pub album: String,
    pub composer: String,
    pub genre: String,
    pub comment: String,

    pub year: Option<i32>,
    pub track_number: Option<i32>,
    pub disc_number: Option<i32>,

    /// Tagged as part of a compilation
    pub compilation: bool,
    /// Explicitly tagged as *not* a compilation
    pub no_compilation: bool,
    /// The file carries an embedded cover
    pub has_cover: bool,

    pub bpm: Option<f32>,
    /// kbit/s
    pub bitrate: Option<i32>,
    /// Milliseconds
    pub length: Option<i64>,
    pub samplerate: Option<i32>,
    /// Bytes
    pub filesize: Option<i64>,
    /// File modification time (seconds since the epoch)
    pub modified: Option<i64>,

    pub replay_gain: ReplayGain,
    pub rating: Option<f32>,
    pub score: Option<f32>,
    pub playcount: Option<i32>,
}

impl Track {
    /// Track with an id and path and no tags.
    pub fn new(unique_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            unique_id: normalize_unique_id(&unique_id.into()),
            path: path.into(),
            ..Default::default()
        }
    }

    /// Whether the scanner reported a usable unique id.
    pub fn has_unique_id(&self) -> bool {
        !self.unique_id.trim().is_empty()
    }

    /// File name without directories, for log messages.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// Strip the leading `/` characters some scanners prepend to unique ids.
pub fn normalize_unique_id(raw: &str) -> String {
    raw.trim().trim_start_matches('/').to_string()
}
