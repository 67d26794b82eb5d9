use std::path::{Path, PathBuf};

/// Position of a track inside the directories buffered for one scan run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackRef {
    pub directory: usize,
    pub track: usize,
}

/// Album aggregate built while reconciling a scan run.
///
/// Holds references into the run's directories rather than owning tracks.
/// An empty `artist` marks a compilation; an empty `name` marks tracks
/// without any album.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Album {
    pub name: String,
    pub artist: String,
    pub tracks: Vec<TrackRef>,
    pub covers: Vec<PathBuf>,
    /// Some member track is explicitly tagged as not a compilation
    pub no_compilation: bool,
}

impl Album {
    pub fn new(name: impl Into<String>, artist: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            artist: artist.into(),
            ..Default::default()
        }
    }

    pub fn is_compilation(&self) -> bool {
        self.artist.is_empty()
    }

    pub fn is_no_album(&self) -> bool {
        self.name.is_empty()
    }

    pub fn add_covers<'a>(&mut self, covers: impl IntoIterator<Item = &'a PathBuf>) {
        for cover in covers {
            if !self.covers.contains(cover) {
                self.covers.push(cover.clone());
            }
        }
    }

    /// Preferred cover image: "front" beats "cover" beats "folder" beats the rest.
    pub fn best_cover(&self) -> Option<&Path> {
        self.covers
            .iter()
            .min_by_key(|path| cover_rank(path))
            .map(PathBuf::as_path)
    }
}

fn cover_rank(path: &Path) -> u8 {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if name.contains("front") {
        0
    } else if name.contains("cover") {
        1
    } else if name.contains("folder") {
        2
    } else {
        3
    }
}
