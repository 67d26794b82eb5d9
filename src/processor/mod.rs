//! Reconciliation of scan results with the stored collection.
//!
//! [`ScanResultProcessor`] buffers every scanned directory of a run and, once
//! the run succeeds, commits playlists, directories, albums and tracks, then
//! deletes whatever the run proved to be gone.

mod albums;
mod artist;

pub use albums::plan_albums;
pub use artist::{guess_album_artist, is_non_compilation_name, real_track_artist};

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Result, ScanError};
use crate::model::{Directory, ScanType, TrackRef};
use crate::scanner::{ScanEvent, ScanManager};
use crate::storage::{CollectionStorage, CommitMode, PlaylistImporter};

/// Commit progress reported to the optional progress callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorProgress {
    Directories { done: usize, total: usize },
    Albums { done: usize, total: usize },
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Collecting(ScanType),
}

type ProgressFn = Box<dyn FnMut(ProcessorProgress) + Send>;

/// Turns the events of a scan run into storage updates.
pub struct ScanResultProcessor<S: CollectionStorage> {
    storage: S,
    playlists: Option<Box<dyn PlaylistImporter>>,
    collection_folders: Vec<PathBuf>,
    progress: Option<ProgressFn>,
    phase: Phase,
    expected: usize,
    directories: Vec<Arc<Directory>>,
    last_errors: Vec<String>,
    last_failure: Option<ScanError>,
}

impl<S: CollectionStorage> ScanResultProcessor<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            playlists: None,
            collection_folders: Vec::new(),
            progress: None,
            phase: Phase::Idle,
            expected: 0,
            directories: Vec::new(),
            last_errors: Vec::new(),
            last_failure: None,
        }
    }

    pub fn with_playlist_importer(mut self, importer: Box<dyn PlaylistImporter>) -> Self {
        self.playlists = Some(importer);
        self
    }

    /// Folders whose presence decides whether missing directories are deleted.
    pub fn with_collection_folders(mut self, folders: Vec<PathBuf>) -> Self {
        self.collection_folders = folders;
        self
    }

    pub fn with_progress(mut self, progress: impl FnMut(ProcessorProgress) + Send + 'static) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Non-fatal problems recorded by the last commit.
    pub fn last_errors(&self) -> &[String] {
        &self.last_errors
    }

    /// Why the last run failed, if it did.
    pub fn last_failure(&self) -> Option<&ScanError> {
        self.last_failure.as_ref()
    }

    /// Whether a run is being collected.
    pub fn is_collecting(&self) -> bool {
        matches!(self.phase, Phase::Collecting(_))
    }

    /// Feed one event. Storage errors during the commit are returned; events
    /// arriving out of order are logged and ignored.
    pub fn handle(&mut self, event: &ScanEvent) -> Result<()> {
        match (event, self.phase) {
            (ScanEvent::Started(scan_type), phase) => {
                if phase != Phase::Idle {
                    tracing::warn!(target: "processor", "Run started before the previous one finished, discarding it");
                }
                self.reset();
                self.last_errors.clear();
                self.last_failure = None;
                self.phase = Phase::Collecting(*scan_type);
            }
            (ScanEvent::DirectoryCount(count), Phase::Collecting(_)) => {
                self.expected = *count;
                self.directories.reserve(*count);
            }
            (ScanEvent::IncrementalOutput, Phase::Collecting(scan_type)) => {
                if scan_type != ScanType::PartialUpdateScan {
                    tracing::info!(target: "processor", %scan_type, "Incremental scanner output, committing as a partial update");
                    self.phase = Phase::Collecting(ScanType::PartialUpdateScan);
                }
            }
            (ScanEvent::DirectoryScanned(dir), Phase::Collecting(_)) => {
                self.directories.push(Arc::clone(dir));
            }
            (ScanEvent::Succeeded, Phase::Collecting(scan_type)) => {
                let directories = std::mem::take(&mut self.directories);
                self.reset();
                let result = self.commit(scan_type, &directories);
                if let Err(e) = &result {
                    tracing::error!(target: "processor", error = %e, "Commit failed");
                }
                self.report(ProcessorProgress::Done);
                return result;
            }
            (ScanEvent::Failed(error), Phase::Collecting(_)) => {
                tracing::warn!(
                    target: "processor",
                    error = %error,
                    directories = self.directories.len(),
                    "Scan failed, nothing committed"
                );
                self.last_failure = Some(error.clone());
                self.reset();
                self.report(ProcessorProgress::Done);
            }
            (event, Phase::Idle) => {
                tracing::warn!(target: "processor", ?event, "Ignoring event outside of a scan run");
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.phase = Phase::Idle;
        self.expected = 0;
        self.directories.clear();
    }

    fn report(&mut self, progress: ProcessorProgress) {
        if let Some(callback) = self.progress.as_mut() {
            callback(progress);
        }
    }

    fn record(&mut self, message: String) {
        tracing::warn!(target: "processor", "{message}");
        self.last_errors.push(message);
    }

    fn commit(&mut self, scan_type: ScanType, directories: &[Arc<Directory>]) -> Result<()> {
        tracing::info!(
            target: "processor",
            %scan_type,
            directories = directories.len(),
            "Committing scan results"
        );

        self.commit_playlists(directories);

        let total = directories.len();
        let mut directory_ids = Vec::with_capacity(total);
        for (i, dir) in directories.iter().enumerate() {
            directory_ids.push(self.storage.directory_id(&dir.path, dir.mtime)?);
            self.report(ProcessorProgress::Directories { done: i + 1, total });
        }

        let album_ids = self.commit_albums(scan_type, directories)?;

        let mode = if scan_type == ScanType::FullScan {
            CommitMode::Overwrite
        } else {
            CommitMode::Merge
        };
        let mut found: HashSet<&str> = HashSet::new();
        let mut committed = 0usize;
        for (d, dir) in directories.iter().enumerate() {
            if dir.skipped {
                continue;
            }
            for (t, track) in dir.tracks.iter().enumerate() {
                if !track.has_unique_id() {
                    self.record(format!("Track without unique id skipped: {}", track.path.display()));
                    continue;
                }
                if !found.insert(track.unique_id.as_str()) {
                    self.record(format!(
                        "Duplicate unique id {} skipped: {}",
                        track.unique_id,
                        track.path.display()
                    ));
                    continue;
                }
                let album_id = album_ids
                    .get(&TrackRef { directory: d, track: t })
                    .copied()
                    .flatten();
                self.storage.commit_track(track, directory_ids[d], album_id, mode)?;
                committed += 1;
            }
        }

        let mut removed_tracks = 0usize;
        for (d, dir) in directories.iter().enumerate() {
            if dir.skipped {
                continue;
            }
            for stored in self.storage.tracks_in_directory(directory_ids[d])? {
                if !found.contains(stored.uid.as_str()) {
                    tracing::debug!(target: "processor", path = %stored.path, "Removing vanished track");
                    self.storage.remove_track(stored.id)?;
                    removed_tracks += 1;
                }
            }
        }

        let removed_directories = self.remove_vanished_directories(scan_type, directories)?;

        tracing::info!(
            target: "processor",
            committed,
            removed_tracks,
            removed_directories,
            errors = self.last_errors.len(),
            "Scan results committed"
        );
        Ok(())
    }

    fn commit_playlists(&mut self, directories: &[Arc<Directory>]) {
        let Some(importer) = self.playlists.as_ref() else {
            return;
        };
        let mut failures = Vec::new();
        for playlist in directories.iter().flat_map(|d| d.playlists.iter()) {
            if let Err(e) = importer.import_playlist(playlist) {
                failures.push(format!("Playlist {} not imported: {e}", playlist.display()));
            }
        }
        for message in failures {
            self.record(message);
        }
    }

    /// Album id for every track that belongs to an album.
    fn commit_albums(
        &mut self,
        scan_type: ScanType,
        directories: &[Arc<Directory>],
    ) -> Result<HashMap<TrackRef, Option<i64>>> {
        let albums = plan_albums(directories);
        let total = albums.len();
        let mut ids = HashMap::new();

        for (i, album) in albums.iter().enumerate() {
            let album_id = if album.is_no_album() {
                None
            } else {
                let id = self.storage.album_id(&album.name, &album.artist)?;
                if let Some(cover) = album.best_cover() {
                    self.storage
                        .set_album_cover(id, cover, scan_type == ScanType::FullScan)?;
                }
                Some(id)
            };
            for track in &album.tracks {
                ids.insert(*track, album_id);
            }
            self.report(ProcessorProgress::Albums { done: i + 1, total });
        }
        Ok(ids)
    }

    fn remove_vanished_directories(
        &mut self,
        scan_type: ScanType,
        directories: &[Arc<Directory>],
    ) -> Result<usize> {
        let reported: HashSet<&Path> = directories.iter().map(|d| d.path.as_path()).collect();
        let rescanned: HashSet<&Path> = directories
            .iter()
            .filter(|d| !d.skipped)
            .map(|d| d.path.as_path())
            .collect();

        let mut removed = 0;
        for stored in self.storage.stored_directories()? {
            let path = PathBuf::from(&stored.path);
            if reported.contains(path.as_path()) || !self.on_available_storage(&path) {
                continue;
            }
            if !scan_type.covers_whole_collection() {
                let parent_scanned = path.parent().is_some_and(|p| rescanned.contains(p));
                if !parent_scanned {
                    continue;
                }
            }
            tracing::debug!(target: "processor", path = %stored.path, "Removing vanished directory");
            self.storage.remove_directory(stored.id)?;
            removed += 1;
        }
        Ok(removed)
    }

    /// A directory under a missing collection folder (an unmounted drive)
    /// is kept. Directories outside every collection folder count as
    /// available.
    fn on_available_storage(&self, path: &Path) -> bool {
        let mut containing = self
            .collection_folders
            .iter()
            .filter(|folder| path.starts_with(folder))
            .peekable();
        if containing.peek().is_none() {
            return true;
        }
        containing.any(|folder| folder.exists())
    }
}

impl<S: CollectionStorage + 'static> ScanResultProcessor<S> {
    /// Register with `manager` so every run is committed automatically.
    pub fn subscribe_to(self, manager: &ScanManager) -> Arc<Mutex<Self>> {
        let processor = Arc::new(Mutex::new(self));
        let handle = Arc::clone(&processor);
        manager.subscribe(move |event| {
            // errors are already logged and kept in last_errors
            let _ = handle.lock().handle(event);
        });
        processor
    }
}

impl<S: CollectionStorage> std::fmt::Debug for ScanResultProcessor<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanResultProcessor")
            .field("phase", &self.phase)
            .field("expected", &self.expected)
            .field("buffered", &self.directories.len())
            .field("last_errors", &self.last_errors.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::model::Track;
    use crate::test_utils::{directory, temp_storage, thriller_directory, track};

    type Processor = ScanResultProcessor<db::SqliteStorage>;

    fn run(processor: &mut Processor, scan_type: ScanType, dirs: Vec<Directory>) {
        processor.handle(&ScanEvent::Started(scan_type)).unwrap();
        processor.handle(&ScanEvent::DirectoryCount(dirs.len())).unwrap();
        for dir in dirs {
            processor.handle(&ScanEvent::DirectoryScanned(Arc::new(dir))).unwrap();
        }
        processor.handle(&ScanEvent::Succeeded).unwrap();
    }

    #[test]
    fn test_single_track_round_trip() {
        let (rt, storage, _dir) = temp_storage();
        let mut processor = ScanResultProcessor::new(storage.clone());

        let mut song = track("uid-0001", "/music/Pop/single.mp3", "Michael Jackson", "Thriller");
        song.title = "Billie Jean".into();
        run(&mut processor, ScanType::FullScan, vec![directory("/music/Pop", vec![song])]);

        let stored = rt
            .block_on(db::get_track_by_uid(storage.pool(), "uid-0001"))
            .unwrap()
            .expect("track committed");
        assert_eq!(stored.title, "Billie Jean");
        assert_eq!(stored.path, "/music/Pop/single.mp3");
        assert_eq!(rt.block_on(db::count_tracks(storage.pool())).unwrap(), 1);
        assert!(processor.last_errors().is_empty());
    }

    #[test]
    fn test_thriller_is_one_album() {
        let (rt, storage, _dir) = temp_storage();
        let mut processor = ScanResultProcessor::new(storage.clone());
        run(&mut processor, ScanType::FullScan, vec![thriller_directory()]);

        let albums = rt.block_on(db::get_album_summaries(storage.pool())).unwrap();
        assert_eq!(albums.len(), 1);
        assert_eq!(albums[0].name, "Thriller");
        assert_eq!(albums[0].artist_name.as_deref(), Some("Michael Jackson"));
        assert_eq!(albums[0].track_count, 9);
    }

    #[test]
    fn test_disagreeing_artists_commit_compilation() {
        let (rt, storage, _dir) = temp_storage();
        let mut processor = ScanResultProcessor::new(storage.clone());
        run(
            &mut processor,
            ScanType::FullScan,
            vec![directory(
                "/music/Top Gun",
                vec![
                    track("tg-1", "/music/Top Gun/1.mp3", "Kenny Loggins", "Top Gun"),
                    track("tg-2", "/music/Top Gun/2.mp3", "Berlin", "Top Gun"),
                ],
            )],
        );

        let albums = rt.block_on(db::get_album_summaries(storage.pool())).unwrap();
        assert_eq!(albums.len(), 1);
        assert_eq!(albums[0].artist_name, None);
        assert_eq!(albums[0].track_count, 2);
    }

    #[test]
    fn test_best_of_albums_stay_separate() {
        let (rt, storage, _dir) = temp_storage();
        let mut processor = ScanResultProcessor::new(storage.clone());
        run(
            &mut processor,
            ScanType::FullScan,
            vec![
                directory("/music/Queen", vec![track("q", "/music/Queen/1.mp3", "Queen", "Best Of")]),
                directory("/music/ABBA", vec![track("a", "/music/ABBA/1.mp3", "ABBA", "Best Of")]),
            ],
        );

        let albums = rt.block_on(db::get_album_summaries(storage.pool())).unwrap();
        assert_eq!(albums.len(), 2);
        assert!(albums.iter().all(|a| a.name == "Best Of" && a.artist_name.is_some()));
    }

    #[test]
    fn test_partial_scan_removes_only_deleted_track() {
        let (rt, storage, _dir) = temp_storage();
        let mut processor = ScanResultProcessor::new(storage.clone());

        let thriller = thriller_directory();
        let bad = directory(
            "/music/Pop/Bad",
            vec![
                track("bad-1", "/music/Pop/Bad/01.mp3", "Michael Jackson", "Bad"),
                track("bad-2", "/music/Pop/Bad/02.mp3", "Michael Jackson", "Bad"),
            ],
        );
        run(&mut processor, ScanType::FullScan, vec![thriller.clone(), bad]);
        assert_eq!(rt.block_on(db::count_tracks(storage.pool())).unwrap(), 11);

        let mut rescanned = thriller;
        let removed = rescanned.tracks.remove(4);
        run(&mut processor, ScanType::PartialUpdateScan, vec![rescanned]);

        assert_eq!(rt.block_on(db::count_tracks(storage.pool())).unwrap(), 10);
        let gone = rt
            .block_on(db::get_track_by_uid(storage.pool(), &removed.unique_id))
            .unwrap();
        assert!(gone.is_none());
        assert!(rt.block_on(db::get_track_by_uid(storage.pool(), "bad-1")).unwrap().is_some());
        assert_eq!(rt.block_on(db::get_directories(storage.pool())).unwrap().len(), 2);
    }

    #[test]
    fn test_incremental_output_keeps_unreported_directories() {
        let (rt, storage, _dir) = temp_storage();
        let mut processor = ScanResultProcessor::new(storage.clone());
        let bad = || {
            directory(
                "/music/Pop/Bad",
                vec![track("bad-1", "/music/Pop/Bad/01.mp3", "Michael Jackson", "Bad")],
            )
        };
        run(&mut processor, ScanType::FullScan, vec![thriller_directory(), bad()]);

        processor.handle(&ScanEvent::Started(ScanType::UpdateScan)).unwrap();
        processor.handle(&ScanEvent::IncrementalOutput).unwrap();
        processor
            .handle(&ScanEvent::DirectoryScanned(Arc::new(thriller_directory())))
            .unwrap();
        processor.handle(&ScanEvent::Succeeded).unwrap();

        assert_eq!(rt.block_on(db::get_directories(storage.pool())).unwrap().len(), 2);
        assert!(rt.block_on(db::get_track_by_uid(storage.pool(), "bad-1")).unwrap().is_some());

        // without the flag an update scan covers the whole collection
        run(&mut processor, ScanType::UpdateScan, vec![thriller_directory()]);
        assert_eq!(rt.block_on(db::get_directories(storage.pool())).unwrap().len(), 1);
    }

    #[test]
    fn test_three_albums_across_two_directories() {
        let (rt, storage, _dir) = temp_storage();
        let mut processor = ScanResultProcessor::new(storage.clone());

        let mixed = directory(
            "/music/Mixed",
            vec![
                track("m-1", "/music/Mixed/1.mp3", "Queen", "Innuendo"),
                track("m-2", "/music/Mixed/2.mp3", "Queen", "Jazz"),
            ],
        );
        let untagged = directory(
            "/music/Unsorted Tapes",
            vec![
                track("u-1", "/music/Unsorted Tapes/1.mp3", "", ""),
                track("u-2", "/music/Unsorted Tapes/2.mp3", "", ""),
            ],
        );
        run(&mut processor, ScanType::FullScan, vec![mixed, untagged]);

        let albums = rt.block_on(db::get_album_summaries(storage.pool())).unwrap();
        let mut names: Vec<_> = albums.iter().map(|a| a.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["Innuendo", "Jazz", "Unsorted Tapes"]);

        for uid in ["m-1", "m-2", "u-1", "u-2"] {
            let stored = rt
                .block_on(db::get_track_by_uid(storage.pool(), uid))
                .unwrap()
                .expect("track committed");
            assert!(stored.album_name.is_some(), "{uid} has an album");
        }
    }

    #[test]
    fn test_update_scan_removes_vanished_directory() {
        let (rt, storage, _dir) = temp_storage();
        let mut processor = ScanResultProcessor::new(storage.clone());
        let bad = directory(
            "/music/Pop/Bad",
            vec![track("bad-1", "/music/Pop/Bad/01.mp3", "Michael Jackson", "Bad")],
        );
        run(&mut processor, ScanType::FullScan, vec![thriller_directory(), bad]);

        let mut unchanged = Directory::new("/music/Pop/Thriller");
        unchanged.skipped = true;
        run(&mut processor, ScanType::UpdateScan, vec![unchanged]);

        let dirs = rt.block_on(db::get_directories(storage.pool())).unwrap();
        assert_eq!(dirs.len(), 1);
        assert_eq!(dirs[0].path, "/music/Pop/Thriller");
        // skipped directories keep their tracks
        assert_eq!(rt.block_on(db::count_tracks(storage.pool())).unwrap(), 9);
    }

    #[test]
    fn test_missing_collection_folder_keeps_directories() {
        let (rt, storage, _dir) = temp_storage();
        let mut processor = ScanResultProcessor::new(storage.clone())
            .with_collection_folders(vec![PathBuf::from("/nonexistent-drive/music")]);
        let offline = directory(
            "/nonexistent-drive/music/Album",
            vec![track("o-1", "/nonexistent-drive/music/Album/1.mp3", "Queen", "Jazz")],
        );
        run(&mut processor, ScanType::FullScan, vec![offline]);
        run(&mut processor, ScanType::UpdateScan, vec![]);

        assert_eq!(rt.block_on(db::get_directories(storage.pool())).unwrap().len(), 1);
        assert_eq!(rt.block_on(db::count_tracks(storage.pool())).unwrap(), 1);
    }

    #[test]
    fn test_invalid_tracks_are_recorded() {
        let (rt, storage, _dir) = temp_storage();
        let mut processor = ScanResultProcessor::new(storage.clone());
        let mut no_id = Track::new("", "/music/Pop/no-id.mp3");
        no_id.album = "Singles".into();
        run(
            &mut processor,
            ScanType::FullScan,
            vec![directory(
                "/music/Pop",
                vec![
                    track("dup", "/music/Pop/a.mp3", "Queen", "Singles"),
                    track("dup", "/music/Pop/b.mp3", "Queen", "Singles"),
                    no_id,
                ],
            )],
        );

        assert_eq!(processor.last_errors().len(), 2);
        assert_eq!(rt.block_on(db::count_tracks(storage.pool())).unwrap(), 1);
    }

    #[test]
    fn test_failed_run_commits_nothing() {
        let (rt, storage, _dir) = temp_storage();
        let mut processor = ScanResultProcessor::new(storage.clone());

        processor.handle(&ScanEvent::Started(ScanType::FullScan)).unwrap();
        processor
            .handle(&ScanEvent::DirectoryScanned(Arc::new(thriller_directory())))
            .unwrap();
        processor.handle(&ScanEvent::Failed(ScanError::PrematureEnd)).unwrap();

        assert_eq!(processor.last_failure(), Some(&ScanError::PrematureEnd));
        assert!(!processor.is_collecting());
        assert_eq!(rt.block_on(db::count_tracks(storage.pool())).unwrap(), 0);
    }

    #[test]
    fn test_out_of_order_events_are_ignored() {
        let (rt, storage, _dir) = temp_storage();
        let mut processor = ScanResultProcessor::new(storage.clone());

        processor
            .handle(&ScanEvent::DirectoryScanned(Arc::new(thriller_directory())))
            .unwrap();
        processor.handle(&ScanEvent::Succeeded).unwrap();

        assert_eq!(rt.block_on(db::count_tracks(storage.pool())).unwrap(), 0);
        assert!(rt.block_on(db::get_directories(storage.pool())).unwrap().is_empty());
    }

    #[test]
    fn test_playlists_and_progress() {
        let (rt, storage, _dir) = temp_storage();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut processor = ScanResultProcessor::new(storage.clone())
            .with_playlist_importer(Box::new(storage.clone()))
            .with_progress(move |p| sink.lock().push(p));

        let mut dir = thriller_directory();
        dir.playlists.insert("/music/Pop/Thriller/party.m3u".into());
        run(&mut processor, ScanType::FullScan, vec![dir]);

        let playlists = rt.block_on(db::get_playlists(storage.pool())).unwrap();
        assert_eq!(playlists, vec!["/music/Pop/Thriller/party.m3u".to_string()]);

        let seen = seen.lock();
        assert_eq!(seen.first(), Some(&ProcessorProgress::Directories { done: 1, total: 1 }));
        assert!(seen.contains(&ProcessorProgress::Albums { done: 1, total: 1 }));
        assert_eq!(seen.last(), Some(&ProcessorProgress::Done));
    }

    #[test]
    fn test_full_scan_replaces_cover() {
        let (rt, storage, _dir) = temp_storage();
        let mut processor = ScanResultProcessor::new(storage.clone());

        let mut first = thriller_directory();
        first.covers.insert("/music/Pop/Thriller/folder.jpg".into());
        run(&mut processor, ScanType::UpdateScan, vec![first.clone()]);

        let mut second = first.clone();
        second.covers.insert("/music/Pop/Thriller/front.jpg".into());
        run(&mut processor, ScanType::UpdateScan, vec![second.clone()]);
        let albums = rt.block_on(db::get_album_summaries(storage.pool())).unwrap();
        assert_eq!(albums[0].cover.as_deref(), Some("/music/Pop/Thriller/folder.jpg"));

        run(&mut processor, ScanType::FullScan, vec![second]);
        let albums = rt.block_on(db::get_album_summaries(storage.pool())).unwrap();
        assert_eq!(albums[0].cover.as_deref(), Some("/music/Pop/Thriller/front.jpg"));
    }
}
