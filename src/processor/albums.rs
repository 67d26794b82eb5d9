//! Grouping of scanned tracks into album aggregates.
//!
//! 1. Every track gets an album key `(name, artist)`; an empty artist is the
//!    compilation bucket.
//! 2. A directory whose tracks all share one album name lends its cover
//!    candidates to the aggregates holding those tracks.
//! 3. Per album name, a lone compilation bucket whose tracks all agree on
//!    one guessed artist becomes a normal album.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use super::artist::{guess_for_track, is_non_compilation_name};
use crate::model::{Album, Directory, Track, TrackRef};

/// Build the album aggregates for one scan run.
///
/// Skipped directories contribute nothing. The result keeps first-seen order.
pub fn plan_albums(directories: &[Arc<Directory>]) -> Vec<Album> {
    let mut albums: Vec<Album> = Vec::new();
    let mut index: HashMap<(String, String), usize> = HashMap::new();

    for (d, dir) in directories.iter().enumerate() {
        if dir.skipped {
            continue;
        }

        let fallback = if dir.album_names().is_empty() {
            dir.base_name()
        } else {
            String::new()
        };

        let mut names = BTreeSet::new();
        let mut touched = BTreeSet::new();
        for (t, track) in dir.tracks.iter().enumerate() {
            let key = album_key(track, &fallback);
            names.insert(key.0.clone());

            let i = *index.entry(key.clone()).or_insert_with(|| {
                albums.push(Album::new(key.0, key.1));
                albums.len() - 1
            });
            let album = &mut albums[i];
            album.tracks.push(TrackRef {
                directory: d,
                track: t,
            });
            album.no_compilation |= track.no_compilation;
            touched.insert(i);
        }

        if names.len() == 1 && !dir.covers.is_empty() {
            for i in touched {
                albums[i].add_covers(&dir.covers);
            }
        }
    }

    resolve_compilations(albums, directories)
}

/// `(name, artist)` for a track.
fn album_key(track: &Track, fallback: &str) -> (String, String) {
    let artist = if track.compilation {
        String::new()
    } else if !track.album_artist.trim().is_empty() {
        track.album_artist.trim().to_string()
    } else if track.no_compilation
        || (!track.album.is_empty() && is_non_compilation_name(&track.album))
    {
        guess_for_track(track)
    } else {
        String::new()
    };

    let name = if !track.album.is_empty() {
        track.album.clone()
    } else if artist.is_empty() {
        fallback.to_string()
    } else {
        String::new()
    };

    (name, artist)
}

fn resolve_compilations(albums: Vec<Album>, directories: &[Arc<Directory>]) -> Vec<Album> {
    let mut by_name: Vec<(String, Vec<Album>)> = Vec::new();
    for album in albums {
        match by_name.iter_mut().find(|(name, _)| *name == album.name) {
            Some((_, group)) => group.push(album),
            None => by_name.push((album.name.clone(), vec![album])),
        }
    }

    let mut resolved = Vec::new();
    for (name, group) in by_name {
        let (standalone, mut rest): (Vec<Album>, Vec<Album>) = group
            .into_iter()
            .partition(|album| album.no_compilation || is_non_compilation_name(&name));
        resolved.extend(standalone);

        if rest.len() == 1 {
            let mut album = rest.remove(0);
            if album.is_compilation() && !has_flagged_compilation(&album, directories) {
                if let Some(artist) = agreed_artist(&album, directories) {
                    tracing::debug!(target: "processor", album = %album.name, %artist, "Compilation candidate resolved to a single artist");
                    album.artist = artist;
                }
            }
            resolved.push(album);
        } else {
            resolved.extend(rest);
        }
    }
    resolved
}

fn member_tracks<'a>(
    album: &'a Album,
    directories: &'a [Arc<Directory>],
) -> impl Iterator<Item = &'a Track> + 'a {
    album
        .tracks
        .iter()
        .filter_map(|r| directories.get(r.directory)?.tracks.get(r.track))
}

fn has_flagged_compilation(album: &Album, directories: &[Arc<Directory>]) -> bool {
    member_tracks(album, directories).any(|t| t.compilation)
}

/// The guessed artist every member shares, if any.
fn agreed_artist(album: &Album, directories: &[Arc<Directory>]) -> Option<String> {
    let mut agreed: Option<String> = None;
    for track in member_tracks(album, directories) {
        let guess = guess_for_track(track);
        if guess.is_empty() {
            return None;
        }
        match &agreed {
            Some(existing) if *existing != guess => return None,
            Some(_) => {}
            None => agreed = Some(guess),
        }
    }
    agreed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{directory, track};

    fn plan(dirs: Vec<Directory>) -> Vec<Album> {
        let dirs: Vec<Arc<Directory>> = dirs.into_iter().map(Arc::new).collect();
        plan_albums(&dirs)
    }

    #[test]
    fn test_same_artist_is_normal_album() {
        let albums = plan(vec![directory(
            "/music/Pop/Thriller",
            (1..=9)
                .map(|n| track(&format!("mj-{n}"), &format!("/music/Pop/Thriller/{n}.mp3"), "Michael Jackson", "Thriller"))
                .collect(),
        )]);

        assert_eq!(albums.len(), 1);
        assert_eq!(albums[0].name, "Thriller");
        assert_eq!(albums[0].artist, "Michael Jackson");
        assert_eq!(albums[0].tracks.len(), 9);
    }

    #[test]
    fn test_disagreeing_artists_form_compilation() {
        let albums = plan(vec![directory(
            "/music/Top Gun",
            vec![
                track("a", "/music/Top Gun/1.mp3", "Kenny Loggins", "Top Gun"),
                track("b", "/music/Top Gun/2.mp3", "Berlin", "Top Gun"),
                track("c", "/music/Top Gun/3.mp3", "Cheap Trick", "Top Gun"),
            ],
        )]);

        assert_eq!(albums.len(), 1);
        assert!(albums[0].is_compilation());
        assert_eq!(albums[0].tracks.len(), 3);
    }

    #[test]
    fn test_flagged_compilation_stays_compilation() {
        let mut first = track("a", "/music/Hits/1.mp3", "Queen", "Hits 2024");
        first.compilation = true;
        let mut second = track("b", "/music/Hits/2.mp3", "Queen", "Hits 2024");
        second.compilation = true;

        let albums = plan(vec![directory("/music/Hits", vec![first, second])]);
        assert_eq!(albums.len(), 1);
        assert!(albums[0].is_compilation());
    }

    #[test]
    fn test_best_of_never_folded() {
        let albums = plan(vec![
            directory("/music/Queen/Best Of", vec![track("q1", "/music/Queen/Best Of/1.mp3", "Queen", "Best Of")]),
            directory("/music/ABBA/Best Of", vec![track("a1", "/music/ABBA/Best Of/1.mp3", "ABBA", "Best Of")]),
        ]);

        assert_eq!(albums.len(), 2);
        let mut artists: Vec<_> = albums.iter().map(|a| a.artist.as_str()).collect();
        artists.sort();
        assert_eq!(artists, vec!["ABBA", "Queen"]);
    }

    #[test]
    fn test_no_compilation_flag_keeps_album_standalone() {
        let mut solo = track("s", "/music/Duets/1.mp3", "Elton John", "Duets");
        solo.no_compilation = true;
        let albums = plan(vec![directory(
            "/music/Duets",
            vec![solo, track("o", "/music/Duets/2.mp3", "Kiki Dee", "Duets")],
        )]);

        assert_eq!(albums.len(), 2);
        assert!(albums.iter().any(|a| a.artist == "Elton John" && a.no_compilation));
        // the remaining bucket agrees on its single artist
        assert!(albums.iter().any(|a| a.artist == "Kiki Dee"));
    }

    #[test]
    fn test_untagged_directory_uses_directory_name() {
        let albums = plan(vec![directory(
            "/music/Bootlegs/Basement Tapes",
            vec![
                track("x", "/music/Bootlegs/Basement Tapes/1.mp3", "", ""),
                track("y", "/music/Bootlegs/Basement Tapes/2.mp3", "", ""),
            ],
        )]);

        assert_eq!(albums.len(), 1);
        assert_eq!(albums[0].name, "Basement Tapes");
    }

    #[test]
    fn test_covers_only_for_single_album_directories() {
        let mut single = directory(
            "/music/Pop/Thriller",
            vec![track("a", "/music/Pop/Thriller/1.mp3", "Michael Jackson", "Thriller")],
        );
        single.covers.insert("/music/Pop/Thriller/front.jpg".into());

        let mut mixed = directory(
            "/music/Mixed",
            vec![
                track("b", "/music/Mixed/1.mp3", "Queen", "Innuendo"),
                track("c", "/music/Mixed/2.mp3", "Queen", "Jazz"),
            ],
        );
        mixed.covers.insert("/music/Mixed/cover.jpg".into());

        let albums = plan(vec![single, mixed]);
        let thriller = albums.iter().find(|a| a.name == "Thriller").unwrap();
        assert_eq!(thriller.covers.len(), 1);
        assert!(albums.iter().filter(|a| a.name != "Thriller").all(|a| a.covers.is_empty()));
    }

    #[test]
    fn test_skipped_directories_contribute_nothing() {
        let mut dir = directory(
            "/music/Pop/Thriller",
            vec![track("a", "/music/Pop/Thriller/1.mp3", "Michael Jackson", "Thriller")],
        );
        dir.skipped = true;
        assert!(plan(vec![dir]).is_empty());
    }
}
