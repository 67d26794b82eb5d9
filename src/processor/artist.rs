//! Album-artist heuristics.

use crate::model::Track;

/// Album names that are never folded into a compilation.
const NON_COMPILATION_NAMES: &[&str] = &[
    "",
    "best of",
    "anthology",
    "hit collection",
    "greatest hits",
    "all time greatest hits",
    "live",
];

const FEATURING_SEPARATORS: &[&str] = &["featuring", "feat.", "ft.", "f."];

const VARIOUS_ARTISTS: &str = "various artists";

/// Whether `name` is a generic album title shared by unrelated artists.
pub fn is_non_compilation_name(name: &str) -> bool {
    let name = name.trim().to_lowercase();
    NON_COMPILATION_NAMES.contains(&name.as_str())
}

/// Best guess for the album artist of a track.
///
/// Prefers the tagged album artist, then the composer for classical music,
/// then the track artist with any "featuring" guests removed. "Various
/// Artists" counts as no artist.
pub fn guess_album_artist(album_artist: &str, artist: &str, genre: &str, composer: &str) -> String {
    let mut best = album_artist.trim().to_string();
    if best.is_empty() && genre.trim().eq_ignore_ascii_case("classical") {
        best = real_track_artist(composer);
    }
    if best.is_empty() {
        best = real_track_artist(artist);
    }
    if best.eq_ignore_ascii_case(VARIOUS_ARTISTS) {
        best.clear();
    }
    best
}

/// [`guess_album_artist`] applied to a track's tags.
pub fn guess_for_track(track: &Track) -> String {
    guess_album_artist(&track.album_artist, &track.artist, &track.genre, &track.composer)
}

/// The main artist of an "A featuring B" style artist tag.
pub fn real_track_artist(artist: &str) -> String {
    let artist = artist.trim();
    // ASCII lowering keeps byte offsets valid for `artist`
    let lowered = artist.to_ascii_lowercase();
    for separator in FEATURING_SEPARATORS {
        // only at a word start: "Prof. Green" is not "Pro featuring Green"
        let Some((index, _)) = lowered.match_indices(separator).find(|(i, _)| {
            artist[..*i]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_whitespace() || c == '(' || c == '[')
        }) else {
            continue;
        };
        let mut main = artist[..index].trim();
        // "A (feat. B)" and "A [feat. B]"
        main = main.trim_end_matches(['(', '[']).trim_end();
        return if main.is_empty() {
            artist.to_string()
        } else {
            main.to_string()
        };
    }
    artist.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_compilation_names() {
        assert!(is_non_compilation_name(""));
        assert!(is_non_compilation_name("Best Of"));
        assert!(is_non_compilation_name("GREATEST HITS"));
        assert!(is_non_compilation_name(" Live "));
        assert!(!is_non_compilation_name("Thriller"));
        assert!(!is_non_compilation_name("Live at Wembley"));
    }

    #[test]
    fn test_featuring_is_removed() {
        assert_eq!(real_track_artist("Michael Jackson featuring Paul McCartney"), "Michael Jackson");
        assert_eq!(real_track_artist("Michael Jackson (feat. Paul McCartney)"), "Michael Jackson");
        assert_eq!(real_track_artist("Santana [ft. Rob Thomas]"), "Santana");
        assert_eq!(real_track_artist("Soundtrack & Theme Orchestra"), "Soundtrack & Theme Orchestra");
        assert_eq!(real_track_artist("Prof. Green"), "Prof. Green");
    }

    #[test]
    fn test_featuring_ignores_case() {
        assert_eq!(real_track_artist("Santana Feat. Rob Thomas"), "Santana");
        assert_eq!(real_track_artist("Eminem Featuring Rihanna"), "Eminem");
        assert_eq!(real_track_artist("Daft Punk (FT. Pharrell Williams)"), "Daft Punk");
        assert_eq!(real_track_artist("Björk Feat. Thom Yorke"), "Björk");
        assert_eq!(
            guess_album_artist("", "Michael Jackson Featuring Paul McCartney", "Pop", ""),
            "Michael Jackson"
        );
    }

    #[test]
    fn test_album_artist_preferred() {
        assert_eq!(
            guess_album_artist("Theme Orchestra", "Soundtrack & Theme Orchestra", "Soundtrack", ""),
            "Theme Orchestra"
        );
    }

    #[test]
    fn test_classical_uses_composer() {
        assert_eq!(
            guess_album_artist("", "Berliner Philharmoniker", "Classical", "Ludwig van Beethoven"),
            "Ludwig van Beethoven"
        );
        assert_eq!(
            guess_album_artist("", "Berliner Philharmoniker", "Classical", ""),
            "Berliner Philharmoniker"
        );
        assert_eq!(
            guess_album_artist("", "Berliner Philharmoniker", "Pop", "Ludwig van Beethoven"),
            "Berliner Philharmoniker"
        );
    }

    #[test]
    fn test_various_artists_is_no_artist() {
        assert_eq!(guess_album_artist("Various Artists", "Queen", "", ""), "");
        assert_eq!(guess_album_artist("", "", "", ""), "");
    }
}
