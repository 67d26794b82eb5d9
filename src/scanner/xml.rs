//! Incremental reader for the scanner's XML output.
//!
//! The scanner streams one `<scanner count="N">` document with a
//! `<directory>` element per scanned directory. Output arrives in arbitrary
//! chunks, so bytes are buffered until a complete `</directory>` or
//! `</scanner>` close tag has been seen and only that prefix is parsed.
//!
//! ```text
//! <scanner count="2">
//!   <directory>
//!     <path>/music/Pop/Thriller</path><rpath>./Pop/Thriller</rpath><mtime>1234</mtime>
//!     <track><uniqueid>1dc7...</uniqueid><path>/music/Pop/Thriller/01.mp3</path>...</track>
//!     <cover>/music/Pop/Thriller/front.jpg</cover>
//!   </directory>
//!   ...
//! </scanner>
//! ```

use std::path::PathBuf;
use std::str::FromStr;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use crate::error::ScanError;
use crate::model::{AlbumGrouping, Directory, Track, normalize_unique_id};

const SCANNER_CLOSE: &[u8] = b"</scanner>";
const DIRECTORY_CLOSE: &[u8] = b"</directory>";

/// Something complete found in the scanner output.
#[derive(Debug, Clone, PartialEq)]
pub enum ScannerEvent {
    /// Value of the root `count` attribute
    DirectoryCount(usize),
    /// The root carries `incremental`: only changed directories are reported
    Incremental,
    Directory(Directory),
    /// The closing `</scanner>` tag
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DocumentState {
    Prolog,
    InScanner,
    /// A restarted scanner continues the document, with or without a new root
    Resuming,
    Finished,
}

/// Events completed by one chunk, and the error that stopped parsing it.
#[derive(Debug, Default)]
pub struct ParsedChunk {
    pub events: Vec<ScannerEvent>,
    pub error: Option<ScanError>,
}

/// Streaming parser fed with raw output chunks.
#[derive(Debug)]
pub struct ScannerXmlReader {
    /// Bytes after the last complete close tag
    pending: Vec<u8>,
    /// Released bytes not yet turned into events
    document: Vec<u8>,
    state: DocumentState,
    root_reported: bool,
    error: Option<ScanError>,
}

impl Default for ScannerXmlReader {
    fn default() -> Self {
        Self::new()
    }
}

impl ScannerXmlReader {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            document: Vec::new(),
            state: DocumentState::Prolog,
            root_reported: false,
            error: None,
        }
    }

    /// Feed the next chunk of output and return everything it completed.
    ///
    /// Input after `</scanner>` is ignored. Events completed before a parse
    /// error are dropped; use [`feed`](Self::feed) to keep them.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<ScannerEvent>, ScanError> {
        let parsed = self.feed(data);
        match parsed.error {
            Some(error) => Err(error),
            None => Ok(parsed.events),
        }
    }

    /// Like [`push`](Self::push), but returns the events completed ahead of
    /// a parse error together with the error. A parse error is final.
    pub fn feed(&mut self, data: &[u8]) -> ParsedChunk {
        let mut parsed = ParsedChunk::default();
        if let Some(error) = &self.error {
            parsed.error = Some(error.clone());
            return parsed;
        }
        if self.state == DocumentState::Finished {
            return parsed;
        }

        let search_from = self.pending.len().saturating_sub(DIRECTORY_CLOSE.len() - 1);
        self.pending.extend_from_slice(data);
        if let Some(end) = release_point(&self.pending, search_from) {
            let rest = self.pending.split_off(end);
            let complete = std::mem::replace(&mut self.pending, rest);
            self.document.extend_from_slice(&complete);
        }

        if let Err(error) = self.drain_document(&mut parsed.events) {
            self.error = Some(error.clone());
            self.pending.clear();
            self.document.clear();
            parsed.error = Some(error);
        }
        parsed
    }

    /// Forget partial output of a dead process.
    ///
    /// The restarted scanner may continue with more `<directory>` elements
    /// or open a new `<scanner>` root. The root attributes are reported once
    /// per reader, not per process.
    pub fn restart(&mut self) {
        self.pending.clear();
        self.document.clear();
        if self.state != DocumentState::Finished {
            self.state = DocumentState::Resuming;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state == DocumentState::Finished
    }

    /// Check that the document was closed once the input has ended.
    pub fn finish(&self) -> Result<(), ScanError> {
        if let Some(error) = &self.error {
            return Err(error.clone());
        }
        if self.is_finished() {
            Ok(())
        } else {
            Err(ScanError::PrematureEnd)
        }
    }

    fn drain_document(&mut self, events: &mut Vec<ScannerEvent>) -> Result<(), ScanError> {
        while self.state != DocumentState::Finished {
            match self.next_unit(events)? {
                Some(consumed) => {
                    self.document.drain(..consumed);
                }
                None => break,
            }
        }
        if self.state == DocumentState::Finished {
            self.document.clear();
            self.pending.clear();
        }
        Ok(())
    }

    /// Parse the next top-level unit from the released bytes.
    ///
    /// Returns the number of bytes it spans, or `None` when the unit is not
    /// complete yet. Each unit gets a fresh reader, so the root close tag is
    /// unmatched there and checked by name here.
    fn next_unit(&mut self, events: &mut Vec<ScannerEvent>) -> Result<Option<usize>, ScanError> {
        let mut reader = new_reader(&self.document);
        loop {
            let event = reader.read_event().map_err(xml_error)?;
            match (self.state, event) {
                (DocumentState::Finished, _) | (_, Event::Eof) => return Ok(None),
                (_, Event::Text(t)) if t.iter().all(u8::is_ascii_whitespace) => continue,
                (_, Event::Decl(_) | Event::Comment(_) | Event::PI(_) | Event::DocType(_)) => {
                    continue;
                }
                (DocumentState::Prolog | DocumentState::Resuming, Event::Start(e))
                    if is_root(&e) =>
                {
                    self.state = DocumentState::InScanner;
                    root_events(&e, &mut self.root_reported, events)?;
                }
                (DocumentState::Prolog | DocumentState::Resuming, Event::Empty(e))
                    if is_root(&e) =>
                {
                    root_events(&e, &mut self.root_reported, events)?;
                    self.state = DocumentState::Finished;
                    events.push(ScannerEvent::Finished);
                }
                (DocumentState::Prolog, Event::Start(e) | Event::Empty(e)) => {
                    return Err(ScanError::Xml(format!(
                        "unexpected root element <{}>",
                        element_name(&e)
                    )));
                }
                (DocumentState::Prolog, other) => {
                    return Err(ScanError::Xml(format!(
                        "unexpected content before <scanner>: {other:?}"
                    )));
                }
                (_, Event::Start(e)) => {
                    self.state = DocumentState::InScanner;
                    if e.name().as_ref() == b"directory" {
                        match parse_directory(&mut reader)? {
                            Some(dir) => events.push(ScannerEvent::Directory(dir)),
                            None => return Ok(None),
                        }
                    } else {
                        tracing::warn!(
                            target: "scanner::xml",
                            element = %element_name(&e),
                            "Skipping unknown element in scanner output"
                        );
                        if skip_element(&mut reader)?.is_none() {
                            return Ok(None);
                        }
                    }
                }
                (_, Event::End(e)) => {
                    if e.name().as_ref() != b"scanner" {
                        return Err(ScanError::Xml(format!(
                            "unexpected close tag </{}> in <scanner>",
                            String::from_utf8_lossy(e.name().as_ref())
                        )));
                    }
                    self.state = DocumentState::Finished;
                    events.push(ScannerEvent::Finished);
                }
                // stray text and empty elements between directories
                (_, _) => continue,
            }
            return Ok(Some(reader.buffer_position() as usize));
        }
    }
}

fn release_point(buf: &[u8], search_from: usize) -> Option<usize> {
    let window = &buf[search_from..];
    rfind(window, SCANNER_CLOSE)
        .map(|i| search_from + i + SCANNER_CLOSE.len())
        .or_else(|| rfind(window, DIRECTORY_CLOSE).map(|i| search_from + i + DIRECTORY_CLOSE.len()))
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).rposition(|w| w == needle)
}

fn new_reader(data: &[u8]) -> Reader<&[u8]> {
    let mut reader = Reader::from_reader(data);
    let config = reader.config_mut();
    config.check_end_names = true;
    // the <scanner> start tag belongs to an earlier unit
    config.allow_unmatched_ends = true;
    reader
}

fn xml_error(e: impl std::fmt::Display) -> ScanError {
    ScanError::Xml(e.to_string())
}

fn element_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.name().as_ref()).into_owned()
}

fn is_root(e: &BytesStart<'_>) -> bool {
    e.name().as_ref() == b"scanner"
}

/// `count` and `incremental` of the root, reported for the first root only.
fn root_events(
    e: &BytesStart<'_>,
    reported: &mut bool,
    events: &mut Vec<ScannerEvent>,
) -> Result<(), ScanError> {
    if std::mem::replace(reported, true) {
        return Ok(());
    }
    if let Some(attr) = e.try_get_attribute("count").map_err(xml_error)? {
        let value = attr.unescape_value().map_err(xml_error)?;
        if let Some(count) = parse_number(&value) {
            events.push(ScannerEvent::DirectoryCount(count));
        }
    }
    if e.try_get_attribute("incremental").map_err(xml_error)?.is_some() {
        events.push(ScannerEvent::Incremental);
    }
    Ok(())
}

fn parse_number<T: FromStr>(text: &str) -> Option<T> {
    text.trim().parse().ok()
}

// ============================================================================
// Element parsers
//
// Each parser is called right after the start tag of its element was read
// and returns `Ok(None)` when the input ends before the matching end tag.
// ============================================================================

macro_rules! need {
    ($e:expr) => {
        match $e? {
            Some(value) => value,
            None => return Ok(None),
        }
    };
}

/// Text content of the current element. Nested elements are skipped.
fn read_text(reader: &mut Reader<&[u8]>) -> Result<Option<String>, ScanError> {
    let mut text = String::new();
    let mut depth = 0usize;
    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Text(e) if depth == 0 => text.push_str(&e.unescape().map_err(xml_error)?),
            Event::CData(e) if depth == 0 => {
                text.push_str(&String::from_utf8_lossy(&e.into_inner()));
            }
            Event::Start(_) => depth += 1,
            Event::End(_) => {
                if depth == 0 {
                    return Ok(Some(text));
                }
                depth -= 1;
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

fn skip_element(reader: &mut Reader<&[u8]>) -> Result<Option<()>, ScanError> {
    let mut depth = 0usize;
    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(_) => depth += 1,
            Event::End(_) => {
                if depth == 0 {
                    return Ok(Some(()));
                }
                depth -= 1;
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

fn parse_directory(reader: &mut Reader<&[u8]>) -> Result<Option<Directory>, ScanError> {
    let mut dir = Directory::default();
    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(e) => match e.name().as_ref() {
                b"path" => dir.path = PathBuf::from(need!(read_text(reader))),
                b"rpath" => dir.rpath = need!(read_text(reader)),
                b"mtime" => dir.mtime = parse_number(&need!(read_text(reader))).unwrap_or(0),
                b"skipped" => {
                    need!(skip_element(reader));
                    dir.skipped = true;
                }
                b"track" => {
                    let track = need!(parse_track(reader));
                    dir.tracks.push(track);
                }
                b"album" => {
                    let (name, tracks) = need!(parse_album_grouping(reader));
                    let start = dir.tracks.len();
                    for mut track in tracks {
                        if track.album.is_empty() {
                            track.album = name.clone();
                        }
                        dir.tracks.push(track);
                    }
                    dir.album_groupings.push(AlbumGrouping {
                        name,
                        tracks: (start..dir.tracks.len()).collect(),
                    });
                }
                b"cover" | b"image" => {
                    let cover = need!(read_text(reader));
                    if !cover.trim().is_empty() {
                        dir.covers.insert(PathBuf::from(cover));
                    }
                }
                b"playlist" => {
                    if let Some(playlist) = need!(parse_playlist(reader)) {
                        dir.playlists.insert(playlist);
                    }
                }
                other => {
                    tracing::warn!(
                        target: "scanner::xml",
                        element = %String::from_utf8_lossy(other),
                        "Skipping unknown directory element"
                    );
                    need!(skip_element(reader));
                }
            },
            Event::Empty(e) => {
                if e.name().as_ref() == b"skipped" {
                    dir.skipped = true;
                }
            }
            Event::End(_) => return Ok(Some(dir)),
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

fn parse_album_grouping(
    reader: &mut Reader<&[u8]>,
) -> Result<Option<(String, Vec<Track>)>, ScanError> {
    let mut name = String::new();
    let mut tracks = Vec::new();
    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(e) => match e.name().as_ref() {
                b"name" => name = need!(read_text(reader)),
                b"track" => tracks.push(need!(parse_track(reader))),
                _ => need!(skip_element(reader)),
            },
            Event::End(_) => return Ok(Some((name, tracks))),
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

/// `<playlist><path>...</path></playlist>`, or the path as direct text.
fn parse_playlist(reader: &mut Reader<&[u8]>) -> Result<Option<Option<PathBuf>>, ScanError> {
    let mut path = None;
    let mut direct = String::new();
    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(e) => {
                if e.name().as_ref() == b"path" {
                    path = Some(need!(read_text(reader)));
                } else {
                    need!(skip_element(reader));
                }
            }
            Event::Text(e) => direct.push_str(&e.unescape().map_err(xml_error)?),
            Event::End(_) => {
                let path = path.unwrap_or_else(|| direct.trim().to_string());
                return Ok(Some((!path.is_empty()).then(|| PathBuf::from(path))));
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

fn parse_track(reader: &mut Reader<&[u8]>) -> Result<Option<Track>, ScanError> {
    let mut track = Track::default();
    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(e) => {
                let name = e.name();
                if let Some(flag) = track_flag(&mut track, name.as_ref()) {
                    *flag = true;
                    need!(skip_element(reader));
                } else {
                    let text = need!(read_text(reader));
                    apply_track_field(&mut track, name.as_ref(), text);
                }
            }
            Event::Empty(e) => {
                if let Some(flag) = track_flag(&mut track, e.name().as_ref()) {
                    *flag = true;
                }
            }
            Event::End(_) => return Ok(Some(track)),
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

/// Presence-only elements.
fn track_flag<'t>(track: &'t mut Track, name: &[u8]) -> Option<&'t mut bool> {
    match name {
        b"compilation" => Some(&mut track.compilation),
        b"noCompilation" => Some(&mut track.no_compilation),
        b"hasCover" => Some(&mut track.has_cover),
        _ => None,
    }
}

fn apply_track_field(track: &mut Track, name: &[u8], text: String) {
    match name {
        b"uniqueid" => track.unique_id = normalize_unique_id(&text),
        b"path" => track.path = PathBuf::from(text),
        b"rpath" => track.rpath = text,
        b"filetype" => track.filetype = parse_number(&text),
        b"title" => track.title = text,
        b"artist" => track.artist = text,
        b"albumArtist" => track.album_artist = text,
        b"album" => track.album = text,
        b"comment" => track.comment = text,
        b"genre" => track.genre = text,
        b"composer" => track.composer = text,
        b"year" => track.year = parse_number(&text),
        b"disc" => track.disc_number = parse_number(&text),
        // nested <track> is the track number
        b"track" => track.track_number = parse_number(&text),
        b"bpm" => track.bpm = parse_number(&text),
        b"bitrate" => track.bitrate = parse_number(&text),
        b"length" => track.length = parse_number(&text),
        b"samplerate" => track.samplerate = parse_number(&text),
        b"filesize" => track.filesize = parse_number(&text),
        b"mtime" => track.modified = parse_number(&text),
        b"trackGain" => track.replay_gain.track_gain = parse_number(&text),
        b"trackPeakGain" => track.replay_gain.track_peak = parse_number(&text),
        b"albumGain" => track.replay_gain.album_gain = parse_number(&text),
        b"albumPeakGain" => track.replay_gain.album_peak = parse_number(&text),
        b"rating" => track.rating = parse_number(&text),
        b"score" => track.score = parse_number(&text),
        b"playcount" => track.playcount = parse_number(&text),
        other => {
            tracing::debug!(
                target: "scanner::xml",
                field = %String::from_utf8_lossy(other),
                "Ignoring unknown track field"
            );
        }
    }
}
