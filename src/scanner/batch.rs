//! Batch file handed to the scanner with `--batch`.
//!
//! Lists the directories to scan and the mtimes the collection already
//! knows, so an incremental scan can report unchanged directories as
//! `<skipped/>` without reading them.

use std::io::Write;
use std::path::{Path, PathBuf};

use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;
use tempfile::TempPath;

use crate::error::ScanError;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchFile {
    pub directories: Vec<PathBuf>,
    /// Last known mtime per directory
    pub time_definitions: Vec<(PathBuf, i64)>,
}

impl BatchFile {
    pub fn new(directories: Vec<PathBuf>) -> Self {
        Self {
            directories,
            time_definitions: Vec::new(),
        }
    }

    pub fn with_time_definitions(mut self, times: Vec<(PathBuf, i64)>) -> Self {
        self.time_definitions = times;
        self
    }

    pub fn to_xml(&self) -> String {
        let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<batch>\n");
        xml.push_str(" <directories>\n");
        for dir in &self.directories {
            let path = dir.to_string_lossy();
            xml.push_str(&format!("  <directory>{}</directory>\n", escape(&*path)));
        }
        xml.push_str(" </directories>\n");
        if !self.time_definitions.is_empty() {
            xml.push_str(" <timeDefinitions>\n");
            for (folder, mtime) in &self.time_definitions {
                let folder = folder.to_string_lossy();
                xml.push_str(&format!(
                    "  <timeDefinition><folder>{}</folder><mtime>{}</mtime></timeDefinition>\n",
                    escape(&*folder),
                    mtime
                ));
            }
            xml.push_str(" </timeDefinitions>\n");
        }
        xml.push_str("</batch>\n");
        xml
    }

    /// Write to a new temporary file in `dir`; the file is removed when the
    /// returned path is dropped.
    pub fn write_temp(&self, dir: &Path) -> Result<TempPath, ScanError> {
        let mut file = tempfile::Builder::new()
            .prefix("collection-scanner-batch-")
            .suffix(".xml")
            .tempfile_in(dir)
            .map_err(|e| ScanError::batch_file(dir, e))?;
        file.write_all(self.to_xml().as_bytes())
            .and_then(|()| file.flush())
            .map_err(|e| ScanError::batch_file(file.path(), e))?;
        tracing::debug!(
            target: "scanner::job",
            path = %file.path().display(),
            directories = self.directories.len(),
            known = self.time_definitions.len(),
            "Wrote batch file"
        );
        Ok(file.into_temp_path())
    }

    pub fn read(path: &Path) -> Result<Self, ScanError> {
        let bytes = std::fs::read(path).map_err(|e| ScanError::batch_file(path, e))?;
        Self::parse(&bytes).map_err(|reason| ScanError::batch_file(path, reason))
    }

    fn parse(bytes: &[u8]) -> Result<Self, String> {
        let mut reader = Reader::from_reader(bytes);
        reader.config_mut().trim_text(true);

        let mut batch = Self::default();
        let mut stack: Vec<Vec<u8>> = Vec::new();
        let mut folder = None;
        loop {
            match reader.read_event().map_err(|e| e.to_string())? {
                Event::Start(e) => stack.push(e.name().as_ref().to_vec()),
                Event::End(_) => {
                    stack.pop();
                }
                Event::Text(e) => {
                    let text = e.unescape().map_err(|e| e.to_string())?;
                    match stack.last().map(Vec::as_slice) {
                        Some(b"directory") => batch.directories.push(PathBuf::from(&*text)),
                        Some(b"folder") => folder = Some(PathBuf::from(&*text)),
                        Some(b"mtime") => {
                            let mtime = text.trim().parse().map_err(|_| format!("bad mtime {text}"))?;
                            if let Some(folder) = folder.take() {
                                batch.time_definitions.push((folder, mtime));
                            }
                        }
                        _ => {}
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }
        Ok(batch)
    }
}
