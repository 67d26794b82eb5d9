//! Crash-diagnostics region shared with the scanner.
//!
//! A fixed-size file whose path is passed as `--sharedmemory`. The scanner
//! rewrites it before every directory and file it reads: UTF-8 text, first
//! line the current directory, second line the current file, NUL padded.
//! After an abnormal exit the parent reads it to learn which file killed
//! the scanner.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

pub const STATE_REGION_SIZE: usize = 4096;

/// What the scanner was working on when last heard from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScannerProgress {
    pub last_directory: Option<PathBuf>,
    pub last_file: Option<PathBuf>,
}

impl ScannerProgress {
    pub fn parse(bytes: &[u8]) -> Self {
        let bytes = &bytes[..bytes.len().min(STATE_REGION_SIZE)];
        let text = String::from_utf8_lossy(bytes);
        let text = text.trim_end_matches('\0');
        let mut lines = text.lines().map(|l| l.trim_matches('\0').trim());
        let mut next_path = || {
            lines
                .next()
                .filter(|l| !l.is_empty())
                .map(PathBuf::from)
        };
        let last_directory = next_path();
        let last_file = next_path();
        Self {
            last_directory,
            last_file,
        }
    }
}

#[derive(Debug)]
pub struct ScannerStateRegion {
    file: NamedTempFile,
}

impl ScannerStateRegion {
    pub fn create() -> io::Result<Self> {
        let file = tempfile::Builder::new()
            .prefix("collection-scanner-state-")
            .tempfile()?;
        file.as_file().set_len(STATE_REGION_SIZE as u64)?;
        Ok(Self { file })
    }

    /// Key handed to the scanner.
    pub fn key(&self) -> &Path {
        self.file.path()
    }

    pub fn read(&self) -> io::Result<ScannerProgress> {
        let bytes = std::fs::read(self.key())?;
        Ok(ScannerProgress::parse(&bytes))
    }

    /// Zero the region before a new process starts writing to it.
    pub fn clear(&self) -> io::Result<()> {
        let mut file = OpenOptions::new().write(true).truncate(true).open(self.key())?;
        file.write_all(&[0u8; STATE_REGION_SIZE])?;
        file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_region_is_empty() {
        let region = ScannerStateRegion::create().unwrap();
        assert_eq!(
            std::fs::metadata(region.key()).unwrap().len(),
            STATE_REGION_SIZE as u64
        );
        assert_eq!(region.read().unwrap(), ScannerProgress::default());
    }

    #[test]
    fn test_reads_last_directory_and_file() {
        let region = ScannerStateRegion::create().unwrap();
        let mut content = b"/music/Pop/Thriller\n/music/Pop/Thriller/crash_here.ogg\n".to_vec();
        content.resize(STATE_REGION_SIZE, 0);
        std::fs::write(region.key(), &content).unwrap();

        let progress = region.read().unwrap();
        assert_eq!(progress.last_directory, Some(PathBuf::from("/music/Pop/Thriller")));
        assert_eq!(
            progress.last_file,
            Some(PathBuf::from("/music/Pop/Thriller/crash_here.ogg"))
        );

        region.clear().unwrap();
        assert_eq!(region.read().unwrap(), ScannerProgress::default());
    }

    #[test]
    fn test_directory_only() {
        let progress = ScannerProgress::parse(b"/music/Pop\0\0\0\0");
        assert_eq!(progress.last_directory, Some(PathBuf::from("/music/Pop")));
        assert_eq!(progress.last_file, None);
    }
}
