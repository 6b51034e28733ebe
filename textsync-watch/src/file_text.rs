//! A file on disk as a live-text source.
//!
//! The sync cycle polls [`FileLiveText::text`], so edits made by any other
//! program show up on the next cycle. Remote changes are written back with
//! write-then-rename. Our own writes need no suppression: the shadow
//! already holds what was written, so re-reading it diffs to nothing.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use textsync_sync::{LiveTextError, LiveTextSource};

pub struct FileLiveText {
    path: PathBuf,
    /// Last content read or written; served when the file can't be read.
    cached: Mutex<String>,
    presence: Option<String>,
}

impl FileLiveText {
    pub fn open(path: impl Into<PathBuf>, presence: Option<String>) -> std::io::Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)?;
        Ok(Self {
            path,
            cached: Mutex::new(content),
            presence,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, text: &str) -> std::io::Result<()> {
        let tmp = self.path.with_extension("textsync.tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, &self.path)
    }
}

impl LiveTextSource for FileLiveText {
    fn text(&self) -> String {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => {
                let mut cached = self.cached.lock();
                if *cached != content {
                    log::debug!("{}: changed on disk", self.path.display());
                    *cached = content.clone();
                }
                content
            }
            Err(err) => {
                log::warn!("{}: read failed, using last known content: {err}", self.path.display());
                self.cached.lock().clone()
            }
        }
    }

    fn set_text(&self, text: &str) -> Result<(), LiveTextError> {
        if let Err(err) = self.write(text) {
            log::error!("{}: write failed: {err}", self.path.display());
            return Err(err.into());
        }
        *self.cached.lock() = text.to_owned();
        log::debug!("{}: wrote remote changes", self.path.display());
        Ok(())
    }

    fn application_message(&self) -> Option<String> {
        self.presence.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_and_writes_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("notes.txt");
        std::fs::write(&path, "first").unwrap();

        let source = FileLiveText::open(&path, None).unwrap();
        assert_eq!(source.text(), "first");

        source.set_text("second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        assert_eq!(source.text(), "second");

        // Another program edits the file.
        std::fs::write(&path, "third").unwrap();
        assert_eq!(source.text(), "third");
    }

    #[test]
    fn test_missing_file_serves_cached_text() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("gone.txt");
        std::fs::write(&path, "kept").unwrap();
        let source = FileLiveText::open(&path, Some("{}".into())).unwrap();

        std::fs::remove_file(&path).unwrap();
        assert_eq!(source.text(), "kept");
        assert_eq!(source.application_message().as_deref(), Some("{}"));
    }

    #[test]
    fn test_failed_write_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("notes.txt");
        std::fs::write(&path, "original").unwrap();
        let source = FileLiveText::open(&path, None).unwrap();

        // The temp file can't be created once its directory is gone.
        drop(tmp);
        assert!(matches!(source.set_text("remote"), Err(LiveTextError::Io(_))));
        assert_eq!(source.text(), "original");
    }
}
