//! Replace-by-rename cache files
//!
//! A reader of `clock.json` must never see a half-written feed. Downloads go to
//! a `.new` sibling; [`StagedFile::commit`] flushes it and renames it over the
//! published file in one step. Dropping an uncommitted `StagedFile` deletes the
//! sibling and leaves the published file as it was.

use std::ffi::OsString;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Suffix of the staging sibling
pub const STAGING_SUFFIX: &str = ".new";

/// A file written under a temporary name and published atomically
#[derive(Debug)]
pub struct StagedFile {
    target: PathBuf,
    staging: PathBuf,
    file: Option<File>,
    written: u64,
}

impl StagedFile {
    /// Start staging a new version of `target`
    ///
    /// Creates the parent directory if needed and truncates any leftover
    /// staging file from an earlier, interrupted attempt.
    pub fn create(target: impl Into<PathBuf>) -> io::Result<Self> {
        let target = target.into();
        let staging = staging_path(&target);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(&staging)?;
        Ok(Self {
            target,
            staging,
            file: Some(file),
            written: 0,
        })
    }

    /// Append bytes to the staging file
    pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::other("staged file already committed"))?;
        file.write_all(data)?;
        self.written += data.len() as u64;
        Ok(())
    }

    /// Flush the staging file and rename it over the target
    ///
    /// Returns the number of bytes published.
    pub fn commit(mut self) -> io::Result<u64> {
        let file = self
            .file
            .take()
            .ok_or_else(|| io::Error::other("staged file already committed"))?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&self.staging, &self.target)?;
        if let Some(parent) = self.target.parent() {
            sync_dir(parent)?;
        }
        debug!(path = %self.target.display(), bytes = self.written, "published");
        Ok(self.written)
    }

    /// Bytes written so far
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Path that is published on commit
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Temporary path being written
    pub fn staging(&self) -> &Path {
        &self.staging
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        // Uncommitted, or the rename failed: leave no sibling behind
        if self.staging.exists() {
            self.file = None;
            if let Err(e) = std::fs::remove_file(&self.staging) {
                warn!(path = %self.staging.display(), error = %e, "failed to remove staging file");
            }
        }
    }
}

/// Flush a directory's entries so a rename or new file in it survives power loss
///
/// Only meaningful on unix; elsewhere the directory cannot be opened as a file
/// and this does nothing.
pub fn sync_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
        Ok(())
    }
}

/// `<target>.new`
pub fn staging_path(target: &Path) -> PathBuf {
    let mut name = OsString::from(target.as_os_str());
    name.push(STAGING_SUFFIX);
    PathBuf::from(name)
}
