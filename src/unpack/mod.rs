//! Streaming pack unpacker
//!
//! A pack archive is a plain concatenation of entries:
//!
//! ```text
//! u16 BE path length | path (UTF-8, '/'-separated, relative) | u32 BE content length | content
//! ```
//!
//! The stream ends at an entry boundary. [`PackUnpacker::step`] pulls one
//! chunk from its [`StreamFetcher`] and pushes it through the entry cursor,
//! writing content straight to disk; only header bytes are ever buffered.
//!
//! The unpacker never writes install markers. An entry that would land on a
//! marker path is rejected, so `@VALID` can only come from
//! [`InstallManager::finalize_install`](crate::install::InstallManager::finalize_install).

mod builder;

pub use builder::PackBuilder;

use crate::error::{FetchError, UnpackError};
use crate::fetch::{ChunkRead, StreamFetcher};
use crate::install::{ENABLED_MARKER, VALID_MARKER};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Longest entry path accepted, in bytes
pub const MAX_PATH_LEN: usize = 1024;

const PATH_LEN_BYTES: usize = 2;
const CONTENT_LEN_BYTES: usize = 4;

/// Result of one unpacker step
#[derive(Debug)]
pub enum UnpackStatus {
    /// More work remains
    InProgress,
    /// Every entry is written, flushed and closed
    Done,
    /// The pack was abandoned; files written so far stay on disk, unmarked
    Failed(UnpackError),
}

enum Cursor {
    PathLen(Vec<u8>),
    Path {
        len: usize,
        buf: Vec<u8>,
    },
    ContentLen {
        path: PathBuf,
        buf: Vec<u8>,
    },
    Content {
        path: PathBuf,
        file: File,
        remaining: u64,
    },
}

impl Cursor {
    fn start() -> Self {
        Cursor::PathLen(Vec::with_capacity(PATH_LEN_BYTES))
    }

    fn at_boundary(&self) -> bool {
        matches!(self, Cursor::PathLen(buf) if buf.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Running,
    Done,
    Failed,
}

/// Incrementally materializes a streamed pack into a target directory
pub struct PackUnpacker {
    fetcher: StreamFetcher,
    target: PathBuf,
    cursor: Cursor,
    entries: usize,
    bytes_written: u64,
    outcome: Outcome,
}

impl PackUnpacker {
    /// Unpack the archive carried by `fetcher` into `target`
    pub fn new(fetcher: StreamFetcher, target: impl Into<PathBuf>) -> Self {
        Self {
            fetcher,
            target: target.into(),
            cursor: Cursor::start(),
            entries: 0,
            bytes_written: 0,
            outcome: Outcome::Running,
        }
    }

    /// Do one bounded unit of work: read one chunk and write what it completes
    pub fn step(&mut self) -> UnpackStatus {
        match self.outcome {
            Outcome::Running => {}
            Outcome::Done => return UnpackStatus::Done,
            Outcome::Failed => {
                return UnpackStatus::Failed(UnpackError::Fetch(FetchError::Closed));
            }
        }

        let status = match self.fetcher.read_chunk() {
            ChunkRead::Chunk(data) => match self.consume(&data) {
                Ok(()) => UnpackStatus::InProgress,
                Err(e) => UnpackStatus::Failed(e),
            },
            ChunkRead::Complete => self.finish(),
            ChunkRead::Error(e) => UnpackStatus::Failed(UnpackError::Fetch(e)),
        };

        match &status {
            UnpackStatus::InProgress => {}
            UnpackStatus::Done => self.outcome = Outcome::Done,
            UnpackStatus::Failed(e) => {
                warn!(
                    target_dir = %self.target.display(),
                    entries = self.entries,
                    error = %e,
                    "pack unpack failed"
                );
                // Closes any half-written file
                self.cursor = Cursor::start();
                self.outcome = Outcome::Failed;
            }
        }
        status
    }

    /// Directory the pack is unpacked into
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Entries fully written so far
    pub fn entries_written(&self) -> usize {
        self.entries
    }

    /// Content bytes written so far
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn consume(&mut self, mut data: &[u8]) -> Result<(), UnpackError> {
        while !data.is_empty() {
            data = self.advance(data)?;
        }
        Ok(())
    }

    fn advance<'a>(&mut self, data: &'a [u8]) -> Result<&'a [u8], UnpackError> {
        let entry = self.entries;
        match std::mem::replace(&mut self.cursor, Cursor::start()) {
            Cursor::PathLen(mut buf) => {
                let rest = fill(&mut buf, PATH_LEN_BYTES, data);
                if buf.len() < PATH_LEN_BYTES {
                    self.cursor = Cursor::PathLen(buf);
                    return Ok(rest);
                }
                let len = usize::from(u16::from_be_bytes([buf[0], buf[1]]));
                if len == 0 || len > MAX_PATH_LEN {
                    return Err(UnpackError::InvalidHeader {
                        entry,
                        reason: format!("path length {len} out of range"),
                    });
                }
                self.cursor = Cursor::Path {
                    len,
                    buf: Vec::with_capacity(len),
                };
                Ok(rest)
            }
            Cursor::Path { len, mut buf } => {
                let rest = fill(&mut buf, len, data);
                if buf.len() < len {
                    self.cursor = Cursor::Path { len, buf };
                    return Ok(rest);
                }
                let raw = String::from_utf8(buf).map_err(|_| UnpackError::InvalidHeader {
                    entry,
                    reason: "path is not UTF-8".to_string(),
                })?;
                let path = self.target.join(safe_relative_path(&raw)?);
                self.cursor = Cursor::ContentLen {
                    path,
                    buf: Vec::with_capacity(CONTENT_LEN_BYTES),
                };
                Ok(rest)
            }
            Cursor::ContentLen { path, mut buf } => {
                let rest = fill(&mut buf, CONTENT_LEN_BYTES, data);
                if buf.len() < CONTENT_LEN_BYTES {
                    self.cursor = Cursor::ContentLen { path, buf };
                    return Ok(rest);
                }
                let remaining = u64::from(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]));
                let file = create_entry_file(&path)?;
                if remaining == 0 {
                    self.close_entry(&path, file)?;
                } else {
                    self.cursor = Cursor::Content {
                        path,
                        file,
                        remaining,
                    };
                }
                Ok(rest)
            }
            Cursor::Content {
                path,
                mut file,
                remaining,
            } => {
                let take = data.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
                file.write_all(&data[..take])
                    .map_err(|source| UnpackError::Io {
                        path: path.clone(),
                        source,
                    })?;
                self.bytes_written += take as u64;
                let remaining = remaining - take as u64;
                if remaining == 0 {
                    self.close_entry(&path, file)?;
                } else {
                    self.cursor = Cursor::Content {
                        path,
                        file,
                        remaining,
                    };
                }
                Ok(&data[take..])
            }
        }
    }

    fn close_entry(&mut self, path: &Path, file: File) -> Result<(), UnpackError> {
        file.sync_all().map_err(|source| UnpackError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        drop(file);
        self.entries += 1;
        debug!(path = %path.display(), entry = self.entries, "pack entry written");
        Ok(())
    }

    fn finish(&mut self) -> UnpackStatus {
        if !self.cursor.at_boundary() {
            return UnpackStatus::Failed(UnpackError::Truncated {
                entry: self.entries,
            });
        }
        // An empty pack still needs its directory for the markers
        if let Err(source) = std::fs::create_dir_all(&self.target) {
            return UnpackStatus::Failed(UnpackError::Io {
                path: self.target.clone(),
                source,
            });
        }
        info!(
            target_dir = %self.target.display(),
            entries = self.entries,
            bytes = self.bytes_written,
            "pack unpacked"
        );
        UnpackStatus::Done
    }
}

/// Copy up to `want - buf.len()` bytes from `data` into `buf`, returning the rest
fn fill<'a>(buf: &mut Vec<u8>, want: usize, data: &'a [u8]) -> &'a [u8] {
    let take = want.saturating_sub(buf.len()).min(data.len());
    buf.extend_from_slice(&data[..take]);
    &data[take..]
}

/// Turn an archive path into a relative path that stays inside the target
fn safe_relative_path(raw: &str) -> Result<PathBuf, UnpackError> {
    let unsafe_path = || UnpackError::UnsafePath {
        path: raw.to_string(),
    };
    if raw.starts_with('/') || raw.contains('\\') || raw.contains('\0') {
        return Err(unsafe_path());
    }

    let mut relative = PathBuf::new();
    for part in raw.split('/') {
        match part {
            "" | "." => {}
            ".." => return Err(unsafe_path()),
            part if part.contains(':') => return Err(unsafe_path()),
            part => relative.push(part),
        }
    }

    if relative.as_os_str().is_empty()
        || relative == Path::new(VALID_MARKER)
        || relative == Path::new(ENABLED_MARKER)
    {
        return Err(unsafe_path());
    }
    Ok(relative)
}

fn create_entry_file(path: &Path) -> Result<File, UnpackError> {
    let io_err = |source: std::io::Error| UnpackError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    File::create(path).map_err(io_err)
}
