use crate::error::UnpackError;

use super::MAX_PATH_LEN;

/// Writes pack archives in the format [`PackUnpacker`](super::PackUnpacker) reads
///
/// # Example
///
/// ```
/// use clock_updater::unpack::PackBuilder;
///
/// let mut builder = PackBuilder::new();
/// builder.add("main.py", b"print('hi')").unwrap();
/// builder.add("lib/fonts/5x7.bin", &[0u8; 16]).unwrap();
/// let archive = builder.finish();
/// assert_eq!(archive.len(), (2 + 7 + 4 + 11) + (2 + 17 + 4 + 16));
/// ```
#[derive(Debug, Default, Clone)]
pub struct PackBuilder {
    buf: Vec<u8>,
    entries: usize,
}

impl PackBuilder {
    /// Start an empty archive
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one file entry
    pub fn add(&mut self, path: &str, content: &[u8]) -> Result<&mut Self, UnpackError> {
        let invalid = |reason: String| UnpackError::InvalidHeader {
            entry: self.entries,
            reason,
        };
        if path.is_empty() || path.len() > MAX_PATH_LEN {
            return Err(invalid(format!("path length {} out of range", path.len())));
        }
        let path_len = u16::try_from(path.len())
            .map_err(|_| invalid(format!("path length {} out of range", path.len())))?;
        let content_len = u32::try_from(content.len())
            .map_err(|_| invalid(format!("content length {} too large", content.len())))?;

        self.buf.extend_from_slice(&path_len.to_be_bytes());
        self.buf.extend_from_slice(path.as_bytes());
        self.buf.extend_from_slice(&content_len.to_be_bytes());
        self.buf.extend_from_slice(content);
        self.entries += 1;
        Ok(self)
    }

    /// Number of entries added so far
    pub fn len(&self) -> usize {
        self.entries
    }

    /// Whether no entries were added
    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// The finished archive bytes
    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}
