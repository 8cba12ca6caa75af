//! Incremental, non-blocking resource fetching
//!
//! A [`StreamFetcher`] pulls one remote resource a chunk at a time. Each
//! [`read_chunk`](StreamFetcher::read_chunk) call is a single bounded poll that
//! yields one of three outcomes:
//!
//! - [`ChunkRead::Chunk`]: bytes that arrived since the last poll (possibly none)
//! - [`ChunkRead::Complete`]: the transfer finished; reported exactly once
//! - [`ChunkRead::Error`]: the transfer was abandoned
//!
//! The device has a single network connection. Transports guard it with a
//! [`ConnectionSlot`]: a second `open` while a stream is alive fails with
//! [`FetchError::Busy`], and dropping the stream gives the slot back.

mod http;

pub use http::HttpNetwork;

use crate::error::FetchError;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Outcome of a single poll of a byte stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkRead {
    /// Bytes available now; empty while waiting on the network
    Chunk(Vec<u8>),
    /// End of stream; no further chunks will arrive
    Complete,
    /// Transfer abandoned; the connection is unusable
    Error(FetchError),
}

/// A live transfer owned by a transport
pub trait ByteStream: Send {
    /// Poll for the next chunk without blocking
    fn poll_chunk(&mut self) -> ChunkRead;
}

/// Network environment the pipeline runs against
pub trait Network: Send {
    /// Start fetching `url`; the returned stream owns the connection slot
    fn open(&mut self, url: &str) -> Result<Box<dyn ByteStream>, FetchError>;

    /// Hardware (MAC) address reported in telemetry
    fn hardware_address(&self) -> String;
}

/// The single shared network connection slot
#[derive(Debug, Clone, Default)]
pub struct ConnectionSlot {
    busy: Arc<AtomicBool>,
}

impl ConnectionSlot {
    /// Create a free slot
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot; fails with [`FetchError::Busy`] if already claimed
    pub fn acquire(&self) -> Result<SlotGuard, FetchError> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| FetchError::Busy)?;
        Ok(SlotGuard {
            busy: self.busy.clone(),
        })
    }

    /// Whether a stream currently holds the slot
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Proof of slot ownership; releases the slot on drop
#[derive(Debug)]
pub struct SlotGuard {
    busy: Arc<AtomicBool>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// Pull-based fetcher for one remote resource
///
/// Construction never fails: an error opening the connection is reported by
/// the first [`read_chunk`](Self::read_chunk). The stream (and with it the
/// connection slot) is dropped as soon as a terminal signal is returned.
pub struct StreamFetcher {
    url: String,
    stream: Option<Box<dyn ByteStream>>,
    pending: Option<FetchError>,
    received: u64,
}

impl StreamFetcher {
    /// Open a transfer of `url` on `network`
    pub fn open(network: &mut dyn Network, url: &str) -> Self {
        debug!(url = %url, "opening transfer");
        let (stream, pending) = match network.open(url) {
            Ok(stream) => (Some(stream), None),
            Err(e) => {
                warn!(url = %url, error = %e, "failed to open transfer");
                (None, Some(e))
            }
        };
        Self {
            url: url.to_string(),
            stream,
            pending,
            received: 0,
        }
    }

    /// Poll once for the next chunk, completion, or failure
    pub fn read_chunk(&mut self) -> ChunkRead {
        let Some(stream) = self.stream.as_mut() else {
            return ChunkRead::Error(self.pending.take().unwrap_or(FetchError::Closed));
        };

        let read = stream.poll_chunk();
        match &read {
            ChunkRead::Chunk(data) => {
                self.received += data.len() as u64;
            }
            ChunkRead::Complete => {
                debug!(url = %self.url, bytes = self.received, "transfer complete");
                self.stream = None;
            }
            ChunkRead::Error(e) => {
                debug!(url = %self.url, bytes = self.received, error = %e, "transfer failed");
                self.stream = None;
            }
        }
        read
    }

    /// URL being fetched
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Bytes received so far
    pub fn bytes_received(&self) -> u64 {
        self.received
    }

    /// Whether the transfer still holds its connection
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}

impl std::fmt::Debug for StreamFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamFetcher")
            .field("url", &self.url)
            .field("open", &self.stream.is_some())
            .field("received", &self.received)
            .finish()
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;
