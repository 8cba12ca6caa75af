//! Scripted in-memory network for exercising fetchers and the pipeline.

use super::{ByteStream, ChunkRead, ConnectionSlot, Network, SlotGuard};
use crate::error::FetchError;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// What a single `open` of a URL produces
#[derive(Debug, Clone)]
pub(crate) struct Script {
    open: Result<(), FetchError>,
    reads: VecDeque<ChunkRead>,
    stall: bool,
}

impl Script {
    /// Serve `data` in pieces of `chunk` bytes, then complete
    pub(crate) fn body(data: &[u8], chunk: usize) -> Self {
        let mut reads: VecDeque<ChunkRead> = data
            .chunks(chunk.max(1))
            .map(|c| ChunkRead::Chunk(c.to_vec()))
            .collect();
        reads.push_back(ChunkRead::Complete);
        Self {
            open: Ok(()),
            reads,
            stall: false,
        }
    }

    /// Fail the open itself
    pub(crate) fn refuse(error: FetchError) -> Self {
        Self {
            open: Err(error),
            reads: VecDeque::new(),
            stall: false,
        }
    }

    /// Serve `data`, then keep returning empty chunks forever
    pub(crate) fn stall_after(data: &[u8]) -> Self {
        let mut script = Self::body(data, data.len().max(1));
        script.reads.pop_back();
        script.stall = true;
        script
    }

    /// Replace the final completion with `error`
    pub(crate) fn then_fail(mut self, error: FetchError) -> Self {
        if matches!(self.reads.back(), Some(ChunkRead::Complete)) {
            self.reads.pop_back();
        }
        self.reads.push_back(ChunkRead::Error(error));
        self
    }

    /// Insert `n` empty polls before every chunk
    pub(crate) fn with_idle_polls(mut self, n: usize) -> Self {
        let mut reads = VecDeque::new();
        for read in self.reads.drain(..) {
            for _ in 0..n {
                reads.push_back(ChunkRead::Chunk(Vec::new()));
            }
            reads.push_back(read);
        }
        self.reads = reads;
        self
    }
}

#[derive(Default)]
struct Inner {
    routes: HashMap<String, VecDeque<Script>>,
    opened: Vec<String>,
}

/// Network whose responses are queued per URL (query string ignored)
///
/// Clones share routes, the open log and the connection slot, so a test can
/// keep a handle after moving one into the pipeline.
#[derive(Clone, Default)]
pub(crate) struct ScriptedNetwork {
    inner: Arc<Mutex<Inner>>,
    slot: ConnectionSlot,
}

impl ScriptedNetwork {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queue a response for the next open of `url`
    pub(crate) fn serve(&self, url: &str, script: Script) {
        self.inner
            .lock()
            .unwrap()
            .routes
            .entry(url.to_string())
            .or_default()
            .push_back(script);
    }

    /// Every URL opened so far, in order, including query strings
    pub(crate) fn opened(&self) -> Vec<String> {
        self.inner.lock().unwrap().opened.clone()
    }

    /// Number of opens whose URL (without query) is `url`
    pub(crate) fn open_count(&self, url: &str) -> usize {
        self.opened()
            .iter()
            .filter(|u| route_key(u) == url)
            .count()
    }

    pub(crate) fn slot(&self) -> &ConnectionSlot {
        &self.slot
    }
}

fn route_key(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

impl Network for ScriptedNetwork {
    fn open(&mut self, url: &str) -> Result<Box<dyn ByteStream>, FetchError> {
        let guard = self.slot.acquire()?;
        let mut inner = self.inner.lock().unwrap();
        inner.opened.push(url.to_string());
        let script = inner
            .routes
            .get_mut(route_key(url))
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(|| Script::refuse(FetchError::Status(404)));
        script.open?;
        Ok(Box::new(ScriptedStream {
            reads: script.reads,
            stall: script.stall,
            _guard: guard,
        }))
    }

    fn hardware_address(&self) -> String {
        "02:00:00:c1:0c:4b".to_string()
    }
}

struct ScriptedStream {
    reads: VecDeque<ChunkRead>,
    stall: bool,
    _guard: SlotGuard,
}

impl ByteStream for ScriptedStream {
    fn poll_chunk(&mut self) -> ChunkRead {
        match self.reads.pop_front() {
            Some(read) => read,
            None if self.stall => ChunkRead::Chunk(Vec::new()),
            None => ChunkRead::Error(FetchError::ConnectionReset),
        }
    }
}
