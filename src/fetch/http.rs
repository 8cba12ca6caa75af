use crate::config::FetchConfig;
use crate::error::{Error, FetchError, Result};
use futures::StreamExt;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ByteStream, ChunkRead, ConnectionSlot, Network, SlotGuard};

/// Message from a transfer task to its reader
#[derive(Debug)]
enum Transfer {
    Data(Vec<u8>),
    End,
    Failed(FetchError),
}

/// HTTP transport backed by `reqwest`
///
/// Each transfer runs on the given tokio runtime and hands its body to the
/// reader through a small bounded channel, so polling never blocks and at most
/// `channel_capacity * chunk_size` bytes are buffered.
pub struct HttpNetwork {
    client: reqwest::Client,
    runtime: Handle,
    slot: ConnectionSlot,
    chunk_size: usize,
    channel_capacity: usize,
    read_timeout: Duration,
    hardware_address: String,
}

impl HttpNetwork {
    /// Create a transport that spawns its transfers on `runtime`
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created
    pub fn new(config: &FetchConfig, runtime: Handle, hardware_address: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            // One radio connection at a time: never leave an idle one open
            .pool_max_idle_per_host(0)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| Error::Config {
                message: format!("failed to create HTTP client: {}", e),
                key: Some("fetch".to_string()),
            })?;

        Ok(Self {
            client,
            runtime,
            slot: ConnectionSlot::new(),
            chunk_size: config.chunk_size.max(1),
            channel_capacity: config.channel_capacity.max(1),
            read_timeout: config.read_timeout,
            hardware_address,
        })
    }

    /// Connection slot shared by every stream of this transport
    pub fn slot(&self) -> &ConnectionSlot {
        &self.slot
    }
}

impl Network for HttpNetwork {
    fn open(&mut self, url: &str) -> std::result::Result<Box<dyn ByteStream>, FetchError> {
        let guard = self.slot.acquire()?;
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let cancel = CancellationToken::new();

        self.runtime.spawn(run_transfer(
            self.client.clone(),
            url.to_string(),
            tx,
            cancel.clone(),
            self.chunk_size,
            self.read_timeout,
        ));

        Ok(Box::new(HttpStream {
            rx,
            cancel,
            _guard: guard,
        }))
    }

    fn hardware_address(&self) -> String {
        self.hardware_address.clone()
    }
}

struct HttpStream {
    rx: mpsc::Receiver<Transfer>,
    cancel: CancellationToken,
    _guard: SlotGuard,
}

impl ByteStream for HttpStream {
    fn poll_chunk(&mut self) -> ChunkRead {
        match self.rx.try_recv() {
            Ok(Transfer::Data(data)) => ChunkRead::Chunk(data),
            Ok(Transfer::End) => ChunkRead::Complete,
            Ok(Transfer::Failed(e)) => ChunkRead::Error(e),
            Err(TryRecvError::Empty) => ChunkRead::Chunk(Vec::new()),
            Err(TryRecvError::Disconnected) => ChunkRead::Error(FetchError::ConnectionReset),
        }
    }
}

impl Drop for HttpStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_transfer(
    client: reqwest::Client,
    url: String,
    tx: mpsc::Sender<Transfer>,
    cancel: CancellationToken,
    chunk_size: usize,
    read_timeout: Duration,
) {
    let outcome = tokio::select! {
        _ = cancel.cancelled() => {
            debug!(url = %url, "transfer cancelled by reader");
            return;
        }
        outcome = stream_body(&client, &url, &tx, chunk_size, read_timeout) => outcome,
    };

    let message = match outcome {
        Ok(()) => Transfer::End,
        Err(e) => {
            warn!(url = %url, error = %e, "transfer failed");
            Transfer::Failed(e)
        }
    };
    // Reader may already be gone; nothing left to tell it then
    let _ = tx.send(message).await;
}

async fn stream_body(
    client: &reqwest::Client,
    url: &str,
    tx: &mpsc::Sender<Transfer>,
    chunk_size: usize,
    read_timeout: Duration,
) -> std::result::Result<(), FetchError> {
    let response = tokio::time::timeout(read_timeout, client.get(url).send())
        .await
        .map_err(|_| FetchError::Timeout)??;

    if !response.status().is_success() {
        return Err(FetchError::Status(response.status().as_u16()));
    }

    let mut body = response.bytes_stream();
    loop {
        let next = tokio::time::timeout(read_timeout, body.next())
            .await
            .map_err(|_| FetchError::Timeout)?;
        let Some(bytes) = next else {
            return Ok(());
        };
        let bytes = bytes?;
        for piece in bytes.chunks(chunk_size) {
            tx.send(Transfer::Data(piece.to_vec()))
                .await
                .map_err(|_| FetchError::Closed)?;
        }
    }
}
