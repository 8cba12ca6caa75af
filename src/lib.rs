//! # clock-updater
//!
//! Crash-safe, non-blocking self-update pipeline for a networked countdown
//! clock display.
//!
//! ## Design Philosophy
//!
//! clock-updater is designed to be:
//! - **Cooperative** - One bounded unit of work per `step()`, never blocking the render loop
//! - **Crash-safe** - Marker files and rename-from-temp keep storage bootable across power loss
//! - **Self-healing** - Every failure ends in a scheduled retry, never in a panic or exit
//! - **Injectable** - Network, clock and configuration are passed in, not global
//!
//! ## Quick Start
//!
//! ```no_run
//! use clock_updater::{Config, DeviceInfo, HttpNetwork, SystemClock, UpdateLoop, UpdatePipeline};
//! use std::sync::Arc;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = tokio::runtime::Runtime::new()?;
//!     let config = Config::from_file("/prefs.json".as_ref())?;
//!
//!     let network = HttpNetwork::new(
//!         &config.fetch,
//!         runtime.handle().clone(),
//!         "02:00:00:c1:0c:4b".to_string(),
//!     )?;
//!     let clock = Arc::new(SystemClock::new());
//!     let pipeline = UpdatePipeline::new(
//!         config,
//!         Box::new(network),
//!         clock.clone(),
//!         DeviceInfo::new("v5.deadbeef"),
//!     )?;
//!
//!     let mut app = UpdateLoop::new(pipeline, clock, 0);
//!     loop {
//!         // render a frame, then
//!         app.step();
//!     }
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Frame-driven host loop
pub mod app;
/// Replace-by-rename cache files
pub mod cache;
/// Monotonic and wall-clock time sources
pub mod clock;
/// Configuration types
pub mod config;
/// Error types
pub mod error;
/// Incremental network fetching
pub mod fetch;
/// Pack index document
pub mod index;
/// Install marker protocol
pub mod install;
/// Update state machine
pub mod pipeline;
/// Latest-enabled-version selection
pub mod resolver;
/// Retry timing
pub mod retry;
/// Device telemetry
pub mod telemetry;
/// Core types (events, stages)
pub mod types;
/// Streaming pack unpacker
pub mod unpack;

// Re-export commonly used types
pub use app::UpdateLoop;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, FetchConfig, RetryConfig};
pub use error::{Error, FetchError, Result, UnpackError};
pub use fetch::{ByteStream, ChunkRead, ConnectionSlot, HttpNetwork, Network, StreamFetcher};
pub use index::{PackEntry, PackIndex, ResolvedVersion};
pub use install::{ENABLED_MARKER, InstallManager, InstalledPack, VALID_MARKER};
pub use pipeline::UpdatePipeline;
pub use resolver::resolve;
pub use telemetry::{DeviceInfo, DeviceStats, FrameCounter};
pub use types::{Event, RetryReason, Stage};
pub use unpack::{PackBuilder, PackUnpacker, UnpackStatus};
