//! The self-update state machine
//!
//! [`UpdatePipeline`] sequences one update cycle:
//!
//! ```text
//! Waiting ──due──▶ FetchingFeed ──(complete or error)──▶ FetchingIndex
//!    ▲                                                        │
//!    │                          parse + resolve ◀─────────────┘
//!    │                            │          │
//!    │    nothing new / installed │          │ new version
//!    ├────────────────────────────┘          ▼
//!    └────────────────────────────────── FetchingPack
//! ```
//!
//! Each call to [`step`](UpdatePipeline::step) does at most one chunk of
//! network or disk work, so the host can call it once per rendered frame.
//! Every failure, whatever its kind, ends the cycle in `Waiting` with the
//! failure interval; nothing here returns an error to the caller.
//!
//! The feed stage never blocks the firmware stages: a failed feed download is
//! logged and the cycle carries on with the pack index.

use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::cache::StagedFile;
use crate::clock::Clock;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fetch::{ChunkRead, Network, StreamFetcher};
use crate::index::PackIndex;
use crate::install::InstallManager;
use crate::resolver::resolve;
use crate::retry::RetrySchedule;
use crate::telemetry::{DeviceInfo, DeviceStats, FeedRequest, available_space};
use crate::types::{Event, RetryReason, Stage};
use crate::unpack::{PackUnpacker, UnpackStatus};

const EVENT_CAPACITY: usize = 64;

enum State {
    Waiting {
        retry_at: Duration,
    },
    FetchingFeed {
        fetcher: StreamFetcher,
        file: StagedFile,
    },
    FetchingIndex {
        fetcher: StreamFetcher,
        file: File,
    },
    FetchingPack {
        unpacker: PackUnpacker,
        install_dir: String,
        index: PackIndex,
    },
}

impl State {
    fn stage(&self) -> Stage {
        match self {
            State::Waiting { .. } => Stage::Waiting,
            State::FetchingFeed { .. } => Stage::FetchingFeed,
            State::FetchingIndex { .. } => Stage::FetchingIndex,
            State::FetchingPack { .. } => Stage::FetchingPack,
        }
    }
}

/// Cooperative feed-refresh and firmware-update pipeline
pub struct UpdatePipeline {
    config: Config,
    network: Box<dyn Network>,
    clock: Arc<dyn Clock>,
    device: DeviceInfo,
    installer: InstallManager,
    schedule: RetrySchedule,
    state: State,
    stats: DeviceStats,
    feed_fetched: Option<DateTime<Utc>>,
    index_fetched: Option<DateTime<Utc>>,
    event_tx: broadcast::Sender<Event>,
}

impl UpdatePipeline {
    /// Create a pipeline that makes its first attempt after the initial delay
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration does not validate.
    pub fn new(
        config: Config,
        network: Box<dyn Network>,
        clock: Arc<dyn Clock>,
        device: DeviceInfo,
    ) -> Result<Self> {
        config.validate()?;

        let schedule = RetrySchedule::new(config.retry.clone());
        let initial = schedule.initial();
        let retry_at = clock.monotonic() + initial;
        let (event_tx, _rx) = broadcast::channel(EVENT_CAPACITY);
        info!(
            root = %config.root_dir.display(),
            update_url = %config.update_url,
            delay_ms = initial.as_millis() as u64,
            "update pipeline created"
        );

        Ok(Self {
            installer: InstallManager::new(config.root_dir.clone()),
            config,
            network,
            clock,
            device,
            schedule,
            state: State::Waiting { retry_at },
            stats: DeviceStats::default(),
            feed_fetched: None,
            index_fetched: None,
            event_tx,
        })
    }

    /// Advance the pipeline by one bounded unit of work
    pub fn step(&mut self) {
        if self.is_paused() {
            if !matches!(self.state, State::Waiting { .. }) {
                info!(stage = %self.stage(), "updates paused, abandoning stage");
                // Drops the fetcher or unpacker, releasing the connection and open files
                self.state = State::Waiting {
                    retry_at: self.clock.monotonic(),
                };
            }
            return;
        }

        let placeholder = State::Waiting {
            retry_at: Duration::ZERO,
        };
        self.state = match std::mem::replace(&mut self.state, placeholder) {
            State::Waiting { retry_at } => {
                if self.clock.monotonic() >= retry_at {
                    self.start_feed()
                } else {
                    State::Waiting { retry_at }
                }
            }
            State::FetchingFeed { fetcher, file } => self.step_feed(fetcher, file),
            State::FetchingIndex { fetcher, file } => self.step_index(fetcher, file),
            State::FetchingPack {
                unpacker,
                install_dir,
                index,
            } => self.step_pack(unpacker, install_dir, index),
        };
    }

    /// Replace the telemetry snapshot sent with the next feed request
    pub fn update_stats(&mut self, stats: DeviceStats) {
        self.stats = stats;
    }

    /// Suspend all update work until `until` (wall clock); `None` resumes
    ///
    /// A stage in progress is abandoned on the next step.
    pub fn pause_until(&mut self, until: Option<DateTime<Utc>>) {
        match until {
            Some(t) => info!(until = %t, "updates paused"),
            None => info!("updates resumed"),
        }
        self.config.updates_paused_until = until;
    }

    /// Whether the pause gate is closed right now
    pub fn is_paused(&self) -> bool {
        self.config
            .updates_paused_until
            .is_some_and(|until| self.clock.now() < until)
    }

    /// Current stage
    pub fn stage(&self) -> Stage {
        self.state.stage()
    }

    /// Monotonic time of the next attempt while waiting
    pub fn retry_at(&self) -> Option<Duration> {
        match self.state {
            State::Waiting { retry_at } => Some(retry_at),
            _ => None,
        }
    }

    /// Wall time of the last published feed
    pub fn last_feed_fetch(&self) -> Option<DateTime<Utc>> {
        self.feed_fetched
    }

    /// Wall time of the last downloaded index
    pub fn last_index_fetch(&self) -> Option<DateTime<Utc>> {
        self.index_fetched
    }

    /// Consecutive failed cycles
    pub fn consecutive_failures(&self) -> u32 {
        self.schedule.consecutive_failures()
    }

    /// Marker protocol over the pack directories
    pub fn installer(&self) -> &InstallManager {
        &self.installer
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Subscribe to pipeline events
    ///
    /// The feed consumer listens for [`Event::FeedUpdated`] to reload the
    /// cached feed.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: Event) {
        // No subscribers is fine
        self.event_tx.send(event).ok();
    }

    // -----------------------------------------------------------------------
    // Waiting
    // -----------------------------------------------------------------------

    fn wait(&mut self, reason: RetryReason) -> State {
        let delay = match reason {
            RetryReason::Success => self.schedule.on_success(),
            RetryReason::Failure => self.schedule.on_failure(),
        };
        let retry_at = self.clock.monotonic() + delay;
        info!(
            ?reason,
            delay_ms = delay.as_millis() as u64,
            failures = self.schedule.consecutive_failures(),
            "next update attempt scheduled"
        );
        self.emit(Event::RetryScheduled { reason, delay });
        State::Waiting { retry_at }
    }

    fn fail(&mut self, err: &Error, context: &str) -> State {
        report(err, context);
        self.wait(RetryReason::Failure)
    }

    // -----------------------------------------------------------------------
    // Feed
    // -----------------------------------------------------------------------

    fn start_feed(&mut self) -> State {
        let file = match StagedFile::create(self.config.feed_path()) {
            Ok(file) => file,
            Err(e) => return self.feed_failed(&Error::Io(e)),
        };
        let url = match self.feed_request().to_url(&self.config.api_url) {
            Ok(url) => url,
            Err(e) => return self.feed_failed(&e),
        };
        info!(url = %self.config.api_url, "fetching clock feed");
        let fetcher = StreamFetcher::open(self.network.as_mut(), url.as_str());
        State::FetchingFeed { fetcher, file }
    }

    fn feed_request(&self) -> FeedRequest {
        let versions_present = match self.installer.installed_versions() {
            Ok(packs) => packs.into_iter().map(|p| p.dir_name).collect(),
            Err(e) => {
                warn!(error = %e, "failed to list installed packs");
                Vec::new()
            }
        };
        let free_disk_kb = match available_space(&self.config.root_dir) {
            Ok(bytes) => bytes / 1024,
            Err(e) => {
                debug!(error = %e, "free disk space unavailable");
                0
            }
        };
        FeedRequest {
            hardware_address: self.network.hardware_address(),
            running_version: self.device.running_version.clone(),
            versions_present,
            now: self.clock.now(),
            feed_fetched: self.feed_fetched,
            index_fetched: self.index_fetched,
            stats: self.stats,
            free_disk_kb,
        }
    }

    fn step_feed(&mut self, mut fetcher: StreamFetcher, mut file: StagedFile) -> State {
        match fetcher.read_chunk() {
            ChunkRead::Chunk(data) => {
                if let Err(e) = file.write(&data) {
                    drop(file);
                    drop(fetcher);
                    return self.feed_failed(&Error::Io(e));
                }
                State::FetchingFeed { fetcher, file }
            }
            ChunkRead::Complete => {
                drop(fetcher);
                match file.commit() {
                    Ok(bytes) => {
                        self.feed_fetched = Some(self.clock.now());
                        info!(bytes, "clock feed updated");
                        self.emit(Event::FeedUpdated { bytes });
                        self.start_index()
                    }
                    Err(e) => self.feed_failed(&Error::Io(e)),
                }
            }
            ChunkRead::Error(e) => {
                // Removes the .new sibling; the published feed is untouched
                drop(file);
                drop(fetcher);
                self.feed_failed(&Error::Fetch(e))
            }
        }
    }

    fn feed_failed(&mut self, err: &Error) -> State {
        report(err, "clock feed fetch aborted");
        self.emit(Event::FeedFailed {
            error: err.to_string(),
        });
        self.start_index()
    }

    // -----------------------------------------------------------------------
    // Index
    // -----------------------------------------------------------------------

    fn start_index(&mut self) -> State {
        let path = self.config.index_path();
        let file = match std::fs::create_dir_all(self.config.cache_dir())
            .and_then(|()| File::create(&path))
        {
            Ok(file) => file,
            Err(e) => return self.fail(&Error::Io(e), "cannot write pack index"),
        };
        info!(url = %self.config.update_url, "fetching pack index");
        let fetcher = StreamFetcher::open(self.network.as_mut(), &self.config.update_url);
        State::FetchingIndex { fetcher, file }
    }

    fn step_index(&mut self, mut fetcher: StreamFetcher, mut file: File) -> State {
        match fetcher.read_chunk() {
            ChunkRead::Chunk(data) => match file.write_all(&data) {
                Ok(()) => State::FetchingIndex { fetcher, file },
                Err(e) => {
                    drop(fetcher);
                    self.fail(&Error::Io(e), "index fetch aborted")
                }
            },
            ChunkRead::Complete => {
                drop(fetcher);
                let closed = file.sync_all();
                drop(file);
                if let Err(e) = closed {
                    return self.fail(&Error::Io(e), "index fetch aborted");
                }
                self.index_fetched = Some(self.clock.now());
                match PackIndex::load(&self.config.index_path()) {
                    Ok(index) => {
                        info!(
                            name = %index.index_name,
                            updated = %index.updated_at,
                            entries = index.entries.len(),
                            "pack index fetched"
                        );
                        self.emit(Event::IndexFetched {
                            name: index.index_name.clone(),
                            entries: index.entries.len(),
                        });
                        self.resolve_and_install(index)
                    }
                    Err(e) => self.fail(&e, "unreadable pack index"),
                }
            }
            ChunkRead::Error(e) => {
                drop(file);
                drop(fetcher);
                self.fail(&Error::Fetch(e), "index fetch aborted")
            }
        }
    }

    // -----------------------------------------------------------------------
    // Resolution and pack install
    // -----------------------------------------------------------------------

    fn resolve_and_install(&mut self, index: PackIndex) -> State {
        let Some(version) = resolve(&index) else {
            info!("no enabled pack versions in index");
            return self.finish_cycle(&index);
        };

        let installed = self.installer.is_installed(&version.install_dir);
        info!(
            version = version.numeric_version,
            install_dir = %version.install_dir,
            url = %version.url,
            installed,
            "latest enabled pack resolved"
        );
        self.emit(Event::VersionResolved {
            version: version.numeric_version,
            install_dir: version.install_dir.clone(),
            already_installed: installed,
        });
        if installed {
            return self.finish_cycle(&index);
        }

        let fetcher = StreamFetcher::open(self.network.as_mut(), &version.url);
        let target = self.installer.pack_path(&version.install_dir);
        State::FetchingPack {
            unpacker: PackUnpacker::new(fetcher, target),
            install_dir: version.install_dir,
            index,
        }
    }

    fn step_pack(
        &mut self,
        mut unpacker: PackUnpacker,
        install_dir: String,
        index: PackIndex,
    ) -> State {
        match unpacker.step() {
            UnpackStatus::InProgress => State::FetchingPack {
                unpacker,
                install_dir,
                index,
            },
            UnpackStatus::Done => {
                let entries = unpacker.entries_written();
                let bytes = unpacker.bytes_written();
                drop(unpacker);
                if let Err(e) = self.installer.finalize_install(&install_dir) {
                    return self.fail(&e, "cannot mark pack valid");
                }
                info!(install_dir = %install_dir, entries, bytes, "pack installed");
                self.emit(Event::PackInstalled {
                    install_dir,
                    entries,
                    bytes,
                });
                self.finish_cycle(&index)
            }
            UnpackStatus::Failed(e) => {
                drop(unpacker);
                let err = Error::Unpack(e);
                self.emit(Event::PackFailed {
                    install_dir,
                    error: err.to_string(),
                });
                self.fail(&err, "pack fetch aborted")
            }
        }
    }

    fn finish_cycle(&mut self, index: &PackIndex) -> State {
        if let Err(e) = self.installer.apply_enabled_flags(index) {
            return self.fail(&e, "cannot update enabled flags");
        }
        self.emit(Event::FlagsApplied);
        self.wait(RetryReason::Success)
    }
}

impl std::fmt::Debug for UpdatePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdatePipeline")
            .field("stage", &self.stage())
            .field("retry_at", &self.retry_at())
            .field("failures", &self.schedule.consecutive_failures())
            .finish()
    }
}

fn report(err: &Error, context: &str) {
    if err.is_transient() {
        warn!(error = %err, "{context}");
    } else {
        error!(error = %err, "{context}");
    }
}
