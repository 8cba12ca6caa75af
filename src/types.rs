//! Core types for clock-updater

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Discriminant of the pipeline's live state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Sleeping until the next attempt is due
    Waiting,
    /// Downloading the clock data feed
    FetchingFeed,
    /// Downloading the pack index
    FetchingIndex,
    /// Streaming and unpacking a pack
    FetchingPack,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Waiting => "waiting",
            Stage::FetchingFeed => "fetching_feed",
            Stage::FetchingIndex => "fetching_index",
            Stage::FetchingPack => "fetching_pack",
        };
        f.write_str(name)
    }
}

/// Which interval a wait was scheduled with
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryReason {
    /// The cycle finished
    Success,
    /// A stage failed
    Failure,
}

/// Event emitted while the pipeline runs
///
/// Delivered over a broadcast channel; see
/// [`UpdatePipeline::subscribe`](crate::pipeline::UpdatePipeline::subscribe).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A new data feed was published to the cache
    FeedUpdated {
        /// Size of the published feed in bytes
        bytes: u64,
    },

    /// The feed download failed; the previous feed stays published
    FeedFailed {
        /// Error description
        error: String,
    },

    /// The pack index was downloaded and parsed
    IndexFetched {
        /// Index (channel) name
        name: String,
        /// Number of entries in the index
        entries: usize,
    },

    /// A pack was selected for installation
    VersionResolved {
        /// Numeric version
        version: u64,
        /// Install directory name
        install_dir: String,
        /// Whether the pack is already marked valid on disk
        already_installed: bool,
    },

    /// A pack was unpacked and marked valid
    PackInstalled {
        /// Install directory name
        install_dir: String,
        /// Entries written
        entries: usize,
        /// Content bytes written
        bytes: u64,
    },

    /// A pack download or unpack was abandoned
    PackFailed {
        /// Install directory name
        install_dir: String,
        /// Error description
        error: String,
    },

    /// Enabled markers now match the index
    FlagsApplied,

    /// The pipeline went back to waiting
    RetryScheduled {
        /// Why this interval was picked
        reason: RetryReason,
        /// Delay until the next attempt
        #[serde(with = "millis")]
        delay: Duration,
    },
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
