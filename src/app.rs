//! Frame-driven host loop
//!
//! The device's render loop owns an [`UpdateLoop`] and calls
//! [`step`](UpdateLoop::step) once per frame after drawing. That single call
//! updates the frame statistics and gives the pipeline one bounded slice of
//! work.

use std::sync::Arc;

use crate::clock::Clock;
use crate::pipeline::UpdatePipeline;
use crate::telemetry::{DeviceStats, FrameCounter};
use crate::types::Stage;

/// Cooperative scheduler pairing the frame counter with the update pipeline
pub struct UpdateLoop {
    pipeline: UpdatePipeline,
    frames: FrameCounter,
    clock: Arc<dyn Clock>,
}

impl UpdateLoop {
    /// Drive `pipeline` from a frame loop; `free_memory` seeds the minimum
    pub fn new(pipeline: UpdatePipeline, clock: Arc<dyn Clock>, free_memory: u64) -> Self {
        let frames = FrameCounter::new(clock.monotonic(), free_memory);
        Self {
            pipeline,
            frames,
            clock,
        }
    }

    /// Account for one rendered frame and advance the pipeline once
    pub fn step(&mut self) -> Stage {
        let now = self.clock.monotonic();
        self.frames.tick(now);
        self.pipeline.update_stats(self.frames.stats(now));
        self.pipeline.step();
        self.pipeline.stage()
    }

    /// Fold in a free-memory reading taken by the host
    pub fn record_free_memory(&mut self, bytes: u64) {
        self.frames.record_free_memory(bytes);
    }

    /// Current frame statistics
    pub fn stats(&self) -> DeviceStats {
        self.frames.stats(self.clock.monotonic())
    }

    /// The driven pipeline
    pub fn pipeline(&self) -> &UpdatePipeline {
        &self.pipeline
    }

    /// The driven pipeline, mutably (pause control, subscriptions)
    pub fn pipeline_mut(&mut self) -> &mut UpdatePipeline {
        &mut self.pipeline
    }
}

impl std::fmt::Debug for UpdateLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateLoop")
            .field("pipeline", &self.pipeline)
            .field("frames", &self.frames)
            .finish()
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::Config;
    use crate::fetch::test_helpers::{Script, ScriptedNetwork};
    use crate::telemetry::DeviceInfo;
    use chrono::DateTime;
    use std::collections::HashMap;
    use std::time::Duration;
    use tempfile::TempDir;

    fn update_loop(
        root: &std::path::Path,
        network: &ScriptedNetwork,
    ) -> (UpdateLoop, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(DateTime::UNIX_EPOCH));
        let config = Config {
            api_url: "http://feed.local/clock".to_string(),
            update_url: "http://packs.local/packs.json".to_string(),
            root_dir: root.to_path_buf(),
            ..Default::default()
        };
        let pipeline = UpdatePipeline::new(
            config,
            Box::new(network.clone()),
            clock.clone(),
            DeviceInfo::new("v1.abc"),
        )
        .unwrap();
        (UpdateLoop::new(pipeline, clock.clone(), 64_000), clock)
    }

    #[test]
    fn test_frames_feed_telemetry() {
        let temp_dir = TempDir::new().unwrap();
        let network = ScriptedNetwork::new();
        network.serve("http://feed.local/clock", Script::body(b"{}", 8));
        let (mut app, clock) = update_loop(temp_dir.path(), &network);

        // 10 frames at 100 ms each reach the initial delay
        for _ in 0..10 {
            clock.advance(Duration::from_millis(100));
            app.record_free_memory(60_000);
            app.step();
        }

        assert_eq!(app.pipeline().stage(), Stage::FetchingFeed);
        let stats = app.stats();
        assert_eq!(stats.uptime_secs, 1);
        assert_eq!(stats.min_free_memory, 60_000);
        assert!(stats.fps > 0.0);

        let feed_url = url::Url::parse(&network.opened()[0]).unwrap();
        let params: HashMap<String, String> = feed_url.query_pairs().into_owned().collect();
        assert_eq!(params["up"], "1");
        assert_eq!(params["mem"], "60000");
    }

    #[test]
    fn test_step_reports_stage() {
        let temp_dir = TempDir::new().unwrap();
        let network = ScriptedNetwork::new();
        let (mut app, _clock) = update_loop(temp_dir.path(), &network);

        assert_eq!(app.step(), Stage::Waiting);
        assert!(network.opened().is_empty());
    }
}
