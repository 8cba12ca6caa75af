//! Common test utilities for clock-updater integration tests

use chrono::DateTime;
use clock_updater::{
    Clock, Config, DeviceInfo, HttpNetwork, ManualClock, PackBuilder, Stage, UpdatePipeline,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use wiremock::MockServer;

/// Path the mock server serves the clock feed on
pub const FEED_PATH: &str = "/v1/clock";
/// Path the mock server serves the pack index on
pub const INDEX_PATH: &str = "/packs.json";

/// Configuration pointing every URL at `server` and every file under `root`
pub fn test_config(server: &MockServer, root: &Path) -> Config {
    let mut config = Config {
        api_url: format!("{}{}", server.uri(), FEED_PATH),
        update_url: format!("{}{}", server.uri(), INDEX_PATH),
        root_dir: root.to_path_buf(),
        ..Default::default()
    };
    config.fetch.chunk_size = 256;
    config.fetch.read_timeout = Duration::from_secs(5);
    config
}

/// Pipeline over a real HTTP transport and a manual clock
pub fn http_pipeline(config: Config) -> (UpdatePipeline, Arc<ManualClock>) {
    let network = HttpNetwork::new(
        &config.fetch,
        Handle::current(),
        "02:00:00:c1:0c:4b".to_string(),
    )
    .expect("HTTP client");
    let clock = Arc::new(ManualClock::new(DateTime::UNIX_EPOCH));
    let pipeline = UpdatePipeline::new(
        config,
        Box::new(network),
        clock.clone(),
        DeviceInfo::new("v4.cafe"),
    )
    .expect("valid config");
    (pipeline, clock)
}

/// Jump to the next scheduled attempt and step until the pipeline waits again
pub async fn drive_cycle(pipeline: &mut UpdatePipeline, clock: &ManualClock) {
    let retry_at = pipeline.retry_at().expect("pipeline is waiting");
    clock.advance(retry_at.saturating_sub(clock.monotonic()));
    pipeline.step();
    assert_ne!(pipeline.stage(), Stage::Waiting, "cycle did not start");

    let finished = tokio::time::timeout(Duration::from_secs(20), async {
        while pipeline.stage() != Stage::Waiting {
            pipeline.step();
            // Let the transfer task make progress
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await;
    assert!(finished.is_ok(), "cycle did not finish in time");
}

/// Delay until the next attempt
pub fn scheduled_delay(pipeline: &UpdatePipeline, clock: &ManualClock) -> Duration {
    pipeline.retry_at().expect("pipeline is waiting") - clock.monotonic()
}

/// Index document listing one enabled pack
pub fn single_pack_index(name: &str, hash: &str, url: &str) -> String {
    let mut packs = serde_json::Map::new();
    packs.insert(
        name.to_string(),
        serde_json::json!({ "enabled": true, "hash": hash, "url": url }),
    );
    serde_json::json!({
        "name": "stable",
        "updated": "2024-05-01T12:00:00Z",
        "packs": packs
    })
    .to_string()
}

/// A small firmware pack: a boot script and a font blob
pub fn sample_pack() -> Vec<u8> {
    let font: Vec<u8> = (0..4000u32).map(|i| (i % 253) as u8).collect();
    let mut builder = PackBuilder::new();
    builder
        .add("main.py", b"import clock\nclock.run()\n")
        .expect("valid entry")
        .add("lib/fonts/5x7.bin", &font)
        .expect("valid entry");
    builder.finish()
}
