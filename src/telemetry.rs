//! Device telemetry carried on the data-feed request
//!
//! Every feed fetch reports the device's health as query parameters on the
//! feed URL. The values are diagnostic only; nothing in the pipeline depends
//! on the server reading them.

use chrono::{DateTime, SecondsFormat, Utc};
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::error::Result;

/// Static facts about the running device
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Version of the firmware currently running (e.g. "v5.deadbeef")
    pub running_version: String,
}

impl DeviceInfo {
    /// Describe a device running `running_version`
    pub fn new(running_version: impl Into<String>) -> Self {
        Self {
            running_version: running_version.into(),
        }
    }
}

/// Snapshot of the render loop's health
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DeviceStats {
    /// Whole seconds since the frame counter started
    pub uptime_secs: u64,
    /// Smoothed frames per second
    pub fps: f64,
    /// Lowest free memory reported so far, in bytes
    pub min_free_memory: u64,
}

/// Frame-rate and memory tracker driven from the host's frame loop
#[derive(Debug, Clone)]
pub struct FrameCounter {
    start: Duration,
    last_tick: Duration,
    fps: f64,
    min_free: u64,
}

impl FrameCounter {
    /// Start counting at monotonic time `now`
    pub fn new(now: Duration, free_memory: u64) -> Self {
        Self {
            start: now,
            last_tick: now,
            fps: 0.0,
            min_free: free_memory,
        }
    }

    /// Record one rendered frame at monotonic time `now`
    pub fn tick(&mut self, now: Duration) {
        let elapsed = now.saturating_sub(self.last_tick);
        if !elapsed.is_zero() {
            let instant_fps = 1.0 / elapsed.as_secs_f64();
            self.fps = 0.9 * self.fps + 0.1 * instant_fps;
        }
        self.last_tick = now;
    }

    /// Fold in a free-memory reading
    pub fn record_free_memory(&mut self, bytes: u64) {
        self.min_free = self.min_free.min(bytes);
    }

    /// Smoothed frames per second
    pub fn fps(&self) -> f64 {
        self.fps
    }

    /// Current snapshot
    pub fn stats(&self, now: Duration) -> DeviceStats {
        DeviceStats {
            uptime_secs: now.saturating_sub(self.start).as_secs(),
            fps: self.fps,
            min_free_memory: self.min_free,
        }
    }
}

/// Everything reported on one feed request
#[derive(Clone, Debug, PartialEq)]
pub struct FeedRequest {
    /// Network hardware (MAC) address
    pub hardware_address: String,
    /// Running firmware version
    pub running_version: String,
    /// Valid pack directories on disk
    pub versions_present: Vec<String>,
    /// Wall time of the request
    pub now: DateTime<Utc>,
    /// Last successful feed fetch
    pub feed_fetched: Option<DateTime<Utc>>,
    /// Last successful index fetch
    pub index_fetched: Option<DateTime<Utc>>,
    /// Render loop health
    pub stats: DeviceStats,
    /// Free space on the pack filesystem, in KiB
    pub free_disk_kb: u64,
}

impl FeedRequest {
    /// Append the telemetry to the feed base URL
    pub fn to_url(&self, base: &str) -> Result<Url> {
        let mut url = Url::parse(base)?;
        url.query_pairs_mut()
            .append_pair("p", "ac")
            .append_pair("mac", &self.hardware_address)
            .append_pair("v", &self.running_version)
            .append_pair("vp", &self.versions_present.join(","))
            .append_pair("t", &iso(Some(self.now)))
            .append_pair("af", &iso(self.feed_fetched))
            .append_pair("if", &iso(self.index_fetched))
            .append_pair("up", &self.stats.uptime_secs.to_string())
            .append_pair("fps", &format!("{:.1}", self.stats.fps))
            .append_pair("mem", &self.stats.min_free_memory.to_string())
            .append_pair("disk", &self.free_disk_kb.to_string());
        Ok(url)
    }
}

fn iso(time: Option<DateTime<Utc>>) -> String {
    time.map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}

/// Get available disk space for a given path, in bytes
///
/// Uses platform-specific APIs to query filesystem statistics:
/// - Linux, macOS: statvfs
/// - Windows: GetDiskFreeSpaceExW
pub fn available_space(path: &Path) -> std::io::Result<u64> {
    #[cfg(unix)]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        // SAFETY: c_path is a valid NUL-terminated string, stat is zeroed
        // before the call and only read after it reports success.
        unsafe {
            let mut stat: libc::statvfs = std::mem::zeroed();
            if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
                return Err(std::io::Error::last_os_error());
            }

            // f_bavail counts blocks available to unprivileged users
            #[allow(clippy::unnecessary_cast)]
            let available = (stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64);
            Ok(available)
        }
    }

    #[cfg(windows)]
    {
        use std::os::windows::ffi::OsStrExt;
        use winapi::um::fileapi::GetDiskFreeSpaceExW;

        let wide_path: Vec<u16> = path
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();

        // SAFETY: wide_path is NUL-terminated and every output pointer refers
        // to a live u64 that is only read after the call succeeds.
        unsafe {
            let mut free_bytes_available: u64 = 0;
            let mut _total_bytes: u64 = 0;
            let mut _total_free_bytes: u64 = 0;

            if GetDiskFreeSpaceExW(
                wide_path.as_ptr(),
                &mut free_bytes_available as *mut u64 as *mut _,
                &mut _total_bytes as *mut u64 as *mut _,
                &mut _total_free_bytes as *mut u64 as *mut _,
            ) == 0
            {
                return Err(std::io::Error::last_os_error());
            }

            Ok(free_bytes_available)
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = path;
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "Disk space checking is not supported on this platform",
        ))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_frame_counter_smooths_fps() {
        let mut counter = FrameCounter::new(Duration::ZERO, 100_000);
        // Steady 50 ms frames converge on 20 fps
        for i in 1..=200u64 {
            counter.tick(Duration::from_millis(i * 50));
        }
        assert!((counter.fps() - 20.0).abs() < 0.01, "fps {}", counter.fps());

        // One step of the filter: 0.9 * 0 + 0.1 * 10
        let mut counter = FrameCounter::new(Duration::ZERO, 0);
        counter.tick(Duration::from_millis(100));
        assert!((counter.fps() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_frame_counter_ignores_zero_elapsed() {
        let mut counter = FrameCounter::new(Duration::from_secs(1), 0);
        counter.tick(Duration::from_secs(1));
        assert_eq!(counter.fps(), 0.0);
    }

    #[test]
    fn test_stats_track_uptime_and_min_memory() {
        let mut counter = FrameCounter::new(Duration::from_secs(10), 50_000);
        counter.record_free_memory(40_000);
        counter.record_free_memory(45_000);

        let stats = counter.stats(Duration::from_millis(72_900));
        assert_eq!(stats.uptime_secs, 62);
        assert_eq!(stats.min_free_memory, 40_000);
    }

    #[test]
    fn test_feed_request_url() {
        let request = FeedRequest {
            hardware_address: "02:00:00:c1:0c:4b".to_string(),
            running_version: "v4.cafe".to_string(),
            versions_present: vec!["v3.abc".to_string(), "v4.cafe".to_string()],
            now: at("2024-05-01T12:00:00Z"),
            feed_fetched: Some(at("2024-05-01T11:00:00Z")),
            index_fetched: None,
            stats: DeviceStats {
                uptime_secs: 3600,
                fps: 29.96,
                min_free_memory: 41_000,
            },
            free_disk_kb: 812,
        };

        let url = request
            .to_url("https://api.example.org/v1/clock?x=1")
            .unwrap();
        let params: HashMap<String, String> = url.query_pairs().into_owned().collect();

        assert_eq!(url.path(), "/v1/clock");
        assert_eq!(params["x"], "1");
        assert_eq!(params["p"], "ac");
        assert_eq!(params["mac"], "02:00:00:c1:0c:4b");
        assert_eq!(params["v"], "v4.cafe");
        assert_eq!(params["vp"], "v3.abc,v4.cafe");
        assert_eq!(params["t"], "2024-05-01T12:00:00Z");
        assert_eq!(params["af"], "2024-05-01T11:00:00Z");
        assert_eq!(params["if"], "");
        assert_eq!(params["up"], "3600");
        assert_eq!(params["fps"], "30.0");
        assert_eq!(params["mem"], "41000");
        assert_eq!(params["disk"], "812");
    }

    #[test]
    fn test_feed_request_rejects_bad_base() {
        let request = FeedRequest {
            hardware_address: String::new(),
            running_version: String::new(),
            versions_present: Vec::new(),
            now: DateTime::UNIX_EPOCH,
            feed_fetched: None,
            index_fetched: None,
            stats: DeviceStats::default(),
            free_disk_kb: 0,
        };
        assert!(request.to_url("not a url").is_err());
    }

    #[test]
    fn test_available_space_valid_path() {
        let temp_dir = TempDir::new().unwrap();
        let available = available_space(temp_dir.path()).unwrap();
        assert!(available > 0);
    }

    #[test]
    fn test_available_space_nonexistent_path() {
        assert!(available_space(Path::new("/nonexistent/path/that/should/not/exist")).is_err());
    }
}
