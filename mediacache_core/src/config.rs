use std::time::Duration;

/// Scheduling priority levels used by `GlobalQueue`.
///
/// Matches spec §4.3: higher sorts first; ties are FIFO (stable insert).
pub mod priority {
    pub const BACKGROUND: i32 = 10;
    pub const PREPLAY: i32 = 50;
    pub const PLAYING: i32 = 100;
    /// Tail / `moov` insurance segment, reserved bandwidth during startup.
    pub const PLAYING_URGENT_MINUS_50: i32 = 150;
    pub const PLAYING_URGENT: i32 = 200;
}

/// Tunables for the whole cache/proxy subsystem.
///
/// Centralized the way `rdm_server::AppState::with_connections` centralizes
/// its one tunable (`connections`) — here there are many more, so they get
/// their own struct rather than scattered constants.
#[derive(Debug, Clone)]
pub struct Config {
    pub segment_size: u64,
    pub max_segment_count: usize,
    pub global_max_concurrent_downloads: usize,
    pub per_media_max_concurrent_downloads: usize,
    pub max_cache_size: u64,
    pub cache_cleanup_ratio: f64,
    pub cache_max_age: Duration,
    pub moov_detection_bytes: usize,
    pub skip_moov_detection_threshold: u64,
    pub download_retry_count: u32,
    pub download_retry_initial_delay: Duration,
    pub http_connect_timeout: Duration,
    pub http_idle_timeout: Duration,
    pub http_stream_read_timeout: Duration,
    pub config_save_interval: Duration,
    /// Open Question 3: aggressive prefetch window beyond the last requested
    /// segment, exposed as config instead of hard-coded.
    pub prefetch_window_bytes: u64,
    pub emergency_eviction_ratio: f64,
    pub redownload_wait_timeout: Duration,
    pub redownload_max_attempts: u32,
    /// `preload`'s `includeMoov` still enqueues the last segment even for
    /// non-MP4 (or `moovAtStart == true`) media when this is set — spec
    /// §4.6's `alwaysPreloadEndSegment` escape hatch.
    pub always_preload_end_segment: bool,
    /// Age past which a dangling `.tmp` file is swept by the pre-creation
    /// auto-cleanup hook (spec §4.4), regardless of cache size pressure.
    pub stale_tmp_max_age: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let segment_size = 2 * 1024 * 1024;
        Self {
            segment_size,
            max_segment_count: 5000,
            global_max_concurrent_downloads: 4,
            per_media_max_concurrent_downloads: 3,
            max_cache_size: 500 * 1024 * 1024,
            cache_cleanup_ratio: 0.7,
            cache_max_age: Duration::from_secs(7 * 24 * 3600),
            moov_detection_bytes: 64,
            skip_moov_detection_threshold: 5 * 1024 * 1024,
            download_retry_count: 3,
            download_retry_initial_delay: Duration::from_millis(1000),
            http_connect_timeout: Duration::from_secs(10),
            http_idle_timeout: Duration::from_secs(30),
            http_stream_read_timeout: Duration::from_secs(15),
            config_save_interval: Duration::from_secs(1),
            prefetch_window_bytes: 2 * segment_size,
            emergency_eviction_ratio: 0.5,
            redownload_wait_timeout: Duration::from_secs(15),
            redownload_max_attempts: 3,
            always_preload_end_segment: false,
            stale_tmp_max_age: Duration::from_secs(24 * 3600),
        }
    }
}
