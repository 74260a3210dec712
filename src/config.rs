use std::time::Duration;

/// Default maximum number of entries kept per view before eviction.
pub const DEFAULT_MAX_ENTRIES_PER_VIEW: usize = 10_000;

#[derive(Debug, Clone)]
pub struct LiveStackConfig {
    pub auto_reconnect: bool,
    pub reconnect_intervals: Vec<Duration>,
    pub max_reconnect_attempts: u32,
    pub ping_interval: Duration,
    /// Per-view entry bound. `None` disables eviction.
    pub max_entries_per_view: Option<usize>,
    /// Batching window for `values()` streams. Zero disables coalescing.
    pub flush_interval: Duration,
}

impl Default for LiveStackConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            reconnect_intervals: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(16),
            ],
            max_reconnect_attempts: 5,
            ping_interval: Duration::from_secs(15),
            max_entries_per_view: Some(DEFAULT_MAX_ENTRIES_PER_VIEW),
            flush_interval: Duration::from_millis(16),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub auto_reconnect: bool,
    pub reconnect_intervals: Vec<Duration>,
    pub max_reconnect_attempts: u32,
    pub ping_interval: Duration,
}

impl From<LiveStackConfig> for ConnectionConfig {
    fn from(config: LiveStackConfig) -> Self {
        Self {
            auto_reconnect: config.auto_reconnect,
            reconnect_intervals: config.reconnect_intervals,
            max_reconnect_attempts: config.max_reconnect_attempts,
            ping_interval: config.ping_interval,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        LiveStackConfig::default().into()
    }
}
