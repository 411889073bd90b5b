//! Configuration for the filter engine.

use std::time::Duration;

/// Configuration for the [`FilterEngine`].
///
/// Mirrors the filter-related subset of the storage RPC configuration.
///
/// # Example
///
/// ```
/// use signet_rpc_filters::FilterConfig;
///
/// let config = FilterConfig::default();
/// assert_eq!(config.fanout_workers, 16);
/// ```
///
/// [`FilterEngine`]: crate::FilterEngine
#[derive(Debug, Clone, Copy)]
pub struct FilterConfig {
    /// Maximum number of concurrent fan-out tasks per notification class.
    ///
    /// Default: `16`.
    pub fanout_workers: usize,

    /// Maximum block range for a full-history `eth_getFilterLogs` query.
    ///
    /// Default: `10_000`.
    pub max_blocks_per_filter: u64,

    /// Time-to-live for poll-mode filters that are not being polled.
    /// Push-mode filters never expire.
    ///
    /// Default: `5 minutes`.
    pub stale_filter_ttl: Duration,

    /// How often the stale filter cleaner runs.
    ///
    /// Default: `1 minute`.
    pub stale_filter_clean_interval: Duration,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            fanout_workers: 16,
            max_blocks_per_filter: 10_000,
            stale_filter_ttl: Duration::from_secs(5 * 60),
            stale_filter_clean_interval: Duration::from_secs(60),
        }
    }
}
