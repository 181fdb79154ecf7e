//! Connector tunables.
//!
//! Every retry count, interval and timeout used by the connector lives here.
//! The defaults are the values the pipeline has always shipped with; the
//! struct doubles as a `clap` argument group so the CLI can override them
//! from flags or the environment.

use std::time::Duration;

use clap::Args;

/// Retry and timeout settings for the FC connector.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct ConnectorConfig {
    /// Number of polling attempts while waiting for a volume device to appear
    #[arg(long, env = "FC_DEVICE_SCAN_ATTEMPTS", default_value_t = 3)]
    pub device_scan_attempts: u32,

    /// Seconds between device polling attempts (a host rescan runs in between)
    #[arg(
        long = "device-scan-interval-secs",
        env = "FC_DEVICE_SCAN_INTERVAL_SECS",
        default_value = "5",
        value_parser = parse_secs
    )]
    pub device_scan_interval: Duration,

    /// Attempts while waiting for a multipath device to become read-write
    #[arg(long, env = "FC_RW_WAIT_ATTEMPTS", default_value_t = 5)]
    pub rw_wait_attempts: u32,

    /// Seconds between read-write checks
    #[arg(
        long = "rw-wait-interval-secs",
        env = "FC_RW_WAIT_INTERVAL_SECS",
        default_value = "1",
        value_parser = parse_secs
    )]
    pub rw_wait_interval: Duration,

    /// Attempts while waiting for a multipath device path to show up
    #[arg(long, env = "FC_PATH_WAIT_ATTEMPTS", default_value_t = 3)]
    pub path_wait_attempts: u32,

    /// Seconds between multipath path checks
    #[arg(
        long = "path-wait-interval-secs",
        env = "FC_PATH_WAIT_INTERVAL_SECS",
        default_value = "1",
        value_parser = parse_secs
    )]
    pub path_wait_interval: Duration,

    /// Attempts for buffer and multipath flushes
    #[arg(long, env = "FC_FLUSH_ATTEMPTS", default_value_t = 3)]
    pub flush_attempts: u32,

    /// Seconds between flush attempts
    #[arg(
        long = "flush-interval-secs",
        env = "FC_FLUSH_INTERVAL_SECS",
        default_value = "10",
        value_parser = parse_secs
    )]
    pub flush_interval: Duration,

    /// Hard deadline for a single flush or resize command, in seconds
    #[arg(
        long = "flush-timeout-secs",
        env = "FC_FLUSH_TIMEOUT_SECS",
        default_value = "180",
        value_parser = parse_secs
    )]
    pub flush_timeout: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            device_scan_attempts: 3,
            device_scan_interval: Duration::from_secs(5),
            rw_wait_attempts: 5,
            rw_wait_interval: Duration::from_secs(1),
            path_wait_attempts: 3,
            path_wait_interval: Duration::from_secs(1),
            flush_attempts: 3,
            flush_interval: Duration::from_secs(10),
            flush_timeout: Duration::from_secs(180),
        }
    }
}

fn parse_secs(s: &str) -> Result<Duration, String> {
    s.trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|e| format!("invalid number of seconds '{}': {}", s, e))
}
