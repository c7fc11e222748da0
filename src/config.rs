// backend/src/config.rs

use std::env;
use std::time::Duration;

/// Runtime configuration, read once at startup and shared via AppState.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address of the time-clock device, e.g. "192.168.1.201:4370".
    /// Unset means this deployment never reaches the device directly and
    /// relies on the bridge agent pushing logs.
    pub device_addr: Option<String>,
    /// Cheap TCP reachability probe; must stay far below op_timeout so it
    /// never blocks bulk flows.
    pub probe_timeout: Duration,
    /// Hard deadline for a single connected device operation.
    pub op_timeout: Duration,
    pub connect_retries: u32,
    pub connect_backoff: Duration,
    pub heartbeat_interval: Duration,
    pub auto_sync_interval: Duration,
    /// Operating timezone offset in minutes for day bucketing, overridable
    /// per staff member. Default is IST (+05:30).
    pub tz_offset_min: i32,
    /// Shared secret for the bridge upload endpoint (x-api-key header).
    pub bridge_api_key: String,
    /// Optional webhook hit when a regularisation request needs review.
    pub notify_webhook_url: Option<String>,
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            device_addr: env::var("DEVICE_ADDR").ok().filter(|s| !s.is_empty()),
            probe_timeout: Duration::from_millis(env_u64("DEVICE_PROBE_TIMEOUT_MS", 500)),
            op_timeout: Duration::from_secs(env_u64("DEVICE_OP_TIMEOUT_SECS", 20)),
            connect_retries: env_u64("DEVICE_CONNECT_RETRIES", 2) as u32,
            connect_backoff: Duration::from_millis(env_u64("DEVICE_CONNECT_BACKOFF_MS", 1000)),
            heartbeat_interval: Duration::from_secs(env_u64("DEVICE_HEARTBEAT_SECS", 60)),
            auto_sync_interval: Duration::from_secs(env_u64("AUTO_SYNC_SECS", 900)),
            tz_offset_min: env::var("TZ_OFFSET_MIN")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(330),
            bridge_api_key: env::var("BRIDGE_API_KEY")
                .unwrap_or_else(|_| "bridge_sync_v1_secret_key".into()),
            notify_webhook_url: env::var("NOTIFY_WEBHOOK_URL").ok().filter(|s| !s.is_empty()),
        }
    }
}
