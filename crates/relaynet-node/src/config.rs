//! Router configuration loading and management.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Interval used when a duration is unset or cannot be parsed.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

/// Full configuration for a relaynet router.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RouterConfig {
    /// Identity, address and bootstrap settings.
    #[serde(default)]
    pub router: RouterSection,

    /// Housekeeping intervals.
    #[serde(default)]
    pub timeout: TimeoutConfig,

    /// Reconnect settings for evicted router links.
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterSection {
    /// Router id announced in HELLO records.
    #[serde(default = "default_router_id")]
    pub id: String,
    /// Address other routers and peers dial, `host:port`.
    #[serde(default = "default_address")]
    pub address: String,
    /// Socket to bind. Defaults to `address`.
    #[serde(default)]
    pub listen: Option<String>,
    /// Replace the host part of `address` with the detected local IP.
    #[serde(default)]
    pub address_auto_detect: bool,
    /// Bootstrap router addresses.
    #[serde(default)]
    pub discovery: Vec<String>,
    /// Outbound queue capacity per connection.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// Durations are strings such as `"5s"`, `"250ms"` or `"1m"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_interval")]
    pub keepalive: String,
    #[serde(default = "default_interval")]
    pub routers: String,
    #[serde(default = "default_interval")]
    pub topology: String,
    #[serde(default = "default_interval")]
    pub peers: String,
    #[serde(default = "default_interval")]
    pub dedup_window: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_interval")]
    pub interval: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log format (text, json).
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Resolved housekeeping intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub keepalive: Duration,
    pub routers: Duration,
    pub topology: Duration,
    pub peers: Duration,
    pub dedup_window: Duration,
    pub reconnect: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            keepalive: DEFAULT_INTERVAL,
            routers: DEFAULT_INTERVAL,
            topology: DEFAULT_INTERVAL,
            peers: DEFAULT_INTERVAL,
            dedup_window: DEFAULT_INTERVAL,
            reconnect: DEFAULT_INTERVAL,
        }
    }
}

impl Timings {
    /// Every interval set to `interval`. Handy for tests.
    pub fn uniform(interval: Duration) -> Self {
        Self {
            keepalive: interval,
            routers: interval,
            topology: interval,
            peers: interval,
            dedup_window: interval,
            reconnect: interval,
        }
    }

    /// Connections idle for longer than this are evicted.
    pub fn liveness_threshold(&self) -> Duration {
        self.keepalive * 2
    }
}

// Default value functions
fn default_router_id() -> String {
    "router-1".into()
}
fn default_address() -> String {
    "127.0.0.1:9000".into()
}
fn default_queue_capacity() -> usize {
    256
}
fn default_interval() -> String {
    "5s".into()
}
fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            id: default_router_id(),
            address: default_address(),
            listen: None,
            address_auto_detect: false,
            discovery: Vec::new(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            keepalive: default_interval(),
            routers: default_interval(),
            topology: default_interval(),
            peers: default_interval(),
            dedup_window: default_interval(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl RouterConfig {
    /// Load config from a TOML file, falling back to defaults for missing fields.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            let config: RouterConfig = toml::from_str(&contents)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save the current config to a TOML file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// The socket the transport binds.
    pub fn listen_address(&self) -> &str {
        self.router.listen.as_deref().unwrap_or(&self.router.address)
    }

    /// Parse every interval, falling back to [`DEFAULT_INTERVAL`].
    pub fn timings(&self) -> Timings {
        Timings {
            keepalive: duration_or_default("timeout.keepalive", &self.timeout.keepalive),
            routers: duration_or_default("timeout.routers", &self.timeout.routers),
            topology: duration_or_default("timeout.topology", &self.timeout.topology),
            peers: duration_or_default("timeout.peers", &self.timeout.peers),
            dedup_window: duration_or_default("timeout.dedup_window", &self.timeout.dedup_window),
            reconnect: duration_or_default("reconnect.interval", &self.reconnect.interval),
        }
    }
}

/// Parse `"250ms"`, `"5s"`, `"1.5m"` or `"1h"`. Zero and unitless values are rejected.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    let split = value.find(|c: char| !(c.is_ascii_digit() || c == '.'))?;
    let (number, unit) = value.split_at(split);
    let millis_per_unit: u64 = match unit {
        "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        _ => return None,
    };
    let duration = match number.parse::<u64>() {
        Ok(whole) => Duration::from_millis(whole.checked_mul(millis_per_unit)?),
        Err(_) => {
            let fractional: f64 = number.parse().ok()?;
            let millis = fractional * millis_per_unit as f64;
            if !millis.is_finite() {
                return None;
            }
            Duration::from_millis(millis.round() as u64)
        }
    };
    (!duration.is_zero()).then_some(duration)
}

fn duration_or_default(name: &str, value: &str) -> Duration {
    match parse_duration(value) {
        Some(d) => d,
        None => {
            tracing::warn!(setting = name, %value, "failed to parse duration, using default 5s");
            DEFAULT_INTERVAL
        }
    }
}

/// Replace the host part of `address` with `ip`, keeping the port.
pub fn with_host(address: &str, ip: IpAddr) -> Option<String> {
    let port = relaynet_core::address_port(address)?;
    Some(std::net::SocketAddr::new(ip, port).to_string())
}
