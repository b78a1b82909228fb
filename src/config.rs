//! Relay configuration
//!
//! Loaded once at startup from JSON or TOML (picked by file extension) and
//! validated before any socket is opened.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::{
    AUTO_INTERFACE, DEFAULT_FEEDBACK_IP, DEFAULT_FEEDBACK_PORT, DEFAULT_LATENCY_MS,
    DEFAULT_PEER_IDLE_TIMEOUT_MS, DEFAULT_STATS_INTERVAL_MS,
};
use crate::error::{Error, Result};
use crate::net::is_concrete_identity;

/// Ingest protocol family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputMode {
    Srt,
    Rtsp,
}

/// Session ingest role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SrtMode {
    Caller,
    Listener,
    Multi,
}

/// One multi-interface route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiRouteConfig {
    /// Local interface address, or `"auto"`
    pub interface_ip: String,
    pub rist_dst: String,
    pub rist_port: u16,
}

/// Failover thresholds
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSwitchConfig {
    pub enable: bool,
    /// Percent
    pub max_packet_loss: f32,
    pub max_rtt_ms: u32,
}

/// Transport tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub latency_ms: u64,
    /// URL scheme for egress peers
    pub egress_scheme: String,
    pub stats_interval_ms: u64,
    /// Silence after which an ingest session counts as lost
    pub peer_idle_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            latency_ms: DEFAULT_LATENCY_MS,
            egress_scheme: "rist".to_string(),
            stats_interval_ms: DEFAULT_STATS_INTERVAL_MS,
            peer_idle_timeout_ms: DEFAULT_PEER_IDLE_TIMEOUT_MS,
        }
    }
}

impl TransportConfig {
    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    pub fn peer_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_idle_timeout_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// `text` or `json`
    pub format: String,
    pub color: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            color: true,
        }
    }
}

/// Complete relay configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    pub mode: InputMode,
    /// Required when `mode` is `srt`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub srt_mode: Option<SrtMode>,
    /// Caller-mode or pull-source URL
    #[serde(default)]
    pub input_url: String,
    #[serde(default)]
    pub listen_port: u16,
    #[serde(default = "default_true")]
    pub filter_to_wan: bool,
    #[serde(default)]
    pub rist_dst: String,
    #[serde(default)]
    pub rist_port: u16,
    /// kbps
    pub min_bitrate: u32,
    /// kbps
    pub max_bitrate: u32,
    #[serde(default, rename = "multi_route")]
    pub multi_routes: Vec<MultiRouteConfig>,
    #[serde(default)]
    pub path_switch: PathSwitchConfig,
    #[serde(default = "default_feedback_ip")]
    pub feedback_ip: String,
    #[serde(default = "default_feedback_port")]
    pub feedback_port: u16,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_true() -> bool {
    true
}

fn default_feedback_ip() -> String {
    DEFAULT_FEEDBACK_IP.to_string()
}

fn default_feedback_port() -> u16 {
    DEFAULT_FEEDBACK_PORT
}

impl RelayConfig {
    /// Load configuration from file; `.toml` is read as TOML, anything else as JSON
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config {}: {e}", path.display())))?;

        let is_toml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));

        if is_toml {
            Self::from_toml_str(&content)
        } else {
            Self::from_json_str(&content)
        }
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.min_bitrate > self.max_bitrate {
            return Err(Error::Config(format!(
                "min_bitrate ({}) exceeds max_bitrate ({})",
                self.min_bitrate, self.max_bitrate
            )));
        }

        if self.feedback_ip.parse::<IpAddr>().is_err() {
            return Err(Error::Config(format!("Invalid feedback_ip '{}'", self.feedback_ip)));
        }

        #[cfg(not(feature = "ffmpeg"))]
        if self.mode == InputMode::Rtsp && !self.input_url.is_empty() && !self.input_url.starts_with("tcp://") {
            return Err(Error::Config(format!(
                "pulling '{}' requires the ffmpeg feature; only tcp:// sources are built in",
                self.input_url
            )));
        }

        match (self.mode, self.srt_mode) {
            (InputMode::Srt, None) => {
                return Err(Error::Config("srt_mode is required when mode is srt".into()));
            }
            (InputMode::Rtsp, _) | (InputMode::Srt, Some(SrtMode::Caller)) if self.input_url.is_empty() => {
                return Err(Error::Config("input_url is required".into()));
            }
            (InputMode::Srt, Some(SrtMode::Multi)) => {
                if self.multi_routes.is_empty() {
                    return Err(Error::Config("multi mode requires at least one multi_route".into()));
                }
                for route in &self.multi_routes {
                    if route.rist_dst.is_empty() || route.rist_port == 0 {
                        return Err(Error::Config(format!(
                            "route for {} has no egress destination",
                            route.interface_ip
                        )));
                    }
                    if route.interface_ip != AUTO_INTERFACE && !is_concrete_identity(&route.interface_ip) {
                        return Err(Error::Config(format!(
                            "Invalid interface_ip '{}'",
                            route.interface_ip
                        )));
                    }
                }
                return Ok(());
            }
            _ => {}
        }

        if self.rist_dst.is_empty() || self.rist_port == 0 {
            return Err(Error::Config("rist_dst and rist_port are required".into()));
        }

        Ok(())
    }

    /// Whether failover is active for this configuration
    pub fn failover_enabled(&self) -> bool {
        self.mode == InputMode::Srt && self.srt_mode == Some(SrtMode::Multi) && self.path_switch.enable
    }

    /// Feedback target; only valid after `validate`
    pub fn feedback_endpoint(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .feedback_ip
            .parse()
            .map_err(|_| Error::Config(format!("Invalid feedback_ip '{}'", self.feedback_ip)))?;
        Ok(SocketAddr::new(ip, self.feedback_port))
    }

    /// Get default config path
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("com", "media-relay", "media-relay").map_or_else(
            || PathBuf::from("media-relay.json"),
            |dirs| dirs.config_dir().join("config.json"),
        )
    }
}

/// Initialize logging; `level_override` wins over the configured level
pub fn init_logging(config: &LoggingConfig, level_override: Option<&str>) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let level = level_override.unwrap_or(&config.level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to init logging: {e}")))?;
    } else {
        subscriber
            .with(fmt::layer().with_ansi(config.color).with_thread_names(true))
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to init logging: {e}")))?;
    }

    Ok(())
}
