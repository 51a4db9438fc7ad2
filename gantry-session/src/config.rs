//! gantry configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via GANTRY_CONFIG)
//! 3. Environment variables

use crate::session::SessionOptions;
use crate::socket::SocketOptions;
use gantry_protocol::{ByteOrder, FrameCodec, FrameFormat, LengthWidth, DEFAULT_MAX_FRAME_SIZE};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Full configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Sockets and listener.
    pub network: NetworkConfig,
    /// Per-session pipeline.
    pub session: SessionConfig,
    /// Wire format.
    pub framing: FramingConfig,
    /// Request/response correlation.
    pub correlation: CorrelationConfig,
    /// Client reconnection.
    pub reconnect: ReconnectConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("GANTRY_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.session.apply_env_overrides();
        self.framing.apply_env_overrides();
        self.correlation.apply_env_overrides();
        self.reconnect.apply_env_overrides();
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "network.max_connections must be positive".to_string(),
            ));
        }
        self.session.validate()?;
        self.framing.validate()?;
        self.correlation.validate()?;
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    pub keepalive: bool,
    pub nodelay: bool,
    /// OS receive buffer size in bytes (0 = system default).
    pub recv_buffer_size: u32,
    /// OS send buffer size in bytes (0 = system default).
    pub send_buffer_size: u32,
    /// Client dial timeout in milliseconds.
    pub connect_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, gantry_protocol::DEFAULT_PORT)),
            max_connections: 1000,
            keepalive: true,
            nodelay: true,
            recv_buffer_size: 0,
            send_buffer_size: 0,
            connect_timeout_ms: 5000,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("GANTRY_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }

        if let Ok(max) = std::env::var("GANTRY_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }

        if let Ok(keepalive) = std::env::var("GANTRY_KEEPALIVE") {
            self.keepalive = keepalive == "1" || keepalive.to_lowercase() == "true";
        }

        if let Ok(nodelay) = std::env::var("GANTRY_NODELAY") {
            self.nodelay = nodelay == "1" || nodelay.to_lowercase() == "true";
        }

        if let Ok(timeout) = std::env::var("GANTRY_CONNECT_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.connect_timeout_ms = ms;
            }
        }
    }

    /// Returns the socket options for this configuration.
    pub fn socket_options(&self) -> SocketOptions {
        SocketOptions {
            keepalive: self.keepalive,
            nodelay: self.nodelay,
            recv_buffer_size: (self.recv_buffer_size > 0).then_some(self.recv_buffer_size),
            send_buffer_size: (self.send_buffer_size > 0).then_some(self.send_buffer_size),
        }
    }

    /// Returns connect timeout as Duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Session pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub read_queue_capacity: usize,
    pub write_queue_capacity: usize,
    /// Inactivity threshold in seconds.
    pub idle_timeout_secs: u64,
    /// Maximum handler tasks admitted at once.
    pub max_in_flight: usize,
    /// Interval between idle sweeps in seconds (0 = no sweep).
    pub idle_sweep_secs: u64,
    /// How long a closing session may spend flushing queued frames, in
    /// milliseconds.
    pub close_linger_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let options = SessionOptions::default();
        Self {
            read_buffer_size: options.read_buffer_size,
            write_buffer_size: options.write_buffer_size,
            read_queue_capacity: options.read_queue_capacity,
            write_queue_capacity: options.write_queue_capacity,
            idle_timeout_secs: options.idle_timeout.as_secs(),
            max_in_flight: 10_000,
            idle_sweep_secs: 30,
            close_linger_ms: options.close_linger.as_millis() as u64,
        }
    }
}

impl SessionConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(timeout) = std::env::var("GANTRY_IDLE_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.idle_timeout_secs = secs;
            }
        }

        if let Ok(max) = std::env::var("GANTRY_MAX_IN_FLIGHT") {
            if let Ok(n) = max.parse() {
                self.max_in_flight = n;
            }
        }

        if let Ok(capacity) = std::env::var("GANTRY_READ_QUEUE") {
            if let Ok(n) = capacity.parse() {
                self.read_queue_capacity = n;
            }
        }

        if let Ok(capacity) = std::env::var("GANTRY_WRITE_QUEUE") {
            if let Ok(n) = capacity.parse() {
                self.write_queue_capacity = n;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("session.read_buffer_size", self.read_buffer_size),
            ("session.write_buffer_size", self.write_buffer_size),
            ("session.read_queue_capacity", self.read_queue_capacity),
            ("session.write_queue_capacity", self.write_queue_capacity),
            ("session.max_in_flight", self.max_in_flight),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "{} must be positive",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Returns idle timeout as Duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Returns the sweep interval, if sweeping is enabled.
    pub fn idle_sweep_interval(&self) -> Option<Duration> {
        (self.idle_sweep_secs > 0).then(|| Duration::from_secs(self.idle_sweep_secs))
    }

    pub fn options(&self) -> SessionOptions {
        SessionOptions {
            read_buffer_size: self.read_buffer_size,
            write_buffer_size: self.write_buffer_size,
            read_queue_capacity: self.read_queue_capacity,
            write_queue_capacity: self.write_queue_capacity,
            idle_timeout: self.idle_timeout(),
            close_linger: Duration::from_millis(self.close_linger_ms),
        }
    }
}

/// Wire format configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FramingConfig {
    /// Width of the length fields: 1, 2, 4 or 8 bytes.
    pub length_width: LengthWidth,
    pub byte_order: ByteOrder,
    /// Maximum frame size in bytes, length fields included.
    pub max_frame_size: u64,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            length_width: LengthWidth::Four,
            byte_order: ByteOrder::Big,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl FramingConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(width) = std::env::var("GANTRY_LENGTH_WIDTH") {
            if let Some(parsed) = width.parse::<u8>().ok().and_then(|w| LengthWidth::try_from(w).ok()) {
                self.length_width = parsed;
            }
        }

        if let Ok(order) = std::env::var("GANTRY_BYTE_ORDER") {
            match order.to_lowercase().as_str() {
                "big" => self.byte_order = ByteOrder::Big,
                "little" => self.byte_order = ByteOrder::Little,
                _ => {}
            }
        }

        if let Ok(max) = std::env::var("GANTRY_MAX_FRAME_SIZE") {
            if let Ok(n) = max.parse() {
                self.max_frame_size = n;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let format = self.format();
        let smallest = format.meta_len() + gantry_protocol::MIN_HEADER_LEN;
        if self.max_frame_size < smallest {
            return Err(ConfigError::ValidationError(format!(
                "framing.max_frame_size {} is below the minimum frame size {}",
                self.max_frame_size, smallest
            )));
        }
        if self.max_frame_size > self.length_width.max_value() {
            return Err(ConfigError::ValidationError(format!(
                "framing.max_frame_size {} does not fit in a {}-byte length field",
                self.max_frame_size,
                self.length_width.bytes()
            )));
        }
        Ok(())
    }

    pub fn format(&self) -> FrameFormat {
        FrameFormat::new(self.length_width, self.byte_order).with_max_frame_size(self.max_frame_size)
    }

    pub fn codec(&self) -> FrameCodec {
        FrameCodec::new(self.format())
    }
}

/// Correlation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    /// Number of independently locked registry shards.
    pub shards: usize,
    /// Size of the opaque ID space.
    pub max_opaque: u32,
    /// Default request timeout in milliseconds.
    pub request_timeout_ms: u64,
    /// Time wheel tick in milliseconds.
    pub wheel_tick_ms: u64,
    /// Time wheel slot count.
    pub wheel_slots: usize,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            shards: 16,
            max_opaque: 160_000,
            request_timeout_ms: 5000,
            wheel_tick_ms: 10,
            wheel_slots: 512,
        }
    }
}

impl CorrelationConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(timeout) = std::env::var("GANTRY_REQUEST_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.request_timeout_ms = ms;
            }
        }

        if let Ok(shards) = std::env::var("GANTRY_SHARDS") {
            if let Ok(n) = shards.parse() {
                self.shards = n;
            }
        }

        if let Ok(max) = std::env::var("GANTRY_MAX_OPAQUE") {
            if let Ok(n) = max.parse() {
                self.max_opaque = n;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.shards == 0 {
            return Err(ConfigError::ValidationError(
                "correlation.shards must be positive".to_string(),
            ));
        }
        if (self.max_opaque as usize) < self.shards {
            return Err(ConfigError::ValidationError(format!(
                "correlation.max_opaque {} is smaller than shard count {}",
                self.max_opaque, self.shards
            )));
        }
        if self.wheel_tick_ms == 0 || self.wheel_slots == 0 {
            return Err(ConfigError::ValidationError(
                "correlation wheel tick and slots must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns request timeout as Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Returns wheel tick as Duration.
    pub fn wheel_tick(&self) -> Duration {
        Duration::from_millis(self.wheel_tick_ms)
    }
}

/// Reconnection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub enabled: bool,
    /// Delay between attempts in milliseconds.
    pub interval_ms: u64,
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    /// Interval between sentinel sweeps in seconds.
    pub sentinel_interval_secs: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 1000,
            max_retries: 10,
            sentinel_interval_secs: 5,
        }
    }
}

impl ReconnectConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("GANTRY_RECONNECT_ENABLED") {
            self.enabled = enabled == "1" || enabled.to_lowercase() == "true";
        }

        if let Ok(interval) = std::env::var("GANTRY_RECONNECT_INTERVAL_MS") {
            if let Ok(ms) = interval.parse() {
                self.interval_ms = ms;
            }
        }

        if let Ok(max) = std::env::var("GANTRY_RECONNECT_MAX_RETRIES") {
            if let Ok(n) = max.parse() {
                self.max_retries = n;
            }
        }
    }

    /// Returns reconnect interval as Duration.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Returns sentinel interval as Duration.
    pub fn sentinel_interval(&self) -> Duration {
        Duration::from_secs(self.sentinel_interval_secs)
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Custom serde module for SocketAddr (to handle as string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
