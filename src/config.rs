//! Server configuration using Figment
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Built-in defaults (two channels `dev1/AIN1`/`dev1/AIN2`, 3990 Hz,
//!    390 points, trigger on `dev1/DIN1.1`, port 8001)
//! 2. `config/vkdaq.toml` or the file given with `--config`
//! 3. Environment variables prefixed with `VKDAQ_`, nested keys split on `__`
//!
//! # Example
//! ```no_run
//! use vkdaq_server::config::ServerConfig;
//!
//! let config = ServerConfig::load()?;
//! println!("Listening on port {}", config.http.port);
//! # Ok::<(), figment::Error>(())
//! ```
//!
//! Environment overrides use the section path:
//! `VKDAQ_HTTP__PORT=9000`, `VKDAQ_ACQUISITION__SAMPLE_RATE_HZ=2000`.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::acquisition::{Configuration, WorkerSettings};
use crate::control::Limits;
use crate::driver::{ChannelDefinition, MockDaqConfig, TriggerDefinition};
use crate::logging::OutputFormat;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/vkdaq.toml";

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "VKDAQ_";

/// Top-level server configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// HTTP listener
    pub http: HttpConfig,
    /// Hardware backend selection
    pub driver: DriverConfig,
    /// Acquisition task and loop timing
    pub acquisition: AcquisitionConfig,
    /// Simulated device, used when `driver.backend = "mock"`
    pub mock: MockDaqConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    pub log_format: OutputFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "VkDaq Server".to_string(),
            log_level: "info".to_string(),
            log_format: OutputFormat::Compact,
        }
    }
}

/// HTTP listener configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Bind address
    pub host: String,
    /// Bind port
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8001,
        }
    }
}

/// Hardware backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Native `libvkdaq` library
    #[default]
    Vkdaq,
    /// Simulated device
    Mock,
}

/// Driver configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Which backend to open
    pub backend: Backend,
    /// Path of the native library; the platform default name when unset
    pub library_path: Option<PathBuf>,
    /// Prefix of the hardware task name
    pub task_prefix: String,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Vkdaq,
            library_path: None,
            task_prefix: "VkDaqServer".to_string(),
        }
    }
}

/// Acquisition configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Initial sample rate in Hz
    pub sample_rate_hz: u32,
    /// Initial points per channel per capture
    pub points_per_channel: u32,
    /// Upper bound on one blocking read
    pub read_timeout_ms: u64,
    /// Pause after each published capture
    pub capture_pause_ms: u64,
    /// Delay before re-initializing after a driver fault
    pub retry_backoff_ms: u64,
    /// Largest sample rate accepted by `/configure`
    pub max_sample_rate_hz: u32,
    /// Largest capture length accepted by `/configure`
    pub max_points_per_channel: u32,
    /// Analog input channels in acquisition order
    pub channels: Vec<ChannelDefinition>,
    /// Capture trigger
    pub trigger: TriggerDefinition,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: 3990,
            points_per_channel: 390,
            read_timeout_ms: 1000,
            capture_pause_ms: 50,
            retry_backoff_ms: 1000,
            max_sample_rate_hz: 1_000_000,
            max_points_per_channel: 1_000_000,
            channels: vec![
                ChannelDefinition::new("dev1/AIN1"),
                ChannelDefinition::new("dev1/AIN2"),
            ],
            trigger: TriggerDefinition::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from `config/vkdaq.toml` and environment variables
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path.as_ref()).extract()
    }

    /// The provider stack used by [`load_from`](Self::load_from).
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(ServerConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.http.host.parse::<IpAddr>().is_err() {
            return Err(format!("Invalid http.host '{}'", self.http.host));
        }

        let acq = &self.acquisition;
        if acq.channels.is_empty() {
            return Err("acquisition.channels must list at least one channel".to_string());
        }
        let mut names = std::collections::HashSet::new();
        for channel in &acq.channels {
            if channel.name.trim().is_empty() {
                return Err("Channel names must not be empty".to_string());
            }
            if !names.insert(channel.name.as_str()) {
                return Err(format!("Duplicate channel: {}", channel.name));
            }
            if channel.range_min >= channel.range_max {
                return Err(format!(
                    "Channel {} has an empty range [{}, {}]",
                    channel.name, channel.range_min, channel.range_max
                ));
            }
        }
        if acq.trigger.source.trim().is_empty() {
            return Err("acquisition.trigger.source must not be empty".to_string());
        }

        if acq.sample_rate_hz == 0 || acq.sample_rate_hz > acq.max_sample_rate_hz {
            return Err(format!(
                "Invalid sample_rate_hz {}. Must be 1-{}",
                acq.sample_rate_hz, acq.max_sample_rate_hz
            ));
        }
        if acq.points_per_channel == 0 || acq.points_per_channel > acq.max_points_per_channel {
            return Err(format!(
                "Invalid points_per_channel {}. Must be 1-{}",
                acq.points_per_channel, acq.max_points_per_channel
            ));
        }
        if acq.read_timeout_ms == 0 {
            return Err("read_timeout_ms must be positive".to_string());
        }

        if self.driver.task_prefix.is_empty() || self.driver.task_prefix.contains('\0') {
            return Err(format!(
                "Invalid task_prefix '{}'",
                self.driver.task_prefix
            ));
        }

        Ok(())
    }

    /// Listener address. Call after [`validate`](Self::validate).
    pub fn bind_addr(&self) -> Result<SocketAddr, String> {
        let ip: IpAddr = self
            .http
            .host
            .parse()
            .map_err(|e| format!("Invalid http.host '{}': {}", self.http.host, e))?;
        Ok(SocketAddr::new(ip, self.http.port))
    }

    /// Configuration the worker applies on startup.
    pub fn initial_configuration(&self) -> Configuration {
        Configuration::new(
            self.acquisition.sample_rate_hz,
            self.acquisition.points_per_channel,
        )
    }

    /// Bounds enforced on `/configure`.
    pub fn limits(&self) -> Limits {
        Limits {
            max_sample_rate_hz: self.acquisition.max_sample_rate_hz,
            max_points_per_channel: self.acquisition.max_points_per_channel,
        }
    }

    /// Task and timing settings of the acquisition worker.
    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            channels: self.acquisition.channels.clone(),
            trigger: self.acquisition.trigger.clone(),
            read_timeout: Duration::from_millis(self.acquisition.read_timeout_ms),
            capture_pause: Duration::from_millis(self.acquisition.capture_pause_ms),
            retry_backoff: Duration::from_millis(self.acquisition.retry_backoff_ms),
            task_prefix: self.driver.task_prefix.clone(),
        }
    }
}
