use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration structure for the rgrid master
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub ping: PingConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            ping: PingConfig::default(),
            scheduler: SchedulerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &str) -> Result<Self, crate::Error> {
        use crate::Error;

        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, crate::Error> {
        // Try to load from RGRID_CONFIG env var first
        if let Ok(config_path) = std::env::var("RGRID_CONFIG") {
            return Self::load(&config_path);
        }

        // Try default locations
        let default_paths = ["./config/master.toml", "/etc/rgrid/master.toml"];

        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        use crate::Error;

        if self.server.admin_port == 0 {
            return Err(Error::Config("Invalid admin port".to_string()));
        }

        if self.ping.delay_secs == 0 {
            return Err(Error::Config("Ping delay must be > 0".to_string()));
        }

        if self.ping.max_dropped == 0 {
            return Err(Error::Config("Max dropped ping count must be > 0".to_string()));
        }

        Ok(())
    }
}

/// Admin endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    /// Port for the admin JSON-RPC listener
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            admin_port: default_admin_port(),
        }
    }
}

/// Worker liveness probing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingConfig {
    /// Enable the ping loop
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between ping rounds
    #[serde(default = "default_ping_delay")]
    pub delay_secs: u64,

    /// Consecutive silent ping checks before a worker is marked unavailable
    #[serde(default = "default_max_dropped")]
    pub max_dropped: u32,

    /// UDP port workers listen on for pings
    #[serde(default = "default_ping_port")]
    pub port: u16,

    /// Resolve worker hosts to IPv6 addresses only
    #[serde(default)]
    pub ipv6_only: bool,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay_secs: default_ping_delay(),
            max_dropped: default_max_dropped(),
            port: default_ping_port(),
            ipv6_only: false,
        }
    }
}

impl PingConfig {
    /// Get the ping delay as a Duration
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }
}

/// Scheduling behavior knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Grace period before a timed-out task is told to stop, in seconds
    #[serde(default = "default_stop_task_grace")]
    pub stop_task_grace_secs: i64,

    /// Task slots assumed per worker added over the admin interface
    #[serde(default = "default_worker_num_cpu")]
    pub worker_num_cpu: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            stop_task_grace_secs: default_stop_task_grace(),
            worker_num_cpu: default_worker_num_cpu(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON-formatted log lines
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_admin_port() -> u16 {
    5557
}

fn default_true() -> bool {
    true
}

fn default_ping_delay() -> u64 {
    3
}

fn default_max_dropped() -> u32 {
    3
}

fn default_ping_port() -> u16 {
    5554
}

fn default_stop_task_grace() -> i64 {
    10
}

fn default_worker_num_cpu() -> u32 {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}
