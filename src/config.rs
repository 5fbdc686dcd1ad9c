//! Unit Configuration System using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (default `config/last_unit.toml`)
//! 2. environment variables prefixed with `LAST_UNIT_`, nested keys separated by `__`
//!
//! Every section has defaults, so an absent file yields a usable configuration.
//!
//! # Example
//! ```rust,ignore
//! use last_unit::config::UnitConfig;
//!
//! let config = UnitConfig::load()?;
//! config.validate()?;
//! println!("serving on port {}", config.server.port);
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::lipp::address::Namespace;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "config/last_unit.toml";

/// Upper bound on a LIPP datagram
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Top-level unit configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitConfig {
    /// HTTP server settings
    pub server: ServerConfig,
    /// Host topology overrides
    pub site: SiteConfig,
    /// Logging settings
    pub logging: LoggingConfig,
    /// Local driver process settings
    pub driver: DriverConfig,
    /// Peer forwarding settings
    pub forwarder: ForwarderConfig,
    /// Unit aggregator settings
    pub unit: UnitSettings,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub bind: String,
    /// Listen port
    pub port: u16,
    /// Root of the equipment API, e.g. `/last/api/v1`
    pub api_root: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8000,
            api_root: "/last/api/v1".to_string(),
        }
    }
}

/// Host topology configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    /// Use this host name instead of the system one
    pub hostname: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format (pretty, compact, json)
    pub format: String,
    /// Directory for the daily rolling log file; no file when unset
    pub directory: Option<PathBuf>,
    /// File name inside each daily file
    pub file_name: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            directory: None,
            file_name: "last-unit.log".to_string(),
        }
    }
}

/// Local LIPP driver process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Executable launched for every local driver
    pub program: String,
    /// Arguments; `{equipment}`, `{id}` and `{socket}` are substituted
    pub args: Vec<String>,
    /// Socket name prefix
    pub socket_prefix: String,
    /// Abstract (Linux) or filesystem socket namespace
    pub namespace: Namespace,
    /// Directory holding filesystem sockets
    pub socket_dir: PathBuf,
    /// Wait for the ready packet of a freshly spawned process
    #[serde(with = "humantime_serde")]
    pub ready_timeout: Duration,
    /// Wait for a response once the driver is up
    #[serde(with = "humantime_serde")]
    pub response_timeout: Duration,
    /// Silence on the probe channel tolerated while detected
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
    /// Bounded wait for the correlator lock
    #[serde(with = "humantime_serde")]
    pub lock_timeout: Duration,
    /// Grace period between terminate and kill
    #[serde(with = "humantime_serde")]
    pub stop_grace: Duration,
    /// Pause before restarting a crashed driver process
    #[serde(with = "humantime_serde")]
    pub restart_delay: Duration,
    /// Largest datagram accepted or sent
    pub max_message_bytes: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            program: "last-matlab".to_string(),
            args: vec![
                "-nodisplay".to_string(),
                "-nosplash".to_string(),
                "-batch".to_string(),
                "obs.api.Lipp('EquipmentName', '{equipment}', 'EquipmentId', {id}).loop();"
                    .to_string(),
            ],
            socket_prefix: "lipp".to_string(),
            namespace: Namespace::default(),
            socket_dir: std::env::temp_dir(),
            ready_timeout: Duration::from_secs(30),
            response_timeout: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(45),
            lock_timeout: Duration::from_secs(10),
            stop_grace: Duration::from_secs(3),
            restart_delay: Duration::from_secs(2),
            max_message_bytes: MAX_MESSAGE_BYTES,
        }
    }
}

/// Peer forwarding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwarderConfig {
    /// Port of the peer unit's HTTP server
    pub port: u16,
    /// HTTP request timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            timeout: Duration::from_secs(5),
        }
    }
}

/// Unit aggregator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitSettings {
    /// Per-device timeout during status aggregation
    #[serde(with = "humantime_serde")]
    pub status_timeout: Duration,
    /// Interval of the activity bookkeeping timer
    #[serde(with = "humantime_serde")]
    pub activity_poll: Duration,
}

impl Default for UnitSettings {
    fn default() -> Self {
        Self {
            status_timeout: Duration::from_secs(3),
            activity_poll: Duration::from_secs(2),
        }
    }
}

impl UnitConfig {
    /// Load configuration from the default path and environment variables
    ///
    /// Environment variables override the file with prefix `LAST_UNIT_`.
    /// Example: `LAST_UNIT_DRIVER__RESPONSE_TIMEOUT=3s`
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path.as_ref()).extract()
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(UnitConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("LAST_UNIT_").split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.logging.format.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log format '{}'. Must be one of: {}",
                self.logging.format,
                valid_formats.join(", ")
            ));
        }

        if !self.server.api_root.starts_with('/') {
            return Err(format!(
                "Invalid api_root '{}'. Must start with '/'",
                self.server.api_root
            ));
        }

        let driver = &self.driver;
        if driver.program.trim().is_empty() {
            return Err("driver.program must not be empty".to_string());
        }
        if driver.max_message_bytes == 0 || driver.max_message_bytes > MAX_MESSAGE_BYTES {
            return Err(format!(
                "Invalid max_message_bytes {}. Must be 1-{}",
                driver.max_message_bytes, MAX_MESSAGE_BYTES
            ));
        }
        if driver.response_timeout.is_zero() {
            return Err("driver.response_timeout must be positive".to_string());
        }
        if driver.response_timeout > driver.ready_timeout {
            return Err(format!(
                "driver.response_timeout ({:?}) must not exceed driver.ready_timeout ({:?})",
                driver.response_timeout, driver.ready_timeout
            ));
        }
        if driver.response_timeout >= driver.probe_timeout {
            return Err(format!(
                "driver.response_timeout ({:?}) must be shorter than driver.probe_timeout ({:?})",
                driver.response_timeout, driver.probe_timeout
            ));
        }

        if let Some(hostname) = &self.site.hostname {
            if !(hostname.ends_with('e') || hostname.ends_with('w')) {
                return Err(format!(
                    "Invalid site.hostname '{}'. Must end in 'e' or 'w'",
                    hostname
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = UnitConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.driver.max_message_bytes, 64 * 1024);
        assert!(config.driver.probe_timeout > config.driver.response_timeout);
    }

    #[test]
    fn loads_partial_toml_over_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [server]
            port = 8100

            [driver]
            program = "sleep"
            args = ["30"]
            response_timeout = "2s"
            probe_timeout = "20s"
            "#
        )
        .unwrap();

        let config = UnitConfig::load_from(file.path()).unwrap();
        assert_eq!(config.server.port, 8100);
        assert_eq!(config.server.api_root, "/last/api/v1");
        assert_eq!(config.driver.program, "sleep");
        assert_eq!(config.driver.response_timeout, Duration::from_secs(2));
        assert_eq!(config.driver.lock_timeout, Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = UnitConfig::load_from("/nonexistent/last_unit.toml").unwrap();
        assert_eq!(config.forwarder.port, 8000);
    }

    #[test]
    fn invalid_log_level() {
        let mut config = UnitConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn oversized_message_bound_rejected() {
        let mut config = UnitConfig::default();
        config.driver.max_message_bytes = 128 * 1024;
        assert!(config.validate().is_err());
    }

    #[test]
    fn probe_timeout_must_exceed_response_timeout() {
        let mut config = UnitConfig::default();
        config.driver.probe_timeout = config.driver.response_timeout;
        assert!(config.validate().is_err());
    }

    #[test]
    fn hostname_override_must_have_side() {
        let mut config = UnitConfig::default();
        config.site.hostname = Some("last07".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial_test::serial]
    fn environment_overrides_file() {
        std::env::set_var("LAST_UNIT_SERVER__PORT", "8123");
        let config = UnitConfig::load_from("/nonexistent/last_unit.toml");
        std::env::remove_var("LAST_UNIT_SERVER__PORT");
        assert_eq!(config.unwrap().server.port, 8123);
    }
}
