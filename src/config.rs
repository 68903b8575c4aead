//! Application configuration using Figment
//!
//! Configuration is loaded from:
//! 1. `config/stage.toml` (or the file given with `--config`)
//! 2. Environment variables prefixed with `STAGE_DAQ_`, nested keys split
//!    on `__`
//!
//! # Example
//! ```no_run
//! use stage_daq::config::StageConfig;
//!
//! let config = StageConfig::load()?;
//! println!("Application: {}", config.application.name);
//! # Ok::<(), figment::Error>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use stage_driver_xeryon::{DiscoveryOptions, XeryonFactory};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Default configuration file
pub const DEFAULT_CONFIG_PATH: &str = "config/stage.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Port probing settings
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    /// Configured controllers
    #[serde(default)]
    pub controllers: Vec<ControllerDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Stage DAQ".to_string(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

/// Port probing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Ports to probe; empty probes every port the OS reports
    #[serde(default)]
    pub ports: Vec<String>,
    /// Baud rate used for probing
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Bound on each probe query in milliseconds
    #[serde(default = "default_query_timeout")]
    pub query_timeout_ms: u64,
    /// Quiet window for collecting the device dump in milliseconds
    #[serde(default = "default_drain_window")]
    pub drain_window_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            ports: Vec::new(),
            baud_rate: default_baud_rate(),
            query_timeout_ms: default_query_timeout(),
            drain_window_ms: default_drain_window(),
        }
    }
}

impl DiscoveryConfig {
    /// Probe options for the driver
    pub fn options(&self) -> DiscoveryOptions {
        DiscoveryOptions {
            baud_rate: self.baud_rate,
            query_timeout: Duration::from_millis(self.query_timeout_ms),
            drain_window: Duration::from_millis(self.drain_window_ms),
        }
    }
}

/// Controller definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerDefinition {
    /// Driver type (currently only "xeryon")
    #[serde(default = "default_driver_type")]
    pub r#type: String,
    /// Whether this controller is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Driver-specific configuration, validated by the driver factory
    pub config: toml::Value,
}

impl ControllerDefinition {
    /// `name` field of the driver section, if present
    pub fn name(&self) -> Option<&str> {
        self.config.get("name").and_then(toml::Value::as_str)
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_query_timeout() -> u64 {
    1000
}

fn default_drain_window() -> u64 {
    100
}

fn default_driver_type() -> String {
    "xeryon".to_string()
}

fn default_enabled() -> bool {
    true
}

impl StageConfig {
    /// Load configuration from `config/stage.toml` and environment variables
    ///
    /// Example override: `STAGE_DAQ_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path.
    ///
    /// A missing file yields the defaults plus environment overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(StageConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("STAGE_DAQ_").split("__"))
            .extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        if self.discovery.query_timeout_ms == 0 {
            return Err("discovery.query_timeout_ms must be positive".to_string());
        }

        let mut names = HashSet::new();
        for controller in &self.controllers {
            if controller.r#type != XeryonFactory.driver_type() {
                return Err(format!("Unknown controller type: {}", controller.r#type));
            }
            let name = controller
                .name()
                .ok_or_else(|| "Controller definition without a name".to_string())?;
            if !names.insert(name) {
                return Err(format!("Duplicate controller name: {}", name));
            }
        }

        Ok(())
    }

    /// Get all enabled controllers
    pub fn enabled_controllers(&self) -> Vec<&ControllerDefinition> {
        self.controllers.iter().filter(|c| c.enabled).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[application]
name = "Bench"
log_level = "debug"

[discovery]
ports = ["/dev/ttyACM0"]
query_timeout_ms = 250

[[controllers]]
type = "xeryon"
[controllers.config]
name = "bench"
port = "/dev/ttyACM0"
controller_type = "c"
[[controllers.config.axes]]
model = "XLS1"
resolution = 312.5

[[controllers]]
enabled = false
[controllers.config]
name = "spare"
port = "/dev/ttyACM1"
[[controllers.config.axes]]
model = "XRT1"
resolution = 109.0
"#;

    fn sample_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_from_file() {
        let file = sample_file();
        let config = StageConfig::load_from(file.path()).unwrap();

        assert_eq!(config.application.name, "Bench");
        assert_eq!(config.application.log_format, "pretty");
        assert_eq!(config.discovery.baud_rate, 115_200);
        assert_eq!(config.discovery.options().query_timeout, Duration::from_millis(250));
        assert_eq!(config.controllers.len(), 2);
        assert_eq!(config.enabled_controllers().len(), 1);
        assert_eq!(config.controllers[0].name(), Some("bench"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = StageConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.application.log_level, "info");
        assert!(config.controllers.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = StageConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_controller_names() {
        let file = sample_file();
        let mut config = StageConfig::load_from(file.path()).unwrap();
        let duplicate = config.controllers[0].clone();
        config.controllers.push(duplicate);
        assert!(config.validate().is_err());
    }
}
