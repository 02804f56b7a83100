//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::collector::link::LinkTiming;
use crate::collector::{BatteryThresholds, CollectorParams};
use crate::error::{PwmonError, Result};
use crate::link::sim::AirConfig;
use crate::receiver::link::ReceiverTiming;
use crate::receiver::sync::SyncConfig;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub node: NodeConfig,
    pub radio: RadioConfig,
    pub collector: CollectorConfig,
    pub receiver: ReceiverConfig,
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which half of the system this process runs
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Collector,
    Receiver,
    /// Collector and receiver in one process over simulated air
    Sim,
}

/// Node configuration
#[derive(Debug, Deserialize, Clone)]
pub struct NodeConfig {
    #[serde(default = "default_role")]
    pub role: Role,

    /// Seed for the synthetic sampler and the simulated air
    #[serde(default)]
    pub seed: u64,
}

/// Radio backend
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RadioKind {
    Serial,
    Sim,
}

/// Radio configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RadioConfig {
    #[serde(default = "default_radio_kind")]
    pub kind: RadioKind,

    /// Serial device; empty means auto-detect
    #[serde(default)]
    pub port: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Frame loss probability on simulated air
    #[serde(default)]
    pub loss: f64,

    /// Bit corruption probability on simulated air
    #[serde(default)]
    pub corruption: f64,
}

/// Collector configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CollectorConfig {
    #[serde(default = "default_measuring_period_ms")]
    pub measuring_period_ms: u64,

    #[serde(default = "default_listen_timeout_ms")]
    pub listen_timeout_ms: u64,

    #[serde(default = "default_listen_retries")]
    pub listen_retries: u32,

    /// Battery thresholds in 0.1 mV units
    #[serde(default = "default_batt_charged")]
    pub batt_charged: u16,

    #[serde(default = "default_batt_low")]
    pub batt_low: u16,

    #[serde(default = "default_batt_hibernate")]
    pub batt_hibernate: u16,

    /// Ticks skipped between measurements while hibernating
    #[serde(default = "default_hibernate_skip")]
    pub hibernate_skip: u32,

    /// Simulated ticks per day for the synthetic load profile
    #[serde(default = "default_samples_per_day")]
    pub samples_per_day: u64,
}

/// Receiver configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ReceiverConfig {
    #[serde(default = "default_buffers")]
    pub buffers: usize,

    #[serde(default = "default_buffer_timeout_ms")]
    pub buffer_timeout_ms: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_auto_drain")]
    pub auto_drain: bool,
}

/// Telemetry configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TelemetryConfig {
    #[serde(default = "default_telemetry_enabled")]
    pub enabled: bool,

    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    #[serde(default = "default_max_records_per_file")]
    pub max_records_per_file: usize,

    #[serde(default = "default_max_files_to_keep")]
    pub max_files_to_keep: usize,
}

/// Diagnostic logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for daily rolling log files; stderr only when empty
    #[serde(default)]
    pub file_dir: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_dir: String::new(),
        }
    }
}

// Default value functions
fn default_role() -> Role { Role::Sim }

fn default_radio_kind() -> RadioKind { RadioKind::Sim }
fn default_baud_rate() -> u32 { 115200 }

fn default_measuring_period_ms() -> u64 { 12_000 }
fn default_listen_timeout_ms() -> u64 { 50 }
fn default_listen_retries() -> u32 { 3 }
fn default_batt_charged() -> u16 { 41_000 }
fn default_batt_low() -> u16 { 35_000 }
fn default_batt_hibernate() -> u16 { 32_000 }
fn default_hibernate_skip() -> u32 { 25 }
fn default_samples_per_day() -> u64 { 7200 }

fn default_buffers() -> usize { 16 }
fn default_buffer_timeout_ms() -> u64 { 30_000 }
fn default_poll_interval_ms() -> u64 { 500 }
fn default_auto_drain() -> bool { true }

fn default_telemetry_enabled() -> bool { true }
fn default_log_dir() -> String { "./telemetry".to_string() }
fn default_max_records_per_file() -> usize { 10000 }
fn default_max_files_to_keep() -> usize { 10 }

fn default_log_level() -> String { "info".to_string() }

fn invalid(msg: impl std::fmt::Display) -> PwmonError {
    PwmonError::Config(toml::de::Error::custom(msg))
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// * `Result<Config>` - Loaded and validated configuration
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use pwmon::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    fn validate(&self) -> Result<()> {
        for (name, value) in [("loss", self.radio.loss), ("corruption", self.radio.corruption)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(format!("radio {} must be between 0.0 and 1.0", name)));
            }
        }
        match (self.node.role, self.radio.kind) {
            (Role::Sim, RadioKind::Serial) => {
                return Err(invalid("role 'sim' requires radio kind 'sim'"));
            }
            (Role::Collector | Role::Receiver, RadioKind::Sim) => {
                return Err(invalid("simulated air has no peer outside role 'sim'"));
            }
            _ => {}
        }
        if ![9600, 19200, 38400, 57600, 115200, 230400].contains(&self.radio.baud_rate) {
            return Err(invalid(
                "baud_rate must be one of: 9600, 19200, 38400, 57600, 115200, 230400",
            ));
        }

        let c = &self.collector;
        if c.measuring_period_ms < 100 || c.measuring_period_ms > 3_600_000 {
            return Err(invalid("measuring_period_ms must be between 100 and 3600000"));
        }
        if c.listen_timeout_ms == 0 || c.listen_timeout_ms >= c.measuring_period_ms {
            return Err(invalid(
                "listen_timeout_ms must be greater than 0 and below measuring_period_ms",
            ));
        }
        if c.listen_retries == 0 {
            return Err(invalid("listen_retries must be greater than 0"));
        }
        if !(c.batt_hibernate < c.batt_low && c.batt_low < c.batt_charged) {
            return Err(invalid("battery thresholds must satisfy hibernate < low < charged"));
        }
        if c.hibernate_skip == 0 {
            return Err(invalid("hibernate_skip must be greater than 0"));
        }
        if c.samples_per_day == 0 {
            return Err(invalid("samples_per_day must be greater than 0"));
        }

        let r = &self.receiver;
        if r.buffers == 0 || r.buffers > 64 {
            return Err(invalid("receiver buffers must be between 1 and 64"));
        }
        if r.buffer_timeout_ms == 0 || r.buffer_timeout_ms > 600_000 {
            return Err(invalid("buffer_timeout_ms must be between 1 and 600000"));
        }
        if r.buffer_timeout_ms <= c.measuring_period_ms {
            return Err(invalid("buffer_timeout_ms must exceed measuring_period_ms"));
        }
        if r.poll_interval_ms == 0 || r.poll_interval_ms > 60_000 {
            return Err(invalid("poll_interval_ms must be between 1 and 60000"));
        }

        if self.telemetry.enabled && self.telemetry.log_dir.is_empty() {
            return Err(invalid("telemetry log_dir cannot be empty when enabled"));
        }
        if self.telemetry.max_records_per_file == 0 {
            return Err(invalid("max_records_per_file must be greater than 0"));
        }
        if self.telemetry.max_files_to_keep == 0 {
            return Err(invalid("max_files_to_keep must be greater than 0"));
        }

        if self.logging.level.is_empty() {
            return Err(invalid("logging level cannot be empty"));
        }

        Ok(())
    }

    pub fn measuring_period(&self) -> Duration {
        Duration::from_millis(self.collector.measuring_period_ms)
    }

    pub fn link_timing(&self) -> LinkTiming {
        LinkTiming {
            measuring_period: self.measuring_period(),
            listen_timeout: Duration::from_millis(self.collector.listen_timeout_ms),
            listen_retries: self.collector.listen_retries,
        }
    }

    pub fn collector_params(&self) -> CollectorParams {
        CollectorParams {
            thresholds: BatteryThresholds {
                charged: self.collector.batt_charged,
                low: self.collector.batt_low,
                hibernate: self.collector.batt_hibernate,
            },
            hibernate_skip: self.collector.hibernate_skip,
        }
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            buffers: self.receiver.buffers,
            buffer_timeout: Duration::from_millis(self.receiver.buffer_timeout_ms),
        }
    }

    pub fn receiver_timing(&self) -> ReceiverTiming {
        ReceiverTiming {
            poll_interval: Duration::from_millis(self.receiver.poll_interval_ms),
            measuring_period: self.measuring_period(),
            auto_drain: self.receiver.auto_drain,
        }
    }

    pub fn air(&self) -> AirConfig {
        AirConfig {
            loss: self.radio.loss,
            corruption: self.radio.corruption,
            seed: self.node.seed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const MINIMAL: &str = r#"
[node]

[radio]

[collector]

[receiver]

[telemetry]
"#;

    fn parse(toml_content: &str) -> Config {
        toml::from_str(toml_content).unwrap()
    }

    fn create_valid_config() -> Config {
        parse(MINIMAL)
    }

    #[test]
    fn test_default_config() {
        let config = create_valid_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.node.role, Role::Sim);
        assert_eq!(config.radio.kind, RadioKind::Sim);
        assert_eq!(config.collector.hibernate_skip, 25);
        assert_eq!(config.receiver.buffers, 16);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_config_from_file() {
        let toml_content = r#"
[node]
role = "receiver"
seed = 7

[radio]
kind = "serial"
port = "/dev/ttyUSB0"

[collector]
measuring_period_ms = 1000

[receiver]
auto_drain = false

[telemetry]
enabled = false

[logging]
level = "debug"
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let config = Config::load(temp_file.path()).unwrap();
        assert_eq!(config.node.role, Role::Receiver);
        assert_eq!(config.radio.port, "/dev/ttyUSB0");
        assert_eq!(config.link_timing().measuring_period, Duration::from_secs(1));
        assert!(!config.receiver_timing().auto_drain);
        assert_eq!(config.air().seed, 7);
    }

    #[test]
    fn test_load_missing_file() {
        assert!(Config::load("/nonexistent/pwmon.toml").is_err());
    }

    #[test]
    fn test_unknown_role_fails_to_parse() {
        let content = MINIMAL.replace("[node]", "[node]\nrole = \"gateway\"");
        assert!(toml::from_str::<Config>(&content).is_err());
    }

    #[test]
    fn test_invalid_loss_probability() {
        let mut config = create_valid_config();
        config.radio.loss = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_role_and_radio_kind_must_match() {
        let mut config = create_valid_config();
        config.radio.kind = RadioKind::Serial;
        assert!(config.validate().is_err());
        config.node.role = Role::Collector;
        assert!(config.validate().is_ok());
        config.radio.kind = RadioKind::Sim;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_baud_rate() {
        let mut config = create_valid_config();
        config.radio.baud_rate = 420000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_listen_timeout_must_fit_period() {
        let mut config = create_valid_config();
        config.collector.listen_timeout_ms = config.collector.measuring_period_ms;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_buffer_timeout_must_outlast_period() {
        let mut config = create_valid_config();
        config.receiver.buffer_timeout_ms = config.collector.measuring_period_ms;
        assert!(config.validate().is_err());
        config.receiver.buffer_timeout_ms += 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_battery_thresholds_order() {
        let mut config = create_valid_config();
        config.collector.batt_low = config.collector.batt_charged;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_values_rejected() {
        let mut config = create_valid_config();
        config.collector.listen_retries = 0;
        assert!(config.validate().is_err());

        let mut config = create_valid_config();
        config.receiver.buffers = 0;
        assert!(config.validate().is_err());

        let mut config = create_valid_config();
        config.telemetry.max_files_to_keep = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_log_dir_with_telemetry_enabled() {
        let mut config = create_valid_config();
        config.telemetry.log_dir = String::new();
        assert!(config.validate().is_err());
        config.telemetry.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_conversions() {
        let config = create_valid_config();
        let params = config.collector_params();
        assert_eq!(params.thresholds.low, 35_000);
        assert_eq!(params.hibernate_skip, 25);
        assert_eq!(config.sync_config().buffer_timeout, Duration::from_secs(30));
        assert_eq!(config.link_timing().listen_retries, 3);
    }
}
