//! DCB configuration using Figment
//!
//! Strongly-typed configuration for the filter-wheel controller, the PDU
//! lamp bank, the persistence file and the collimator bookkeeping.
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables (prefixed with `DCB_`, `__` between levels)
//!
//! Every section has defaults, so an empty file yields a complete
//! simulation-mode configuration.

use crate::status::Wheel;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File or environment could not be read or merged
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    /// Values are inconsistent
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// How a controller reaches its device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Real TCP connection to the device.
    Operation,
    /// In-process simulator.
    Simulation,
}

impl Mode {
    /// Lower-case name, as used in the config file.
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Operation => "operation",
            Mode::Simulation => "simulation",
        }
    }
}

/// Top-level DCB configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DcbConfig {
    /// Name and logging
    #[serde(default)]
    pub application: ApplicationConfig,
    /// State file
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// Filter-wheel controller
    #[serde(default)]
    pub filterwheel: FilterWheelConfig,
    /// PDU and lamps
    #[serde(default)]
    pub sources: SourcesConfig,
    /// Collimator declarations
    #[serde(default)]
    pub collimators: CollimatorConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Actor name, used as keyword prefix and in logs
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit logs as JSON lines
    #[serde(default)]
    pub json_logs: bool,
}

/// Where logical device state is persisted
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// JSON file backing the key/value store; in-memory when absent
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Per-wheel configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WheelConfig {
    /// Filter-wheel port reported by the controller during calibration
    pub fw_port: u8,
    /// Hole label for each slot, slot 1 first
    pub holes: Vec<String>,
}

/// Filter-wheel controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterWheelConfig {
    /// Real device or simulator
    #[serde(default = "default_mode")]
    pub mode: Mode,
    /// Device host name or address
    #[serde(default = "default_filterwheel_host")]
    pub host: String,
    /// Device TCP port
    #[serde(default = "default_filterwheel_port")]
    pub port: u16,
    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Single read window in milliseconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
    /// Total time allowed for a move to be confirmed
    #[serde(default = "default_move_limit")]
    pub move_time_limit_secs: u64,
    /// Calibration phase 1: the right wheel was selected
    #[serde(default = "default_calib_select")]
    pub calibration_select_secs: u64,
    /// Calibration phase 2: the calibration cycle started
    #[serde(default = "default_calib_start")]
    pub calibration_start_secs: u64,
    /// Calibration phase 3: the calibration cycle completed
    #[serde(default = "default_calib_done")]
    pub calibration_done_secs: u64,
    /// Time allowed for each step of the ADC offset zeroing
    #[serde(default = "default_adc_zero")]
    pub adc_zero_secs: u64,
    /// Read attempts allowed per protocol phase
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Arc-line wheel
    #[serde(default = "default_linewheel")]
    pub linewheel: WheelConfig,
    /// Quartz-halogen wheel
    #[serde(default = "default_qthwheel")]
    pub qthwheel: WheelConfig,
}

/// Lamp definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LampConfig {
    /// PDU outlet identifier, e.g. "01"
    pub outlet: String,
    /// Default warm-up time in seconds
    #[serde(default)]
    pub warmup_secs: f64,
}

/// PDU lamp-bank configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcesConfig {
    /// Real device or simulator
    #[serde(default = "default_mode")]
    pub mode: Mode,
    /// Device host name or address
    #[serde(default = "default_pdu_host")]
    pub host: String,
    /// Device TCP port
    #[serde(default = "default_pdu_port")]
    pub port: u16,
    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Time to wait for the PDU's reply to one command
    #[serde(default = "default_pdu_command_timeout")]
    pub command_timeout_ms: u64,
    /// Time allowed for an outlet to report "on"
    #[serde(default = "default_switch_on_timeout")]
    pub switch_on_timeout_ms: u64,
    /// Time allowed for an outlet to report "off"
    #[serde(default = "default_switch_off_timeout")]
    pub switch_off_timeout_ms: u64,
    /// Backoff between outlet status polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Read attempts allowed while waiting for one PDU reply
    #[serde(default = "default_pdu_max_iterations")]
    pub max_iterations: u32,
    /// Lamps by name
    #[serde(default = "default_lamps")]
    pub lamps: BTreeMap<String, LampConfig>,
}

/// Collimator bookkeeping configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollimatorConfig {
    /// Fiber-bundle colors that may be declared on a collimator
    #[serde(default = "default_bundle_colors")]
    pub bundle_colors: Vec<String>,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_name() -> String {
    "dcb".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_mode() -> Mode {
    Mode::Simulation
}

fn default_filterwheel_host() -> String {
    "filterwheel-dcb".to_string()
}

fn default_filterwheel_port() -> u16 {
    9000
}

fn default_pdu_host() -> String {
    "pdu-dcb".to_string()
}

fn default_pdu_port() -> u16 {
    23
}

fn default_connect_timeout() -> u64 {
    3000
}

fn default_read_timeout() -> u64 {
    1000
}

fn default_move_limit() -> u64 {
    30
}

fn default_calib_select() -> u64 {
    10
}

fn default_calib_start() -> u64 {
    30
}

fn default_calib_done() -> u64 {
    60
}

fn default_adc_zero() -> u64 {
    10
}

fn default_max_iterations() -> u32 {
    500
}

fn default_pdu_command_timeout() -> u64 {
    2000
}

fn default_switch_on_timeout() -> u64 {
    2000
}

fn default_switch_off_timeout() -> u64 {
    5000
}

fn default_poll_interval() -> u64 {
    50
}

fn default_pdu_max_iterations() -> u32 {
    100
}

fn default_holes() -> Vec<String> {
    ["none", "0.5", "1.0", "2.0", "4.0"]
        .iter()
        .map(|h| h.to_string())
        .collect()
}

fn default_linewheel() -> WheelConfig {
    WheelConfig {
        fw_port: 0,
        holes: default_holes(),
    }
}

fn default_qthwheel() -> WheelConfig {
    WheelConfig {
        fw_port: 1,
        holes: default_holes(),
    }
}

fn default_lamps() -> BTreeMap<String, LampConfig> {
    [
        ("halogen", "01", 60.0),
        ("argon", "02", 15.0),
        ("hgar", "03", 15.0),
        ("neon", "04", 15.0),
        ("krypton", "05", 15.0),
    ]
    .into_iter()
    .map(|(name, outlet, warmup_secs)| {
        (
            name.to_string(),
            LampConfig {
                outlet: outlet.to_string(),
                warmup_secs,
            },
        )
    })
    .collect()
}

fn default_bundle_colors() -> Vec<String> {
    [
        "red1", "red2", "red3", "red4", "red5", "red6", "red7", "red8", "orange", "yellow",
        "green", "blue", "purple", "pink", "white", "gray", "black",
    ]
    .iter()
    .map(|c| c.to_string())
    .collect()
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

impl Default for FilterWheelConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            host: default_filterwheel_host(),
            port: default_filterwheel_port(),
            connect_timeout_ms: default_connect_timeout(),
            read_timeout_ms: default_read_timeout(),
            move_time_limit_secs: default_move_limit(),
            calibration_select_secs: default_calib_select(),
            calibration_start_secs: default_calib_start(),
            calibration_done_secs: default_calib_done(),
            adc_zero_secs: default_adc_zero(),
            max_iterations: default_max_iterations(),
            linewheel: default_linewheel(),
            qthwheel: default_qthwheel(),
        }
    }
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            host: default_pdu_host(),
            port: default_pdu_port(),
            connect_timeout_ms: default_connect_timeout(),
            command_timeout_ms: default_pdu_command_timeout(),
            switch_on_timeout_ms: default_switch_on_timeout(),
            switch_off_timeout_ms: default_switch_off_timeout(),
            poll_interval_ms: default_poll_interval(),
            max_iterations: default_pdu_max_iterations(),
            lamps: default_lamps(),
        }
    }
}

impl Default for CollimatorConfig {
    fn default() -> Self {
        Self {
            bundle_colors: default_bundle_colors(),
        }
    }
}

impl FilterWheelConfig {
    /// Settings of one wheel.
    pub fn wheel(&self, wheel: Wheel) -> &WheelConfig {
        match wheel {
            Wheel::Linewheel => &self.linewheel,
            Wheel::Qthwheel => &self.qthwheel,
        }
    }

    /// [`Self::read_timeout_ms`] as a duration.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Connection timeout as a duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl SourcesConfig {
    /// Connection timeout as a duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// [`Self::command_timeout_ms`] as a duration.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// [`Self::poll_interval_ms`] as a duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// [`Self::switch_on_timeout_ms`] as a duration.
    pub fn switch_on_timeout(&self) -> Duration {
        Duration::from_millis(self.switch_on_timeout_ms)
    }

    /// [`Self::switch_off_timeout_ms`] as a duration.
    pub fn switch_off_timeout(&self) -> Duration {
        Duration::from_millis(self.switch_off_timeout_ms)
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl DcbConfig {
    /// Load configuration from `config/dcb.toml` and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config/dcb.toml")
    }

    /// Load configuration from a specific file path
    ///
    /// Missing keys fall back to their defaults; a missing file yields the
    /// default simulation configuration. The result is validated.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file is malformed or validation fails.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(DcbConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("DCB_").split("__"))
            .extract()
            .map_err(|e| ConfigError::LoadError(Box::new(e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Each wheel has at least one hole and unique hole labels
    /// - The two wheels report different controller ports
    /// - Lamps exist, have non-negative warm-up and unique outlets
    /// - Bundle colors are unique and do not shadow "none"
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        for wheel in Wheel::ALL {
            let wheel_config = self.filterwheel.wheel(wheel);
            if wheel_config.holes.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "{wheel}: 'holes' cannot be empty"
                )));
            }
            let mut labels = HashSet::new();
            for hole in &wheel_config.holes {
                if !labels.insert(hole) {
                    return Err(ConfigError::ValidationError(format!(
                        "{wheel}: duplicate hole label '{hole}'"
                    )));
                }
            }
        }

        if self.filterwheel.linewheel.fw_port == self.filterwheel.qthwheel.fw_port {
            return Err(ConfigError::ValidationError(format!(
                "linewheel and qthwheel share fw_port {}",
                self.filterwheel.linewheel.fw_port
            )));
        }

        if self.filterwheel.max_iterations == 0 || self.sources.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "'max_iterations' must be > 0".to_string(),
            ));
        }

        if self.sources.lamps.is_empty() {
            return Err(ConfigError::ValidationError(
                "sources: at least one lamp must be declared".to_string(),
            ));
        }

        let mut outlets = HashSet::new();
        for (name, lamp) in &self.sources.lamps {
            if lamp.outlet.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "lamp '{name}': 'outlet' cannot be empty"
                )));
            }
            if !outlets.insert(&lamp.outlet) {
                return Err(ConfigError::ValidationError(format!(
                    "lamp '{name}': outlet {} already in use",
                    lamp.outlet
                )));
            }
            if !lamp.warmup_secs.is_finite() || lamp.warmup_secs < 0.0 {
                return Err(ConfigError::ValidationError(format!(
                    "lamp '{name}': 'warmup_secs' must be a non-negative number"
                )));
            }
        }

        let mut colors = HashSet::new();
        for color in &self.collimators.bundle_colors {
            if color == "none" || !colors.insert(color) {
                return Err(ConfigError::ValidationError(format!(
                    "invalid or duplicate bundle color '{color}'"
                )));
            }
        }

        Ok(())
    }

    /// Lamp names in configuration order
    pub fn lamp_names(&self) -> Vec<&str> {
        self.sources.lamps.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = DcbConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.filterwheel.mode, Mode::Simulation);
        assert_eq!(config.sources.lamps["halogen"].warmup_secs, 60.0);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = DcbConfig::default();
        config.application.log_level = "loud".to_string();

        let result = config.validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid log_level"));
    }

    #[test]
    fn test_duplicate_outlet() {
        let mut config = DcbConfig::default();
        config.sources.lamps.insert(
            "xenon".to_string(),
            LampConfig {
                outlet: "01".to_string(),
                warmup_secs: 0.0,
            },
        );

        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("already in use"));
    }

    #[test]
    fn test_empty_holes_rejected() {
        let mut config = DcbConfig::default();
        config.filterwheel.qthwheel.holes.clear();

        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("qthwheel"));
    }

    #[test]
    fn test_shared_fw_port_rejected() {
        let mut config = DcbConfig::default();
        config.filterwheel.qthwheel.fw_port = config.filterwheel.linewheel.fw_port;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_shipped_config_is_complete() {
        let text = std::fs::read_to_string(
            Path::new(env!("CARGO_MANIFEST_DIR")).join("config/dcb.toml"),
        )
        .unwrap();
        // Plain TOML, no figment layering or environment overrides.
        let config: DcbConfig = toml::from_str(&text).unwrap();
        config.validate().unwrap();
        assert_eq!(config.sources.lamps.len(), 5);
        assert!(config.collimators.bundle_colors.contains(&"red1".to_string()));
    }

    #[test]
    fn test_load_from_file_merges_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
log_level = "debug"

[filterwheel]
mode = "operation"
host = "10.0.0.5"
port = 9001

[filterwheel.linewheel]
fw_port = 0
holes = ["none", "a", "b"]

[sources.lamps.neon]
outlet = "07"
warmup_secs = 20.0
"#
        )
        .unwrap();

        let config = DcbConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.filterwheel.mode, Mode::Operation);
        assert_eq!(config.filterwheel.port, 9001);
        assert_eq!(config.filterwheel.linewheel.holes.len(), 3);
        assert_eq!(config.filterwheel.qthwheel, default_qthwheel());
        assert_eq!(config.sources.lamps["neon"].outlet, "07");
        assert_eq!(config.sources.mode, Mode::Simulation);
    }
}
