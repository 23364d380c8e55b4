//! Configuration management for Zerofeed
//!
//! This module handles loading, validation, and management of the application
//! configuration from YAML files. Per-iteration tunables are served through
//! the [`provider::ConfigProvider`] trait so they can be hot-reloaded.

use crate::error::{Result, ZeroFeedError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

mod defaults;
pub mod provider;

pub use provider::{ConfigProvider, FileConfigProvider, InverterTunables, StaticConfigProvider, Tunables};

/// Environment variable naming an explicit configuration file
pub const CONFIG_ENV_VAR: &str = "ZEROFEED_CONFIG";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Control loop timing and damping parameters
    pub control: ControlConfig,

    /// Grid set-point band (hot-reloadable)
    pub setpoint: SetpointConfig,

    /// Inverters in control order
    pub inverters: Vec<InverterConfig>,

    /// Grid power meter (positive = import)
    pub powermeter: PowermeterConfig,

    /// Optional meter measuring the inverters' combined output
    pub intermediate_meter: Option<PowermeterConfig>,

    /// Inverter gateway
    pub dtu: DtuConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// State publication
    pub telemetry: TelemetryConfig,
}

/// Control loop parameters, read once at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Length of one outer control iteration
    pub loop_interval_seconds: u64,

    /// Grid meter polling interval inside an iteration
    pub poll_interval_seconds: u64,

    /// How long to wait for a limit acknowledgment
    pub set_limit_timeout_seconds: u64,

    /// Settle delay after switching an inverter on or off
    pub set_power_status_delay_seconds: u64,

    /// Allowed headroom of the aggregate limit above live production, in
    /// percent of total capacity. 100 disables cut-to-production.
    pub max_difference_between_limit_and_output_power_percent: i64,

    /// Identical power commands in a row before further ones are suppressed.
    /// 0 disables suppression.
    pub set_power_status_count: u32,

    /// Step size (percent of capacity) above which a decrease is damped
    pub slow_approx_limit_percent: i64,

    /// Damping factor applied to large decreases, in percent
    pub slow_approx_factor_percent: i64,

    /// Read and log inverter temperatures every iteration
    pub log_temperature: bool,

    /// Drive all inverters to their minimum when the grid meter fails
    pub set_inverter_to_min_on_powermeter_error: bool,

    /// Extra attempts for a failed meter or DTU request
    pub max_retries: u32,

    /// Exponential backoff base between retries, in seconds
    pub retry_backoff_factor: f64,

    /// HTTP statuses that are retried; other error statuses fail at once
    pub retry_status_codes: Vec<u16>,
}

/// Grid set-point band
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SetpointConfig {
    /// Desired grid power in watts
    pub target_point: i64,

    /// Dead band around the target
    pub tolerance: i64,

    /// Above this grid import the loop reacts immediately
    pub max_point: i64,

    /// Below this grid import the loop may react immediately
    pub min_point: i64,

    /// Jump straight to this share of rated capacity on heavy import (0 = off)
    pub jump_to_limit_percent: i64,

    /// React immediately when grid power drops below `min_point`
    pub fast_limit_decrease: bool,
}

/// Per-inverter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InverterConfig {
    /// Serial number; looked up from the DTU when empty
    pub serial_number: String,

    /// Whether this inverter takes part in control
    pub enabled: bool,

    /// Configured maximum output in watts (initial derating ceiling)
    pub max_watt: i64,

    /// Physical rating in watts; defaults to `max_watt`
    pub inverter_watt: Option<i64>,

    /// Minimum limit as a percentage of the physical rating
    pub min_watt_percent: i64,

    /// Multiplier correcting a systematic device-side deviation
    pub compensate_watt_factor: f64,

    /// Inverter is fed by a battery and guarded by panel voltage
    pub battery_mode: bool,

    /// Battery priority tier, 1 is served first
    pub battery_priority: u8,

    /// At or below this averaged voltage the inverter is switched off
    pub battery_threshold_off_v: f64,

    /// At or below this voltage the ceiling drops to the reduced wattage
    pub battery_threshold_reduce_v: f64,

    /// At or above this voltage the ceiling returns to the normal wattage
    pub battery_threshold_normal_v: f64,

    /// At or above this voltage a switched-off inverter is switched on again
    pub battery_threshold_on_v: f64,

    /// DC input indices excluded from the panel voltage minimum
    pub battery_ignore_panels: Vec<usize>,

    /// Number of readings averaged for the panel voltage
    pub battery_average_count: usize,

    /// Ceiling used with a healthy battery; defaults to `max_watt`
    pub battery_normal_watt: Option<i64>,

    /// Ceiling used with a weak battery; defaults to half of `max_watt`
    pub battery_reduce_watt: Option<i64>,
}

/// Holding register layout of a Modbus meter value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeterRegisterType {
    Int16,
    Uint16,
    Int32,
}

/// Power meter selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PowermeterConfig {
    /// Meter exposing watts in holding registers
    ModbusTcp {
        ip: String,
        #[serde(default = "defaults::modbus_port")]
        port: u16,
        #[serde(default = "defaults::modbus_unit_id")]
        unit_id: u8,
        register: u16,
        #[serde(default = "defaults::register_type")]
        register_type: MeterRegisterType,
        #[serde(default = "defaults::register_scale")]
        register_scale: f64,
    },
    /// Meter exposing a JSON document over HTTP
    HttpJson {
        url: String,
        #[serde(default)]
        user: Option<String>,
        #[serde(default)]
        password: Option<String>,
        /// JSON pointer to a signed power value
        #[serde(default)]
        power_pointer: Option<String>,
        /// JSON pointers to separate import/export values (import - export)
        #[serde(default)]
        import_pointer: Option<String>,
        #[serde(default)]
        export_pointer: Option<String>,
    },
    /// In-memory plant for dry runs
    Simulated {
        #[serde(default = "defaults::simulated_house_load")]
        house_load_w: i64,
    },
}

/// Inverter gateway selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DtuConfig {
    /// OpenDTU REST API
    OpenDtu {
        ip: String,
        #[serde(default = "defaults::opendtu_user")]
        user: String,
        #[serde(default)]
        password: String,
    },
    /// AhoyDTU REST API; the password is only needed for protected setups
    Ahoy {
        ip: String,
        #[serde(default)]
        password: String,
    },
    /// In-memory plant for dry runs
    Simulated {
        #[serde(default = "defaults::simulated_solar")]
        solar_available_w: i64,
        #[serde(default = "defaults::simulated_panel_voltage")]
        panel_voltage_v: f64,
    },
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    pub level: String,

    /// Log file path or directory; empty disables file logging
    pub file: String,

    /// Number of rotated files to keep
    pub backup_count: u32,

    /// Whether to log to console
    pub console_output: bool,

    /// Whether to use JSON format
    pub json_format: bool,
}

/// State publication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Publish controller state on the broadcast channel
    pub enabled: bool,

    /// Buffered messages per subscriber
    pub channel_capacity: usize,
}

impl InverterConfig {
    /// Physical rating in watts
    pub fn rated_watt(&self) -> i64 {
        self.inverter_watt.unwrap_or(self.max_watt)
    }

    /// Ceiling with a healthy battery
    pub fn normal_watt(&self) -> i64 {
        self.battery_normal_watt.unwrap_or(self.max_watt)
    }

    /// Ceiling with a weak battery
    pub fn reduce_watt(&self) -> i64 {
        self.battery_reduce_watt.unwrap_or(self.max_watt / 2)
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Resolve which configuration file to use: explicit path, then the
    /// environment, then the default locations.
    pub fn locate(explicit: Option<&str>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR)
            && !path.is_empty()
        {
            return Some(PathBuf::from(path));
        }

        let default_paths = [
            "zerofeed.yaml",
            "/data/zerofeed.yaml",
            "/etc/zerofeed/config.yaml",
        ];
        default_paths
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
    }

    /// Load configuration, falling back to defaults when no file exists
    pub fn load(explicit: Option<&str>) -> Result<(Self, Option<PathBuf>)> {
        match Self::locate(explicit) {
            Some(path) => {
                let config = Self::from_file(&path)?;
                Ok((config, Some(path)))
            }
            None => Ok((Config::default(), None)),
        }
    }

    /// Save configuration to a YAML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.control.loop_interval_seconds == 0 {
            return Err(ZeroFeedError::validation(
                "control.loop_interval_seconds",
                "Must be greater than 0",
            ));
        }

        if self.control.poll_interval_seconds == 0 {
            return Err(ZeroFeedError::validation(
                "control.poll_interval_seconds",
                "Must be greater than 0",
            ));
        }

        if self.control.poll_interval_seconds > self.control.loop_interval_seconds {
            return Err(ZeroFeedError::validation(
                "control.poll_interval_seconds",
                "Must not exceed loop_interval_seconds",
            ));
        }

        if !(0..=100).contains(&self.control.max_difference_between_limit_and_output_power_percent)
        {
            return Err(ZeroFeedError::validation(
                "control.max_difference_between_limit_and_output_power_percent",
                "Must be between 0 and 100",
            ));
        }

        if !(self.control.retry_backoff_factor >= 0.0
            && self.control.retry_backoff_factor.is_finite())
        {
            return Err(ZeroFeedError::validation(
                "control.retry_backoff_factor",
                "Must be a non-negative number",
            ));
        }

        if !(0..=100).contains(&self.setpoint.jump_to_limit_percent) {
            return Err(ZeroFeedError::validation(
                "setpoint.jump_to_limit_percent",
                "Must be between 0 and 100",
            ));
        }

        if self.inverters.is_empty() {
            return Err(ZeroFeedError::validation(
                "inverters",
                "At least one inverter must be configured",
            ));
        }

        for (idx, inv) in self.inverters.iter().enumerate() {
            inv.validate(idx)?;
        }

        Ok(())
    }
}

impl InverterConfig {
    fn validate(&self, idx: usize) -> Result<()> {
        let field = |name: &str| format!("inverters[{}].{}", idx, name);

        if self.max_watt <= 0 {
            return Err(ZeroFeedError::validation(field("max_watt"), "Must be positive".into()));
        }
        if self.rated_watt() <= 0 {
            return Err(ZeroFeedError::validation(
                field("inverter_watt"),
                "Must be positive".into(),
            ));
        }
        if !(0..=100).contains(&self.min_watt_percent) {
            return Err(ZeroFeedError::validation(
                field("min_watt_percent"),
                "Must be between 0 and 100".into(),
            ));
        }
        if !(self.compensate_watt_factor > 0.0 && self.compensate_watt_factor.is_finite()) {
            return Err(ZeroFeedError::validation(
                field("compensate_watt_factor"),
                "Must be a positive number".into(),
            ));
        }
        if !(1..=5).contains(&self.battery_priority) {
            return Err(ZeroFeedError::validation(
                field("battery_priority"),
                "Must be between 1 and 5".into(),
            ));
        }
        if self.battery_average_count == 0 {
            return Err(ZeroFeedError::validation(
                field("battery_average_count"),
                "Must be at least 1".into(),
            ));
        }
        if self.battery_mode {
            if !(self.battery_threshold_off_v < self.battery_threshold_reduce_v
                && self.battery_threshold_reduce_v < self.battery_threshold_normal_v)
            {
                return Err(ZeroFeedError::validation(
                    field("battery_threshold_*"),
                    "Thresholds must satisfy off < reduce < normal".into(),
                ));
            }
            if self.battery_threshold_on_v <= self.battery_threshold_off_v {
                return Err(ZeroFeedError::validation(
                    field("battery_threshold_on_v"),
                    "Must be above the off threshold".into(),
                ));
            }
            if self.normal_watt() <= 0 || self.reduce_watt() <= 0 {
                return Err(ZeroFeedError::validation(
                    field("battery_normal_watt"),
                    "Battery ceilings must be positive".into(),
                ));
            }
        }
        Ok(())
    }
}
