//! Configuration management for Galvani
//!
//! This module handles loading, validation, and management of the controller
//! configuration from YAML files. Every numeric threshold, debounce duration
//! and pin/relay channel assignment lives here; nothing is hard-coded at the
//! point of use.

use crate::error::{GalvaniError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_true() -> bool {
    true
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Hardware channel assignments and backend selection
    pub hardware: HardwareConfig,

    /// Voltage thresholds and shunt scaling
    pub thresholds: ThresholdsConfig,

    /// Debounce, settle and grace-period durations
    pub timers: TimersConfig,

    /// RTC / NTP reconciliation parameters
    pub clock: ClockConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Persistent data-row logging configuration
    pub datalog: DatalogConfig,

    /// OS shutdown / process restart parameters
    pub power: PowerConfig,

    /// Polling interval in milliseconds
    pub poll_interval_ms: u64,

    /// Emit an INFO status block every this many ticks (0 disables)
    pub status_every_ticks: u64,

    /// Re-run the wiring fault detector every this many ticks (0 disables)
    pub wiring_check_every_ticks: u64,
}

/// Hardware backend and channel assignments
///
/// Channels are board positions (0..=7). The typed line identifiers in
/// `crate::hal` are the only thing the rest of the code sees; a real GPIO
/// backend translates them through this table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    /// Port backend: "sim" for the built-in simulated port. Real GPIO
    /// backends plug in through the `HardwarePort` trait.
    pub backend: String,

    /// Digital input channel carrying the ECU engine-run (W) signal
    pub input_engine_run: u8,

    /// Digital input channel for key ACC-detect
    pub input_key_acc: u8,

    /// Digital input channel for key ON-detect
    pub input_key_on: u8,

    /// Digital input channel for the enable switch
    pub input_enable_switch: u8,

    /// Analog channel on the low side of the current-sense shunt
    pub analog_shunt_low: u8,

    /// Analog channel on the high side of the current-sense shunt
    pub analog_shunt_high: u8,

    /// Analog channel on the charger output side
    pub analog_charger_output: u8,

    /// Relay closing the charge path
    pub relay_charge_enable: u8,

    /// Relay selecting charge direction
    pub relay_charge_direction: u8,

    /// Relay keeping the enable-switch sense circuit powered with the key off
    pub relay_keepalive: u8,
}

/// Voltage thresholds and shunt scaling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdsConfig {
    /// Main voltage at or above this implies the alternator is producing
    pub alternator_output_v_min: f64,

    /// Starter battery considered low below this
    pub main_v_min: f64,

    /// Starter battery must never be charged above this
    pub main_v_max: f64,

    /// Starter battery considered charged at or above this
    pub main_v_charged: f64,

    /// Aux battery floor while the key is in ACC/ON
    pub aux_v_min: f64,

    /// Aux battery floor while the key is off (more conservative)
    pub aux_v_min_key_off: f64,

    /// Aux battery considered full at or above this
    pub aux_v_max: f64,

    /// Readings below this indicate broken or disconnected sensing
    pub plausible_v_floor: f64,

    /// Minimum believable charge current while the charger is enabled
    pub min_charge_current_a: f64,

    /// Shunt scaling: amps per volt of differential (20 A / 0.075 V)
    pub shunt_amps_per_volt: f64,
}

/// Debounce, settle and grace-period durations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimersConfig {
    /// Grace period after the enable switch opens before the OS shuts down
    pub shutdown_delay_sec: u64,

    /// Default hold-off after any tracked signal changes before charge mode
    /// is re-evaluated
    pub charge_delay_sec: u64,

    /// Shorter hold-off used for key-off transitions
    pub charge_delay_key_off_sec: u64,

    /// Long re-check delay armed instead of toggling relays when the aux
    /// battery is already full
    pub aux_full_recheck_sec: u64,

    /// Wait after a charge-relay transition before voltage readings are
    /// trusted as settled
    pub stabilization_sec: u64,

    /// Settle wait after moving the charge-enable relay
    pub relay_settle_ms: u64,

    /// Settle wait after moving the charge-direction relay
    pub direction_settle_ms: u64,

    /// Propagation wait after closing the keepalive relay before re-reading
    /// the enable switch
    pub keepalive_propagation_ms: u64,

    /// Bounded retries for an indeterminate enable-switch read
    pub enable_switch_retries: u32,
}

/// RTC / NTP reconciliation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    /// RTC lag beyond this marks the RTC untrustworthy at startup
    pub rtc_lag_threshold_sec: u64,

    /// Upper bound on the startup wait for NTP synchronization
    pub ntp_wait_timeout_sec: u64,

    /// Poll cadence while waiting for NTP
    pub ntp_poll_interval_sec: u64,

    /// Only write the RTC back when drift is at least this large
    pub rtc_resync_min_drift_sec: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    pub level: String,

    /// Optional console-specific level override
    pub console_level: Option<String>,

    /// Optional file-specific level override
    pub file_level: Option<String>,

    /// Path to log file (or directory for the rolling appender)
    pub file: String,

    /// Number of rotated files to keep
    pub backup_count: u32,

    /// Whether to log to console
    pub console_output: bool,

    /// Whether to use JSON format
    pub json_format: bool,
}

/// Persistent data-row logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatalogConfig {
    /// Whether per-tick rows are written at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Directory holding the JSONL tables
    pub dir: String,
}

/// OS shutdown / process restart parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerConfig {
    /// Pause before invoking the OS shutdown, so an operator can SSH in and
    /// stop a boot loop
    pub shutdown_pre_delay_sec: u64,

    /// Backoff between control-loop restarts after a transient fault
    pub restart_backoff_sec: u64,

    /// Bounded number of restarts before giving up
    pub max_restart_attempts: u32,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            backend: "sim".to_string(),
            input_engine_run: 0,
            input_key_acc: 1,
            input_key_on: 3,
            input_enable_switch: 2,
            analog_shunt_low: 0,
            analog_shunt_high: 1,
            analog_charger_output: 2,
            relay_charge_enable: 0,
            relay_charge_direction: 1,
            relay_keepalive: 2,
        }
    }
}

impl Default for ThresholdsConfig {
    fn default() -> Self {
        Self {
            alternator_output_v_min: 13.2,
            main_v_min: 11.8,
            main_v_max: 14.8,
            main_v_charged: 12.6,
            aux_v_min: 12.0,
            aux_v_min_key_off: 12.8,
            aux_v_max: 14.4,
            plausible_v_floor: 5.0,
            min_charge_current_a: 1.0,
            shunt_amps_per_volt: 20.0 / 0.075,
        }
    }
}

impl Default for TimersConfig {
    fn default() -> Self {
        Self {
            shutdown_delay_sec: 60,
            charge_delay_sec: 30,
            charge_delay_key_off_sec: 15,
            aux_full_recheck_sec: 600,
            stabilization_sec: 15,
            relay_settle_ms: 500,
            direction_settle_ms: 200,
            keepalive_propagation_ms: 200,
            enable_switch_retries: 3,
        }
    }
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            rtc_lag_threshold_sec: 5,
            ntp_wait_timeout_sec: 120,
            ntp_poll_interval_sec: 2,
            rtc_resync_min_drift_sec: 1,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            console_level: None,
            file_level: None,
            file: "/var/log/galvani/galvani.log".to_string(),
            backup_count: 14,
            console_output: true,
            json_format: false,
        }
    }
}

impl Default for DatalogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: "/var/log/galvani/data".to_string(),
        }
    }
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            shutdown_pre_delay_sec: 5,
            restart_backoff_sec: 3,
            max_restart_attempts: 5,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hardware: HardwareConfig::default(),
            thresholds: ThresholdsConfig::default(),
            timers: TimersConfig::default(),
            clock: ClockConfig::default(),
            logging: LoggingConfig::default(),
            datalog: DatalogConfig::default(),
            power: PowerConfig::default(),
            poll_interval_ms: 1000,
            status_every_ticks: 60,
            wiring_check_every_ticks: 60,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default search paths
    pub fn load() -> Result<Self> {
        let default_paths = [
            "galvani.yaml",
            "/data/galvani.yaml",
            "/etc/galvani/config.yaml",
        ];

        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::from_file(path);
            }
        }

        // Fall back to default configuration
        Ok(Config::default())
    }

    /// Save configuration to a YAML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Validate the configuration
    ///
    /// Channel assignments are checked here so an invalid identifier can
    /// never reach the hardware layer.
    pub fn validate(&self) -> Result<()> {
        const CHANNEL_MAX: u8 = 7;

        let inputs = [
            ("hardware.input_engine_run", self.hardware.input_engine_run),
            ("hardware.input_key_acc", self.hardware.input_key_acc),
            ("hardware.input_key_on", self.hardware.input_key_on),
            (
                "hardware.input_enable_switch",
                self.hardware.input_enable_switch,
            ),
        ];
        let analogs = [
            ("hardware.analog_shunt_low", self.hardware.analog_shunt_low),
            (
                "hardware.analog_shunt_high",
                self.hardware.analog_shunt_high,
            ),
            (
                "hardware.analog_charger_output",
                self.hardware.analog_charger_output,
            ),
        ];
        let relays = [
            (
                "hardware.relay_charge_enable",
                self.hardware.relay_charge_enable,
            ),
            (
                "hardware.relay_charge_direction",
                self.hardware.relay_charge_direction,
            ),
            ("hardware.relay_keepalive", self.hardware.relay_keepalive),
        ];

        for class in [&inputs[..], &analogs[..], &relays[..]] {
            for (field, channel) in class {
                if *channel > CHANNEL_MAX {
                    return Err(GalvaniError::validation(
                        *field,
                        "channel out of range (0..=7)",
                    ));
                }
            }
            for (i, (field, channel)) in class.iter().enumerate() {
                if class[..i].iter().any(|(_, other)| other == channel) {
                    return Err(GalvaniError::validation(
                        *field,
                        "channel assigned more than once",
                    ));
                }
            }
        }

        if self.thresholds.main_v_min >= self.thresholds.main_v_max {
            return Err(GalvaniError::validation(
                "thresholds.main_v_min",
                "must be below main_v_max",
            ));
        }

        if self.thresholds.aux_v_min > self.thresholds.aux_v_min_key_off {
            return Err(GalvaniError::validation(
                "thresholds.aux_v_min_key_off",
                "key-off floor must be at least the key-on floor",
            ));
        }

        if self.thresholds.aux_v_min_key_off >= self.thresholds.aux_v_max {
            return Err(GalvaniError::validation(
                "thresholds.aux_v_min_key_off",
                "must be below aux_v_max",
            ));
        }

        if self.thresholds.shunt_amps_per_volt <= 0.0 {
            return Err(GalvaniError::validation(
                "thresholds.shunt_amps_per_volt",
                "must be positive",
            ));
        }

        if self.poll_interval_ms == 0 {
            return Err(GalvaniError::validation(
                "poll_interval_ms",
                "must be greater than 0",
            ));
        }

        if self.timers.enable_switch_retries == 0 {
            return Err(GalvaniError::validation(
                "timers.enable_switch_retries",
                "must be at least 1",
            ));
        }

        Ok(())
    }
}
