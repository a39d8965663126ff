//! Persistent per-tick data rows
//!
//! Three append-only JSONL tables (voltages, charging, signals) written once
//! per control-loop tick. These are the post-mortem record of what the
//! controller saw; the structured log records what it decided.

use crate::config::DatalogConfig;
use crate::error::Result;
use crate::logging::get_logger;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

/// One voltages-table row
#[derive(Debug, Clone, Serialize)]
pub struct VoltageRow {
    pub ts: DateTime<Utc>,
    /// False while the clock has neither a trusted RTC nor NTP sync
    pub time_valid: bool,
    pub main_v: f64,
    pub main_annotation: String,
    pub aux_v: f64,
    pub aux_annotation: String,
}

/// One charging-table row
#[derive(Debug, Clone, Serialize)]
pub struct ChargingRow {
    pub ts: DateTime<Utc>,
    pub time_valid: bool,
    pub charging: bool,
    pub direction_to_starter: bool,
    /// Only measurable while the charge path is closed
    pub charge_current_a: Option<f64>,
    pub shunt_high_v: f64,
    pub shunt_low_v: f64,
}

/// One signals-table row
#[derive(Debug, Clone, Serialize)]
pub struct SignalRow {
    pub ts: DateTime<Utc>,
    pub time_valid: bool,
    pub enable_switch: bool,
    pub key_acc: bool,
    pub key_on: bool,
    pub ecu_w: bool,
    pub engine_running: bool,
}

/// Appender over the three JSONL tables. When disabled, every call is a
/// no-op so the control loop does not branch on it.
pub struct DataLogger {
    enabled: bool,
    dir: PathBuf,
    voltages: Option<File>,
    charging: Option<File>,
    signals: Option<File>,
    logger: crate::logging::StructuredLogger,
}

impl DataLogger {
    pub fn new(config: &DatalogConfig) -> Result<Self> {
        let dir = PathBuf::from(&config.dir);
        if config.enabled {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(Self {
            enabled: config.enabled,
            dir,
            voltages: None,
            charging: None,
            signals: None,
            logger: get_logger("datalog"),
        })
    }

    /// A logger that drops every row
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            dir: PathBuf::new(),
            voltages: None,
            charging: None,
            signals: None,
            logger: get_logger("datalog"),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn log_voltages(&mut self, row: &VoltageRow) -> Result<()> {
        self.append("voltages", row)
    }

    pub fn log_charging(&mut self, row: &ChargingRow) -> Result<()> {
        self.append("charging", row)
    }

    pub fn log_signals(&mut self, row: &SignalRow) -> Result<()> {
        self.append("signals", row)
    }

    pub fn flush(&mut self) -> Result<()> {
        for file in [&mut self.voltages, &mut self.charging, &mut self.signals]
            .into_iter()
            .flatten()
        {
            file.flush()?;
        }
        Ok(())
    }

    fn append<R: Serialize>(&mut self, table: &'static str, row: &R) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let line = serde_json::to_string(row)?;
        let file = self.table_file(table)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    fn table_file(&mut self, table: &'static str) -> Result<&mut File> {
        let missing = match table {
            "voltages" => self.voltages.is_none(),
            "charging" => self.charging.is_none(),
            _ => self.signals.is_none(),
        };
        if missing {
            let path = self.dir.join(format!("{}.jsonl", table));
            self.logger
                .debug(&format!("Opening data table {}", path.display()));
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            match table {
                "voltages" => self.voltages = Some(file),
                "charging" => self.charging = Some(file),
                _ => self.signals = Some(file),
            }
        }
        let slot = match table {
            "voltages" => &mut self.voltages,
            "charging" => &mut self.charging,
            _ => &mut self.signals,
        };
        match slot {
            Some(file) => Ok(file),
            None => Err(crate::error::GalvaniError::io("data table unavailable")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn rows_append_as_one_json_object_per_line() {
        let tmp = tempfile::tempdir().unwrap();
        let config = DatalogConfig {
            enabled: true,
            dir: tmp.path().to_string_lossy().into_owned(),
        };
        let mut datalog = DataLogger::new(&config).unwrap();
        for i in 0..3 {
            datalog
                .log_charging(&ChargingRow {
                    ts: ts(),
                    time_valid: true,
                    charging: i % 2 == 0,
                    direction_to_starter: true,
                    charge_current_a: Some(18.5),
                    shunt_high_v: 12.7,
                    shunt_low_v: 12.63,
                })
                .unwrap();
        }
        datalog.flush().unwrap();

        let contents = std::fs::read_to_string(tmp.path().join("charging.jsonl")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["charging"], serde_json::Value::Bool(true));
        assert!((parsed["charge_current_a"].as_f64().unwrap() - 18.5).abs() < 1e-9);
    }

    #[test]
    fn tables_are_separate_files() {
        let tmp = tempfile::tempdir().unwrap();
        let config = DatalogConfig {
            enabled: true,
            dir: tmp.path().to_string_lossy().into_owned(),
        };
        let mut datalog = DataLogger::new(&config).unwrap();
        datalog
            .log_voltages(&VoltageRow {
                ts: ts(),
                time_valid: false,
                main_v: 12.6,
                main_annotation: "normal".into(),
                aux_v: 13.1,
                aux_annotation: "assumed_elevated".into(),
            })
            .unwrap();
        datalog
            .log_signals(&SignalRow {
                ts: ts(),
                time_valid: false,
                enable_switch: true,
                key_acc: false,
                key_on: false,
                ecu_w: false,
                engine_running: false,
            })
            .unwrap();
        datalog.flush().unwrap();

        assert!(tmp.path().join("voltages.jsonl").exists());
        assert!(tmp.path().join("signals.jsonl").exists());
        assert!(!tmp.path().join("charging.jsonl").exists());
    }

    #[test]
    fn disabled_logger_writes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let config = DatalogConfig {
            enabled: false,
            dir: tmp.path().join("never-created").to_string_lossy().into_owned(),
        };
        let mut datalog = DataLogger::new(&config).unwrap();
        datalog
            .log_signals(&SignalRow {
                ts: ts(),
                time_valid: true,
                enable_switch: false,
                key_acc: false,
                key_on: false,
                ecu_w: false,
                engine_running: false,
            })
            .unwrap();
        assert!(!tmp.path().join("never-created").exists());
    }
}
