//! Time-source reconciliation
//!
//! The controller runs on a board with a battery-backed RTC that falls
//! behind system time when its coin cell dies, and a host clock that is only
//! trustworthy once NTP has synchronized. [`ClockSource`] decides which
//! source is authoritative at startup, supplies "now" to everything else,
//! and writes the RTC back from NTP-valid system time when drift warrants it.

use crate::config::ClockConfig;
use crate::error::{GalvaniError, Result};
use crate::logging::get_logger;
use chrono::{DateTime, Duration, Utc};

/// Which underlying time source is authoritative
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeAuthority {
    Rtc,
    System,
}

/// Snapshot of the clock reconciliation state
#[derive(Debug, Clone, Copy)]
pub struct ClockState {
    pub source: TimeAuthority,
    pub valid: bool,
    pub lag: Duration,
}

/// Host wall clock. A seam so tests can run against a scripted clock.
pub trait WallClock: Send + Sync {
    fn sys_now(&self) -> DateTime<Utc>;
}

/// Real-time clock device
#[async_trait::async_trait]
pub trait RtcDevice: Send + Sync {
    async fn read(&self) -> Result<DateTime<Utc>>;
    async fn write(&mut self, time: DateTime<Utc>) -> Result<()>;
}

/// OS network-time synchronization status
#[async_trait::async_trait]
pub trait NtpSync: Send + Sync {
    async fn is_synced(&self) -> Result<bool>;
}

/// Wall clock backed by the host system time
pub struct SystemWallClock;

impl WallClock for SystemWallClock {
    fn sys_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// RTC device driven through `hwclock`
pub struct HwclockRtc {
    logger: crate::logging::StructuredLogger,
}

impl HwclockRtc {
    pub fn new() -> Self {
        Self {
            logger: get_logger("rtc"),
        }
    }
}

impl Default for HwclockRtc {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl RtcDevice for HwclockRtc {
    async fn read(&self) -> Result<DateTime<Utc>> {
        let output = tokio::process::Command::new("/sbin/hwclock")
            .args(["--get", "--utc"])
            .output()
            .await
            .map_err(|e| GalvaniError::hardware(format!("hwclock read failed: {}", e)))?;
        if !output.status.success() {
            return Err(GalvaniError::hardware(format!(
                "hwclock read exited with {}",
                output.status
            )));
        }
        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let parsed = DateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S%.f%z")
            .or_else(|_| DateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S%.f%:z"))
            .map_err(|e| {
                GalvaniError::hardware(format!("unparseable hwclock output '{}': {}", text, e))
            })?;
        Ok(parsed.with_timezone(&Utc))
    }

    async fn write(&mut self, time: DateTime<Utc>) -> Result<()> {
        let stamp = time.format("%Y-%m-%d %H:%M:%S").to_string();
        self.logger.debug(&format!("Writing RTC: {}", stamp));
        let status = tokio::process::Command::new("/sbin/hwclock")
            .args(["--set", "--utc", "--date", &stamp])
            .status()
            .await
            .map_err(|e| GalvaniError::hardware(format!("hwclock write failed: {}", e)))?;
        if !status.success() {
            return Err(GalvaniError::hardware(format!(
                "hwclock write exited with {}",
                status
            )));
        }
        Ok(())
    }
}

/// NTP sync status via `timedatectl`
pub struct TimedatectlNtp;

#[async_trait::async_trait]
impl NtpSync for TimedatectlNtp {
    async fn is_synced(&self) -> Result<bool> {
        let output = tokio::process::Command::new("/usr/bin/timedatectl")
            .args(["show", "--property=NTPSynchronized", "--value"])
            .output()
            .await
            .map_err(|e| GalvaniError::hardware(format!("timedatectl failed: {}", e)))?;
        Ok(String::from_utf8_lossy(&output.stdout).trim() == "yes")
    }
}

/// Reconciled clock. Owns the decision of which time source is authoritative.
pub struct ClockSource {
    config: ClockConfig,
    wall: Box<dyn WallClock>,
    rtc: Box<dyn RtcDevice>,
    ntp: Box<dyn NtpSync>,
    source: TimeAuthority,
    time_valid: bool,
    /// RTC minus system time, captured at reconciliation. Applied to the
    /// wall clock when the RTC is authoritative, so `now()` stays cheap
    /// instead of shelling out to the device every tick.
    rtc_offset: Duration,
    lag: Duration,
    logger: crate::logging::StructuredLogger,
}

impl ClockSource {
    pub fn new(
        config: ClockConfig,
        wall: Box<dyn WallClock>,
        rtc: Box<dyn RtcDevice>,
        ntp: Box<dyn NtpSync>,
    ) -> Self {
        Self {
            config,
            wall,
            rtc,
            ntp,
            source: TimeAuthority::System,
            time_valid: false,
            rtc_offset: Duration::zero(),
            lag: Duration::zero(),
            logger: get_logger("clock"),
        }
    }

    /// Clock over the real host devices
    pub fn system_default(config: ClockConfig) -> Self {
        Self::new(
            config,
            Box::new(SystemWallClock),
            Box::new(HwclockRtc::new()),
            Box::new(TimedatectlNtp),
        )
    }

    /// Current time from the authoritative source
    pub fn now(&self) -> DateTime<Utc> {
        match self.source {
            TimeAuthority::Rtc => self.wall.sys_now() + self.rtc_offset,
            TimeAuthority::System => self.wall.sys_now(),
        }
    }

    /// Whether `now()` is trustworthy for absolute date-stamping. Relative
    /// durations (timers) remain usable either way.
    pub fn is_time_valid(&self) -> bool {
        self.time_valid
    }

    pub fn state(&self) -> ClockState {
        ClockState {
            source: self.source,
            valid: self.time_valid,
            lag: self.lag,
        }
    }

    /// Compare RTC against system time and pick the authoritative source.
    ///
    /// An RTC within the lag threshold is used as-is, with no network wait;
    /// that is what allows operation without connectivity. An RTC lagging
    /// beyond the threshold (dead coin cell) falls back to system time and
    /// enters a bounded wait for NTP synchronization.
    pub async fn reconcile_at_startup(&mut self) -> Result<()> {
        let sys_now = self.wall.sys_now();
        match self.rtc.read().await {
            Ok(rtc_now) => {
                self.lag = sys_now - rtc_now;
                self.logger.debug(&format!(
                    "Startup time compare: rtc={} sys={}",
                    rtc_now.format("%Y-%m-%dT%H:%M:%S"),
                    sys_now.format("%Y-%m-%dT%H:%M:%S")
                ));
                if self.lag > Duration::seconds(self.config.rtc_lag_threshold_sec as i64) {
                    self.logger.error(&format!(
                        "RTC behind system time by {}s, over {}s threshold; falling back to system time",
                        self.lag.num_seconds(),
                        self.config.rtc_lag_threshold_sec
                    ));
                    self.source = TimeAuthority::System;
                    self.time_valid = false;
                    self.wait_for_ntp().await;
                } else {
                    self.source = TimeAuthority::Rtc;
                    self.rtc_offset = rtc_now - sys_now;
                    self.time_valid = true;
                    self.logger.info("Using RTC time");
                }
                Ok(())
            }
            Err(e) => {
                self.logger
                    .warn(&format!("RTC unreadable ({}); using system time", e));
                self.source = TimeAuthority::System;
                self.time_valid = false;
                self.wait_for_ntp().await;
                Ok(())
            }
        }
    }

    /// Poll the OS NTP-sync status at a fixed cadence up to the configured
    /// timeout. On success, time becomes valid; on timeout, time stays
    /// usable for relative durations but flagged invalid for date-stamping.
    async fn wait_for_ntp(&mut self) {
        self.logger
            .debug("Checking whether system time is synchronized to NTP...");
        let poll = self.config.ntp_poll_interval_sec.max(1);
        let attempts = (self.config.ntp_wait_timeout_sec / poll).max(1);
        for _ in 0..attempts {
            match self.ntp.is_synced().await {
                Ok(true) => {
                    self.time_valid = true;
                    self.logger.info("System time synchronized via NTP");
                    return;
                }
                Ok(false) => {}
                Err(e) => {
                    self.logger
                        .warn(&format!("NTP status check failed: {}", e));
                }
            }
            tokio::time::sleep(std::time::Duration::from_secs(poll)).await;
        }
        self.logger
            .warn("System time not synchronized since last power loss; timestamps flagged invalid");
    }

    /// Write the RTC from NTP-valid system time, but only when drift is at
    /// least the configured minimum. Never marks time valid by itself.
    pub async fn maybe_resync_rtc(&mut self) -> Result<()> {
        if !self.ntp.is_synced().await.unwrap_or(false) {
            self.logger
                .debug("Not updating RTC: system time not NTP-synchronized");
            return Ok(());
        }
        let sys_now = self.wall.sys_now();
        let rtc_now = self.rtc.read().await?;
        let drift = sys_now - rtc_now;
        let min_drift = Duration::seconds(self.config.rtc_resync_min_drift_sec as i64);
        if drift >= min_drift || drift <= -min_drift {
            self.rtc.write(sys_now).await?;
            self.logger.debug(&format!(
                "Updated RTC ({} -> {}) from NTP-synchronized system time",
                rtc_now.format("%Y-%m-%dT%H:%M:%S"),
                sys_now.format("%Y-%m-%dT%H:%M:%S")
            ));
        } else {
            self.logger.debug("No RTC update needed");
        }
        Ok(())
    }
}
