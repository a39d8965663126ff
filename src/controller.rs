//! Top-level control loop
//!
//! One cooperative polling task: each tick samples the tracked signals,
//! diffs them against the previous tick (edges are handled exactly once,
//! never re-derived from absolute state), consults the timer chain, and
//! routes any relay change through the charge controller. This is also the
//! only place that decides recoverable-versus-fatal and the only component
//! allowed to end the process; every exit path opens all relays first.

use crate::charger::ChargeMode;
use crate::clock::ClockSource;
use crate::config::Config;
use crate::datalog::{ChargingRow, DataLogger, SignalRow, VoltageRow};
use crate::error::{GalvaniError, Result};
use crate::hal::{AnalogLine, HardwarePort, InputLine, SimulatedPort};
use crate::logging::get_logger;
use crate::power::{OsPower, SystemPower};
use crate::timer::DebounceTimer;
use crate::vehicle::{KeyPosition, Vehicle};
use chrono::{DateTime, Duration, Utc};

/// How the control loop ended, when it ended deliberately
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// The shutdown timer chain ran to completion and the OS was halted
    OsShutdown,
    /// SIGTERM/SIGINT observed between ticks
    Terminated,
}

/// Signals diffed between ticks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Snapshot {
    key: KeyPosition,
    engine: bool,
    enable: bool,
}

pub struct Controller {
    config: Config,
    clock: ClockSource,
    vehicle: Vehicle,
    datalog: DataLogger,
    power: Box<dyn SystemPower>,
    shutdown_timer: DebounceTimer,
    charge_delay: DebounceTimer,
    prev: Snapshot,
    /// Latched on a wiring fault; charging stays off until it clears
    voltage_fault: bool,
    ticks: u64,
    logger: crate::logging::StructuredLogger,
}

impl Controller {
    pub fn new(
        config: Config,
        clock: ClockSource,
        vehicle: Vehicle,
        datalog: DataLogger,
        power: Box<dyn SystemPower>,
    ) -> Self {
        Self {
            config,
            clock,
            vehicle,
            datalog,
            power,
            shutdown_timer: DebounceTimer::new("shutdown"),
            charge_delay: DebounceTimer::new("charge-delay"),
            prev: Snapshot {
                key: KeyPosition::Off,
                engine: false,
                enable: false,
            },
            voltage_fault: false,
            ticks: 0,
            logger: get_logger("controller"),
        }
    }

    /// Build a controller from configuration, over the configured backend
    pub fn from_config(config: Config) -> Result<Self> {
        config.validate()?;
        let port: Box<dyn HardwarePort> = match config.hardware.backend.as_str() {
            "sim" => Box::new(SimulatedPort::new()),
            other => {
                return Err(GalvaniError::config(format!(
                    "unknown hardware backend '{}'",
                    other
                )));
            }
        };
        let charger = crate::charger::ChargeController::new(
            config.thresholds.clone(),
            config.timers.clone(),
            port,
        );
        let vehicle = Vehicle::new(config.thresholds.clone(), config.timers.clone(), charger);
        let clock = ClockSource::system_default(config.clock.clone());
        let datalog = DataLogger::new(&config.datalog)?;
        let power = Box::new(OsPower::new(config.power.shutdown_pre_delay_sec));
        Ok(Self::new(config, clock, vehicle, datalog, power))
    }

    /// Startup sequence: reconcile the clock, bring the hardware to a known
    /// state, take the initial signal snapshot, and arm the first charge
    /// delay so mode selection happens only after signals have settled.
    pub async fn startup(&mut self) -> Result<()> {
        self.clock.reconcile_at_startup().await?;
        self.vehicle.startup().await?;
        self.prev = self.sample().await?;
        let now = self.clock.now();
        self.charge_delay
            .arm(now, Duration::seconds(self.config.timers.charge_delay_sec as i64));
        self.logger.info(&format!(
            "Controller started: key={:?} engine={} enable={}",
            self.prev.key, self.prev.engine, self.prev.enable
        ));
        Ok(())
    }

    /// Run until shutdown, termination, or a fault the restart policy must
    /// classify. All relays are open by the time this returns.
    pub async fn run(&mut self) -> Result<Exit> {
        if let Err(e) = self.startup().await {
            self.logger.error(&format!("Startup failed: {}", e));
            self.open_all_best_effort().await;
            return Err(e);
        }

        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .map_err(|e| GalvaniError::io(format!("failed to install SIGTERM handler: {}", e)))?;
        let mut interval =
            tokio::time::interval(std::time::Duration::from_millis(self.config.poll_interval_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = self.clock.now();
                    match self.tick(now).await {
                        Ok(Some(exit)) => return Ok(exit),
                        Ok(None) => {}
                        Err(e) => {
                            self.logger.error(&format!("Control loop fault: {}", e));
                            self.open_all_best_effort().await;
                            let _ = self.datalog.flush();
                            return Err(e);
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => return self.terminate().await,
                _ = sigterm.recv() => return self.terminate().await,
            }
        }
    }

    async fn terminate(&mut self) -> Result<Exit> {
        self.logger.warn("Termination signal received; opening all relays");
        self.open_all_best_effort().await;
        let _ = self.datalog.flush();
        Ok(Exit::Terminated)
    }

    async fn open_all_best_effort(&mut self) {
        if let Err(e) = self.vehicle.charger_mut().open_all().await {
            self.logger
                .error(&format!("Failed to open all relays on exit: {}", e));
        }
    }

    /// One control tick. `Ok(Some(exit))` ends the loop; wiring faults latch
    /// charging off instead of propagating; charge-control refusals are
    /// logged and retried next tick; everything else propagates for the
    /// process-level policy to classify.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<Option<Exit>> {
        self.ticks += 1;

        if self.voltage_fault {
            return self.retry_wiring(now).await;
        }

        let cadence = self.config.wiring_check_every_ticks;
        if cadence > 0 && self.ticks % cadence == 0 {
            self.vehicle.charger_mut().audit_relay_state().await?;
            if let Err(e) = self.vehicle.check_wiring().await {
                return self.latch_voltage_fault(e, now).await;
            }
        }

        if let Err(e) = self.log_data(now).await {
            self.logger.warn(&format!("Data logging failed: {}", e));
        }

        let status_cadence = self.config.status_every_ticks;
        if status_cadence > 0 && self.ticks % status_cadence == 0 {
            self.output_status().await;
            if let Err(e) = self.clock.maybe_resync_rtc().await {
                self.logger.warn(&format!("RTC resync failed: {}", e));
            }
        }

        match self.apply_policy(now).await {
            Ok(exit) => Ok(exit),
            Err(e @ GalvaniError::Voltage { .. }) => self.latch_voltage_fault(e, now).await,
            Err(e @ GalvaniError::ChargeControl { .. }) => {
                // Preconditions shift between the decision and the command
                // (an engine stopping, a battery sagging); retry next tick
                self.logger.error(&format!("Charge command refused: {}", e));
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn latch_voltage_fault(
        &mut self,
        fault: GalvaniError,
        now: DateTime<Utc>,
    ) -> Result<Option<Exit>> {
        self.logger
            .error(&format!("Wiring fault, halting charging: {}", fault));
        self.voltage_fault = true;
        self.vehicle.stop_charging(now).await?;
        Ok(None)
    }

    async fn retry_wiring(&mut self, now: DateTime<Utc>) -> Result<Option<Exit>> {
        match self.vehicle.check_wiring().await {
            Ok(()) => {
                self.logger
                    .info("Wiring fault cleared; resuming after charge delay");
                self.voltage_fault = false;
                self.charge_delay
                    .arm(now, Duration::seconds(self.config.timers.charge_delay_sec as i64));
                Ok(None)
            }
            Err(GalvaniError::Voltage { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn sample(&mut self) -> Result<Snapshot> {
        Ok(Snapshot {
            key: self.vehicle.key_position().await?,
            engine: self.vehicle.is_engine_running().await?,
            enable: self.vehicle.is_enable_switch_closed().await?,
        })
    }

    /// The transition policy: first match wins, and only the matched edge's
    /// previous-state field is updated, so simultaneous edges are each
    /// handled once on consecutive ticks.
    async fn apply_policy(&mut self, now: DateTime<Utc>) -> Result<Option<Exit>> {
        let cur = self.sample().await?;
        let shutdown_delay = Duration::seconds(self.config.timers.shutdown_delay_sec as i64);
        let charge_delay = Duration::seconds(self.config.timers.charge_delay_sec as i64);
        let key_off_delay = Duration::seconds(self.config.timers.charge_delay_key_off_sec as i64);

        if self.prev.enable && !cur.enable {
            self.prev.enable = false;
            self.logger
                .warn("Enable switch opened; stopping charging, shutdown timer armed");
            self.vehicle.stop_charging(now).await?;
            self.shutdown_timer.arm(now, shutdown_delay);
            return Ok(None);
        }

        if !self.prev.enable && cur.enable {
            self.prev.enable = true;
            self.logger
                .info("Enable switch closed; cancelling shutdown, re-entering operating mode");
            self.shutdown_timer.cancel();
            self.charge_delay.arm(now, charge_delay);
            return Ok(None);
        }

        if self.shutdown_timer.consume(now) {
            return Ok(Some(self.shutdown_sequence().await?));
        }

        if cur.key != self.prev.key {
            let from = self.prev.key;
            self.prev.key = cur.key;
            self.logger
                .info(&format!("Key {:?} -> {:?}; stopping charging", from, cur.key));
            self.vehicle.stop_charging(now).await?;
            let delay = if cur.key == KeyPosition::Off {
                key_off_delay
            } else {
                charge_delay
            };
            self.charge_delay.arm_if_longer(now, delay);
            return Ok(None);
        }

        if cur.engine != self.prev.engine {
            self.prev.engine = cur.engine;
            self.logger.info(&format!(
                "Engine {}; stopping charging",
                if cur.engine { "started" } else { "stopped" }
            ));
            self.vehicle.stop_charging(now).await?;
            self.charge_delay.arm_if_longer(now, charge_delay);
            return Ok(None);
        }

        // An unarmed charge delay means the hold-off has passed, so steady
        // state is re-evaluated every tick; the no-toggle guards in selection
        // keep the relays quiet
        if !self.shutdown_timer.is_armed()
            && (self.charge_delay.consume(now) || !self.charge_delay.is_armed())
        {
            return self.select_charge_mode(&cur, now).await;
        }

        Ok(None)
    }

    /// Steady-state mode selection, run each tick once the charge delay has
    /// elapsed and no shutdown is pending. Repeat calls are cheap: charging
    /// in the already-selected direction is a no-op.
    async fn select_charge_mode(
        &mut self,
        cur: &Snapshot,
        now: DateTime<Utc>,
    ) -> Result<Option<Exit>> {
        if cur.engine {
            if self.vehicle.is_aux_batt_full(now).await? {
                // Nothing to do; re-check much later instead of toggling
                // relays around a full battery
                self.logger.info("Aux battery full; deferring re-check");
                self.vehicle.stop_charging(now).await?;
                self.charge_delay.arm(
                    now,
                    Duration::seconds(self.config.timers.aux_full_recheck_sec as i64),
                );
            } else {
                self.vehicle.charge_aux_batt(now).await?;
            }
            return Ok(None);
        }

        let floor = if cur.key == KeyPosition::Off {
            Some(self.config.thresholds.aux_v_min_key_off)
        } else {
            None
        };
        if self.vehicle.is_aux_batt_empty(now, floor).await? {
            self.logger
                .warn("Aux battery at its floor; shutting down to protect it");
            return Ok(Some(self.shutdown_sequence().await?));
        }
        self.vehicle.charge_starter_batt(now).await?;
        Ok(None)
    }

    /// Disable charging, give the RTC a final chance to sync, flush the data
    /// tables, and halt the OS
    async fn shutdown_sequence(&mut self) -> Result<Exit> {
        self.logger.warn("Executing shutdown sequence");
        if let Err(e) = self.vehicle.charger_mut().open_all().await {
            self.logger
                .error(&format!("Failed to open all relays during shutdown: {}", e));
        }
        if let Err(e) = self.clock.maybe_resync_rtc().await {
            self.logger.warn(&format!("RTC resync during shutdown failed: {}", e));
        }
        if let Err(e) = self.datalog.flush() {
            self.logger.warn(&format!("Datalog flush failed: {}", e));
        }
        self.power.shut_down().await?;
        Ok(Exit::OsShutdown)
    }

    async fn log_data(&mut self, now: DateTime<Utc>) -> Result<()> {
        if !self.datalog.is_enabled() {
            return Ok(());
        }
        let time_valid = self.clock.is_time_valid();

        let main = self.vehicle.main_voltage().await?;
        let aux = self.vehicle.aux_voltage().await?;
        self.datalog.log_voltages(&VoltageRow {
            ts: now,
            time_valid,
            main_v: main.volts,
            main_annotation: main.annotation.as_str().to_string(),
            aux_v: aux.volts,
            aux_annotation: aux.annotation.as_str().to_string(),
        })?;

        let charger = self.vehicle.charger();
        let charging = charger.is_enabled();
        let charge_current = if charging {
            Some(charger.charge_current().await?)
        } else {
            None
        };
        let shunt_high = charger.port().read_voltage(AnalogLine::ShuntHigh).await?;
        let shunt_low = charger.port().read_voltage(AnalogLine::ShuntLow).await?;
        self.datalog.log_charging(&ChargingRow {
            ts: now,
            time_valid,
            charging,
            direction_to_starter: charger.mode() != ChargeMode::ToAux,
            charge_current_a: charge_current,
            shunt_high_v: shunt_high,
            shunt_low_v: shunt_low,
        })?;

        let port = self.vehicle.charger().port();
        let key_acc = port.is_input_high(InputLine::KeyAcc).await?;
        let key_on = port.is_input_high(InputLine::KeyOn).await?;
        let ecu_w = port.is_input_high(InputLine::EngineRun).await?;
        let engine_running = self.vehicle.is_engine_running().await?;
        let enable_switch = self.vehicle.is_enable_switch_closed().await?;
        self.datalog.log_signals(&SignalRow {
            ts: now,
            time_valid,
            enable_switch,
            key_acc,
            key_on,
            ecu_w,
            engine_running,
        })?;
        Ok(())
    }

    async fn output_status(&mut self) {
        let state = self.clock.state();
        let key = self.vehicle.key_position().await;
        let engine = self.vehicle.is_engine_running().await;
        let main = self.vehicle.main_voltage_raw().await;
        let aux = self.vehicle.aux_voltage_raw().await;
        self.logger.info(&format!(
            "Status: key={:?} engine={:?} main_raw={:?} aux_raw={:?} mode={:?} time_valid={}",
            key,
            engine,
            main,
            aux,
            self.vehicle.charger().mode(),
            state.valid,
        ));
    }
}
