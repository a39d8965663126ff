//! Vehicle state inference
//!
//! Everything the controller knows about the vehicle is inferred from four
//! digital inputs and three analog channels, all of which read through the
//! charge controller's port. No reading is taken at face value: voltages are
//! annotated with how the active charge path skews them, battery predicates
//! return safe defaults inside the post-transition stabilization window, and
//! the enable switch is only trusted when its sense circuit is known to be
//! powered.

use crate::charger::{ChargeController, ChargeDirection, ChargeMode};
use crate::config::{ThresholdsConfig, TimersConfig};
use crate::error::{GalvaniError, Result};
use crate::hal::{AnalogLine, InputLine, RelayLine};
use crate::logging::get_logger;
use chrono::{DateTime, Utc};

/// Ignition key position, decoded from the ACC and ON sense inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPosition {
    Off,
    Acc,
    On,
}

/// How the active charge path is expected to skew a voltage reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoltageAnnotation {
    Normal,
    /// Battery is being charged; reading is above resting voltage
    AssumedElevated,
    /// Battery is sourcing charge current; reading is below resting voltage
    AssumedDepressed,
}

impl VoltageAnnotation {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoltageAnnotation::Normal => "normal",
            VoltageAnnotation::AssumedElevated => "assumed_elevated",
            VoltageAnnotation::AssumedDepressed => "assumed_depressed",
        }
    }
}

/// A voltage with its skew annotation. The raw value is reported unmodified;
/// the annotation tells callers how much to trust it.
#[derive(Debug, Clone, Copy)]
pub struct VoltageReading {
    pub volts: f64,
    pub annotation: VoltageAnnotation,
}

pub struct Vehicle {
    thresholds: ThresholdsConfig,
    timers: TimersConfig,
    charger: ChargeController,
    logger: crate::logging::StructuredLogger,
}

impl Vehicle {
    pub fn new(
        thresholds: ThresholdsConfig,
        timers: TimersConfig,
        charger: ChargeController,
    ) -> Self {
        Self {
            thresholds,
            timers,
            charger,
            logger: get_logger("vehicle"),
        }
    }

    /// Bring the hardware to a known state: all relays open, inputs settled,
    /// wiring verified, keepalive closed for the rest of the process life.
    pub async fn startup(&mut self) -> Result<()> {
        self.charger.open_all().await?;
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        self.check_wiring().await?;
        self.charger.ensure_keepalive_closed().await?;
        Ok(())
    }

    pub fn charger(&self) -> &ChargeController {
        &self.charger
    }

    pub fn charger_mut(&mut self) -> &mut ChargeController {
        &mut self.charger
    }

    /// Decode the key position. The ON sense implies ACC electrically; an ON
    /// reading without ACC is reported as ON and logged, since the engine-run
    /// inference keys off ACC power being present.
    pub async fn key_position(&self) -> Result<KeyPosition> {
        let port = self.charger.port();
        let acc = port.is_input_high(InputLine::KeyAcc).await?;
        let on = port.is_input_high(InputLine::KeyOn).await?;
        if on && !acc {
            self.logger
                .warn("Key ON sensed without ACC; treating as ON");
        }
        Ok(if on {
            KeyPosition::On
        } else if acc {
            KeyPosition::Acc
        } else {
            KeyPosition::Off
        })
    }

    /// Whether the key is in either powered position
    pub async fn is_acc_powered(&self) -> Result<bool> {
        Ok(self.key_position().await? != KeyPosition::Off)
    }

    pub async fn is_key_off(&self) -> Result<bool> {
        Ok(self.key_position().await? == KeyPosition::Off)
    }

    /// Infer whether the engine is running.
    ///
    /// The ECU W signal alone is not consistent enough, so an elevated main
    /// voltage also counts as evidence, unless that elevation is explained by
    /// our own charger feeding the starter battery. With the key off the
    /// engine cannot be running, so inputs are not even consulted.
    pub async fn is_engine_running(&self) -> Result<bool> {
        if !self.is_acc_powered().await? {
            return Ok(false);
        }
        let ecu_w_high = self
            .charger
            .port()
            .is_input_high(InputLine::EngineRun)
            .await?;
        let main_elevated = self.main_voltage_raw().await? >= self.thresholds.alternator_output_v_min;
        let charger_elevating = self.charger.mode() == ChargeMode::ToStarter;
        Ok(ecu_w_high || (main_elevated && !charger_elevating))
    }

    /// Read the enable switch, guaranteeing its sense circuit is powered.
    ///
    /// With the key off the switch is only readable through the keepalive
    /// relay. If that relay is found open the reading is indeterminate: close
    /// it, wait for propagation, and retry a bounded number of times.
    pub async fn is_enable_switch_closed(&mut self) -> Result<bool> {
        for _ in 0..self.timers.enable_switch_retries {
            let keepalive_closed = self
                .charger
                .port()
                .is_relay_closed(RelayLine::Keepalive)
                .await?;
            if !keepalive_closed && self.is_key_off().await? {
                self.logger.error(
                    "Keepalive relay open during enable-switch check; reading indeterminate with key off",
                );
                self.charger.ensure_keepalive_closed().await?;
                continue;
            }
            return self
                .charger
                .port()
                .is_input_high(InputLine::EnableSwitch)
                .await;
        }
        Err(GalvaniError::relay(
            "keepalive relay would not hold closed; enable-switch state indeterminate",
        ))
    }

    /// Starter-battery voltage at the terminals. The charger output channel
    /// sees the starter side whenever the direction relay selects it.
    pub async fn main_voltage_raw(&self) -> Result<f64> {
        let line = match self.charger.direction() {
            ChargeDirection::ToStarter => AnalogLine::ChargerOutput,
            ChargeDirection::ToAux => AnalogLine::ShuntHigh,
        };
        self.charger.port().read_voltage(line).await
    }

    /// Aux-battery voltage at the terminals
    pub async fn aux_voltage_raw(&self) -> Result<f64> {
        let line = match self.charger.direction() {
            ChargeDirection::ToAux => AnalogLine::ChargerOutput,
            ChargeDirection::ToStarter => AnalogLine::ShuntHigh,
        };
        self.charger.port().read_voltage(line).await
    }

    /// Starter-battery voltage with its skew annotation
    pub async fn main_voltage(&self) -> Result<VoltageReading> {
        let mut annotation = VoltageAnnotation::Normal;
        if self.is_engine_running().await? {
            annotation = VoltageAnnotation::AssumedElevated;
            self.logger
                .warn("Engine running during starter-battery reading (elevating value)");
        } else {
            match self.charger.mode() {
                ChargeMode::ToStarter => {
                    annotation = VoltageAnnotation::AssumedElevated;
                    self.logger.warn(
                        "Starter battery being charged by aux during reading (elevating value)",
                    );
                }
                ChargeMode::ToAux => {
                    // Engine must have stopped between the inference above
                    // and here; reading is probably already back to resting.
                    self.logger
                        .warn("Charging aux battery during starter-battery reading");
                }
                ChargeMode::Idle => {}
            }
        }
        Ok(VoltageReading {
            volts: self.main_voltage_raw().await?,
            annotation,
        })
    }

    /// Aux-battery voltage with its skew annotation. Elevated and depressed
    /// are mutually exclusive; both at once means the charge-state model has
    /// diverged from the hardware.
    pub async fn aux_voltage(&self) -> Result<VoltageReading> {
        let mut elevated = false;
        let mut depressed = false;
        match self.charger.mode() {
            ChargeMode::ToStarter => {
                depressed = true;
                self.logger
                    .warn("Aux battery charging the starter during reading (depressing value)");
            }
            ChargeMode::ToAux => {
                elevated = true;
                self.logger
                    .warn("Aux battery being charged during reading (elevating value)");
            }
            ChargeMode::Idle => {}
        }
        if elevated && depressed {
            let msg = "aux voltage indicated both elevated and depressed (mutually exclusive)";
            self.logger.error(msg);
            return Err(GalvaniError::voltage(msg));
        }
        Ok(VoltageReading {
            volts: self.aux_voltage_raw().await?,
            annotation: if elevated {
                VoltageAnnotation::AssumedElevated
            } else if depressed {
                VoltageAnnotation::AssumedDepressed
            } else {
                VoltageAnnotation::Normal
            },
        })
    }

    /// Verify the voltage sensing is wired and plausible. Run at startup and
    /// periodically; a failure here latches charging off at the control loop.
    pub async fn check_wiring(&self) -> Result<()> {
        let main_raw = self.main_voltage_raw().await?;
        if main_raw < self.thresholds.plausible_v_floor {
            let msg = format!("no main voltage detected (reading {:.2}V)", main_raw);
            self.logger.error(&msg);
            return Err(GalvaniError::voltage(msg));
        }
        let aux_raw = self.aux_voltage_raw().await?;
        if aux_raw < self.thresholds.plausible_v_floor {
            let msg = format!("no aux voltage detected (reading {:.2}V)", aux_raw);
            self.logger.error(&msg);
            return Err(GalvaniError::voltage(msg));
        }
        if self.is_key_off().await? && self.is_engine_running().await? {
            let msg = "inferred engine running but key OFF";
            self.logger.error(msg);
            return Err(GalvaniError::voltage(msg));
        }
        Ok(())
    }

    /// Whether the starter battery is below its minimum. False while voltages
    /// are unstabilized: never act on a low reading that may be transient.
    pub async fn is_starter_batt_low(&mut self, now: DateTime<Utc>) -> Result<bool> {
        if !self.charger.is_voltage_stable(now) {
            return Ok(false);
        }
        let reading = self.main_voltage().await?;
        let low = reading.volts < self.thresholds.main_v_min;
        if low {
            self.logger.warn(&format!(
                "Starter-battery voltage {:.2}V below minimum {:.2}V",
                reading.volts, self.thresholds.main_v_min
            ));
        }
        Ok(low)
    }

    /// Whether the starter battery is at or above its charged threshold.
    /// True while unstabilized: assume charged rather than start a charge on
    /// a transient reading.
    pub async fn is_starter_batt_charged(&mut self, now: DateTime<Utc>) -> Result<bool> {
        if !self.charger.is_voltage_stable(now) {
            return Ok(true);
        }
        Ok(self.main_voltage().await?.volts >= self.thresholds.main_v_charged)
    }

    /// Whether the aux battery is at or below a floor (the configured key-on
    /// floor unless overridden). The floor itself counts as empty: charging
    /// continues only while strictly above it. False while unstabilized.
    pub async fn is_aux_batt_empty(
        &mut self,
        now: DateTime<Utc>,
        threshold_override: Option<f64>,
    ) -> Result<bool> {
        if !self.charger.is_voltage_stable(now) {
            return Ok(false);
        }
        let threshold = threshold_override.unwrap_or(self.thresholds.aux_v_min);
        let reading = self.aux_voltage().await?;
        // A reading below the plausible floor is broken sensing, not an
        // empty battery; it must latch as a wiring fault, not shut down
        if reading.volts < self.thresholds.plausible_v_floor {
            let msg = format!(
                "implausible aux reading {:.2}V during battery-floor check",
                reading.volts
            );
            self.logger.error(&msg);
            return Err(GalvaniError::voltage(msg));
        }
        let empty = reading.volts <= threshold;
        if empty {
            self.logger.warn(&format!(
                "Aux-battery voltage {:.2}V at or below minimum {:.2}V",
                reading.volts, threshold
            ));
        }
        Ok(empty)
    }

    pub async fn is_aux_batt_sufficient(
        &mut self,
        now: DateTime<Utc>,
        threshold_override: Option<f64>,
    ) -> Result<bool> {
        Ok(!self.is_aux_batt_empty(now, threshold_override).await?)
    }

    /// Whether the aux battery is full. False while unstabilized.
    pub async fn is_aux_batt_full(&mut self, now: DateTime<Utc>) -> Result<bool> {
        if !self.charger.is_voltage_stable(now) {
            return Ok(false);
        }
        Ok(self.aux_voltage().await?.volts >= self.thresholds.aux_v_max)
    }

    /// Charge the starter battery from the aux battery.
    ///
    /// Refused when the aux battery cannot spare the charge or the starter
    /// battery is already over its hard maximum.
    pub async fn charge_starter_batt(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.is_aux_batt_empty(now, None).await? {
            let msg = format!(
                "refusing to charge starter battery: aux at {:.2}V, below {:.2}V floor",
                self.aux_voltage_raw().await?,
                self.thresholds.aux_v_min
            );
            self.logger.error(&msg);
            return Err(GalvaniError::charge_control(msg));
        }
        let main = self.main_voltage().await?.volts;
        if main > self.thresholds.main_v_max {
            let msg = format!(
                "refusing to charge starter battery: already at {:.2}V, over {:.2}V maximum",
                main, self.thresholds.main_v_max
            );
            self.logger.error(&msg);
            return Err(GalvaniError::voltage(msg));
        }
        self.charger.charge(ChargeDirection::ToStarter, now).await
    }

    /// Charge the aux battery from the alternator side.
    ///
    /// Refused when the starter battery is not holding its charged voltage;
    /// the engine can stop between the caller's decision and this call, and
    /// the starter battery must never be drained into the aux battery.
    pub async fn charge_aux_batt(&mut self, now: DateTime<Utc>) -> Result<()> {
        if !self.is_starter_batt_charged(now).await? {
            let msg = format!(
                "refusing to charge aux battery: starter at {:.2}V, engine presumably stopped",
                self.main_voltage_raw().await?
            );
            self.logger.error(&msg);
            return Err(GalvaniError::charge_control(msg));
        }
        if self.is_aux_batt_full(now).await? {
            self.logger.warn(&format!(
                "Charging aux battery although already full ({:.2}V)",
                self.aux_voltage_raw().await?
            ));
        }
        self.charger.charge(ChargeDirection::ToAux, now).await
    }

    pub async fn stop_charging(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.charger.stop(now).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{SimHandle, SimulatedPort};
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn vehicle() -> (Vehicle, SimHandle) {
        let port = SimulatedPort::new();
        let handle = port.handle();
        let charger = ChargeController::new(
            ThresholdsConfig::default(),
            TimersConfig::default(),
            Box::new(port),
        );
        (
            Vehicle::new(ThresholdsConfig::default(), TimersConfig::default(), charger),
            handle,
        )
    }

    /// A time far enough past construction that no stabilization window from
    /// the test setup is still pending
    fn settled() -> DateTime<Utc> {
        t0() + Duration::seconds(3600)
    }

    #[tokio::test(start_paused = true)]
    async fn key_position_decodes_inputs() {
        let (vehicle, handle) = vehicle();
        assert_eq!(vehicle.key_position().await.unwrap(), KeyPosition::Off);
        handle.set_input(InputLine::KeyAcc, true);
        assert_eq!(vehicle.key_position().await.unwrap(), KeyPosition::Acc);
        handle.set_input(InputLine::KeyOn, true);
        assert_eq!(vehicle.key_position().await.unwrap(), KeyPosition::On);
    }

    #[tokio::test(start_paused = true)]
    async fn key_on_without_acc_still_reads_on() {
        let (vehicle, handle) = vehicle();
        handle.set_input(InputLine::KeyOn, true);
        assert_eq!(vehicle.key_position().await.unwrap(), KeyPosition::On);
        assert!(vehicle.is_acc_powered().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn engine_never_running_with_key_off() {
        let (vehicle, handle) = vehicle();
        handle.set_input(InputLine::EngineRun, true);
        handle.set_voltage(AnalogLine::ChargerOutput, 14.2);
        assert!(!vehicle.is_engine_running().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn ecu_w_signal_implies_engine_running() {
        let (vehicle, handle) = vehicle();
        handle.set_input(InputLine::KeyAcc, true);
        handle.set_input(InputLine::EngineRun, true);
        assert!(vehicle.is_engine_running().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn elevated_main_voltage_implies_engine_running() {
        let (vehicle, handle) = vehicle();
        handle.set_input(InputLine::KeyAcc, true);
        // Direction idle/to-starter: main reads the charger-output channel
        handle.set_voltage(AnalogLine::ChargerOutput, 13.8);
        assert!(vehicle.is_engine_running().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn own_charger_elevation_is_not_engine_evidence() {
        let (mut vehicle, handle) = vehicle();
        handle.set_input(InputLine::KeyAcc, true);
        vehicle
            .charger_mut()
            .charge(ChargeDirection::ToStarter, t0())
            .await
            .unwrap();
        handle.set_voltage(AnalogLine::ChargerOutput, 13.8);
        assert!(!vehicle.is_engine_running().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn voltage_channel_follows_direction_relay() {
        let (mut vehicle, handle) = vehicle();
        handle.set_voltage(AnalogLine::ChargerOutput, 12.1);
        handle.set_voltage(AnalogLine::ShuntHigh, 13.3);
        // Idle: direction relay rests toward the starter side
        assert!((vehicle.main_voltage_raw().await.unwrap() - 12.1).abs() < 1e-9);
        assert!((vehicle.aux_voltage_raw().await.unwrap() - 13.3).abs() < 1e-9);

        handle.set_voltage(AnalogLine::ShuntHigh, 12.9);
        vehicle
            .charger_mut()
            .charge(ChargeDirection::ToAux, t0())
            .await
            .unwrap();
        assert!((vehicle.main_voltage_raw().await.unwrap() - 12.9).abs() < 1e-9);
        assert!((vehicle.aux_voltage_raw().await.unwrap() - 12.1).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn annotations_follow_charge_mode() {
        let (mut vehicle, handle) = vehicle();
        handle.set_voltage(AnalogLine::ChargerOutput, 13.0);
        handle.set_voltage(AnalogLine::ShuntHigh, 12.4);

        assert_eq!(
            vehicle.main_voltage().await.unwrap().annotation,
            VoltageAnnotation::Normal
        );
        assert_eq!(
            vehicle.aux_voltage().await.unwrap().annotation,
            VoltageAnnotation::Normal
        );

        vehicle
            .charger_mut()
            .charge(ChargeDirection::ToStarter, t0())
            .await
            .unwrap();
        assert_eq!(
            vehicle.main_voltage().await.unwrap().annotation,
            VoltageAnnotation::AssumedElevated
        );
        assert_eq!(
            vehicle.aux_voltage().await.unwrap().annotation,
            VoltageAnnotation::AssumedDepressed
        );

        vehicle
            .charger_mut()
            .charge(ChargeDirection::ToAux, t0())
            .await
            .unwrap();
        assert_eq!(
            vehicle.aux_voltage().await.unwrap().annotation,
            VoltageAnnotation::AssumedElevated
        );
    }

    #[tokio::test(start_paused = true)]
    async fn predicates_use_safe_defaults_while_unstabilized() {
        let (mut vehicle, handle) = vehicle();
        handle.set_voltage(AnalogLine::ChargerOutput, 10.0);
        handle.set_voltage(AnalogLine::ShuntHigh, 10.0);
        vehicle
            .charger_mut()
            .charge(ChargeDirection::ToAux, t0())
            .await
            .unwrap();

        let just_after = t0() + Duration::seconds(1);
        assert!(!vehicle.is_starter_batt_low(just_after).await.unwrap());
        assert!(vehicle.is_starter_batt_charged(just_after).await.unwrap());
        assert!(!vehicle.is_aux_batt_empty(just_after, None).await.unwrap());
        assert!(!vehicle.is_aux_batt_full(just_after).await.unwrap());

        let after_window = t0() + Duration::seconds(20);
        assert!(vehicle.is_starter_batt_low(after_window).await.unwrap());
        assert!(vehicle.is_aux_batt_empty(after_window, None).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn aux_empty_threshold_override() {
        let (mut vehicle, handle) = vehicle();
        handle.set_voltage(AnalogLine::ShuntHigh, 12.5);
        // 12.5 V: above the 12.0 key-on floor, below the 12.8 key-off floor
        assert!(!vehicle.is_aux_batt_empty(settled(), None).await.unwrap());
        assert!(
            vehicle
                .is_aux_batt_empty(settled(), Some(12.8))
                .await
                .unwrap()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn implausible_aux_reading_is_a_fault_not_empty() {
        let (mut vehicle, handle) = vehicle();
        handle.set_voltage(AnalogLine::ShuntHigh, 0.2);
        let err = vehicle
            .is_aux_batt_empty(settled(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, GalvaniError::Voltage { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn enable_switch_reads_directly_with_key_on() {
        let (mut vehicle, handle) = vehicle();
        handle.set_input(InputLine::KeyAcc, true);
        handle.set_input(InputLine::EnableSwitch, true);
        assert!(vehicle.is_enable_switch_closed().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn enable_switch_closes_keepalive_when_key_off() {
        let (mut vehicle, handle) = vehicle();
        handle.set_input(InputLine::EnableSwitch, true);
        assert!(!handle.is_relay_closed(RelayLine::Keepalive));
        assert!(vehicle.is_enable_switch_closed().await.unwrap());
        assert!(handle.is_relay_closed(RelayLine::Keepalive));
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_keepalive_makes_enable_switch_indeterminate() {
        let (mut vehicle, handle) = vehicle();
        handle.stick_relay(RelayLine::Keepalive);
        let err = vehicle.is_enable_switch_closed().await.unwrap_err();
        assert!(matches!(err, GalvaniError::Relay { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn check_wiring_rejects_missing_voltage() {
        let (vehicle, handle) = vehicle();
        handle.set_voltage(AnalogLine::ChargerOutput, 0.3);
        let err = vehicle.check_wiring().await.unwrap_err();
        assert!(matches!(err, GalvaniError::Voltage { .. }));

        handle.set_voltage(AnalogLine::ChargerOutput, 12.6);
        handle.set_voltage(AnalogLine::ShuntHigh, 0.0);
        let err = vehicle.check_wiring().await.unwrap_err();
        assert!(matches!(err, GalvaniError::Voltage { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn check_wiring_passes_at_rest() {
        let (vehicle, _) = vehicle();
        vehicle.check_wiring().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn charge_starter_refused_when_aux_empty() {
        let (mut vehicle, handle) = vehicle();
        handle.set_voltage(AnalogLine::ShuntHigh, 11.0);
        let err = vehicle.charge_starter_batt(settled()).await.unwrap_err();
        assert!(matches!(err, GalvaniError::ChargeControl { .. }));
        assert!(!vehicle.charger().is_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn charge_starter_refused_when_main_over_max() {
        let (mut vehicle, handle) = vehicle();
        handle.set_voltage(AnalogLine::ChargerOutput, 15.2);
        let err = vehicle.charge_starter_batt(settled()).await.unwrap_err();
        assert!(matches!(err, GalvaniError::Voltage { .. }));
        assert!(!vehicle.charger().is_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn charge_aux_refused_when_starter_not_charged() {
        let (mut vehicle, handle) = vehicle();
        handle.set_voltage(AnalogLine::ChargerOutput, 12.2);
        let err = vehicle.charge_aux_batt(settled()).await.unwrap_err();
        assert!(matches!(err, GalvaniError::ChargeControl { .. }));
        assert!(!vehicle.charger().is_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn charge_aux_succeeds_with_starter_charged() {
        let (mut vehicle, handle) = vehicle();
        handle.set_voltage(AnalogLine::ChargerOutput, 13.8);
        vehicle.charge_aux_batt(settled()).await.unwrap();
        assert_eq!(vehicle.charger().mode(), ChargeMode::ToAux);
    }

    #[tokio::test(start_paused = true)]
    async fn startup_opens_relays_and_closes_keepalive() {
        let (mut vehicle, handle) = vehicle();
        handle.force_relay(RelayLine::ChargeEnable, true);
        vehicle.startup().await.unwrap();
        assert!(!handle.is_relay_closed(RelayLine::ChargeEnable));
        assert!(!handle.is_relay_closed(RelayLine::ChargeDirection));
        assert!(handle.is_relay_closed(RelayLine::Keepalive));
    }
}
