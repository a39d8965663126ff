//! Charge-path relay control
//!
//! [`ChargeController`] owns the hardware port and is the only place relay
//! commands are issued. The direction relay selects which battery the charge
//! path feeds (open = toward the starter battery, closed = toward the aux
//! battery) and must never move under load: every direction change goes
//! through disable, settle, move, settle, re-enable, with read-back
//! verification at each step.

use crate::config::{ThresholdsConfig, TimersConfig};
use crate::error::{GalvaniError, Result};
use crate::hal::{AnalogLine, HardwarePort, RelayLine};
use crate::logging::get_logger;
use crate::timer::DebounceTimer;
use chrono::{DateTime, Duration, Utc};

/// Which battery the charge path feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeDirection {
    /// Aux battery charges the starter battery (direction relay open)
    ToStarter,
    /// Alternator/starter side charges the aux battery (direction relay closed)
    ToAux,
}

/// Current charging state as seen by the rest of the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeMode {
    Idle,
    ToStarter,
    ToAux,
}

pub struct ChargeController {
    thresholds: ThresholdsConfig,
    timers: TimersConfig,
    port: Box<dyn HardwarePort>,
    enabled: bool,
    direction: ChargeDirection,
    /// Armed on every charge-relay transition; voltages read before it
    /// elapses are electrically unsettled
    stabilization: DebounceTimer,
    logger: crate::logging::StructuredLogger,
}

impl ChargeController {
    /// Construct over a port whose relays are (or are about to be) all open
    pub fn new(
        thresholds: ThresholdsConfig,
        timers: TimersConfig,
        port: Box<dyn HardwarePort>,
    ) -> Self {
        Self {
            thresholds,
            timers,
            port,
            enabled: false,
            direction: ChargeDirection::ToStarter,
            stabilization: DebounceTimer::new("stabilization"),
            logger: get_logger("charger"),
        }
    }

    /// Read-only access to the port, for voltage and input sensing
    pub fn port(&self) -> &dyn HardwarePort {
        self.port.as_ref()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn direction(&self) -> ChargeDirection {
        self.direction
    }

    pub fn mode(&self) -> ChargeMode {
        if !self.enabled {
            ChargeMode::Idle
        } else {
            match self.direction {
                ChargeDirection::ToStarter => ChargeMode::ToStarter,
                ChargeDirection::ToAux => ChargeMode::ToAux,
            }
        }
    }

    /// Whether voltage readings taken at `now` are past the post-transition
    /// stabilization window
    pub fn is_voltage_stable(&mut self, now: DateTime<Utc>) -> bool {
        if !self.stabilization.is_armed() {
            return true;
        }
        if self.stabilization.is_elapsed(now) {
            self.stabilization.cancel();
            return true;
        }
        false
    }

    fn mark_unsettled(&mut self, now: DateTime<Utc>) {
        self.stabilization
            .arm(now, Duration::seconds(self.timers.stabilization_sec as i64));
    }

    /// Start (or redirect) charging toward `direction`.
    ///
    /// A direction change while enabled disables first; the direction relay
    /// never moves with the charge path closed.
    pub async fn charge(&mut self, direction: ChargeDirection, now: DateTime<Utc>) -> Result<()> {
        if self.enabled && self.direction == direction {
            self.logger
                .debug(&format!("Already charging {:?}", direction));
            return Ok(());
        }
        if self.enabled {
            self.disable(now).await?;
        }
        if self.direction != direction {
            self.move_direction_relay(direction, now).await?;
        }
        self.enable(now).await?;
        self.logger.info(&format!("Charging {:?}", direction));
        Ok(())
    }

    /// Open the charge path. No-op when already disabled.
    pub async fn stop(&mut self, now: DateTime<Utc>) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        self.disable(now).await?;
        self.logger.info("Charging stopped");
        Ok(())
    }

    async fn enable(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.port.close_relay(RelayLine::ChargeEnable).await?;
        self.settle_ms(self.timers.relay_settle_ms).await;
        self.verify_relay(RelayLine::ChargeEnable, true).await?;
        self.enabled = true;
        self.mark_unsettled(now);
        Ok(())
    }

    async fn disable(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.port.open_relay(RelayLine::ChargeEnable).await?;
        self.settle_ms(self.timers.relay_settle_ms).await;
        self.verify_relay(RelayLine::ChargeEnable, false).await?;
        self.enabled = false;
        // Release the direction relay too so its coil stops drawing current
        self.port.open_relay(RelayLine::ChargeDirection).await?;
        self.settle_ms(self.timers.direction_settle_ms).await;
        self.verify_relay(RelayLine::ChargeDirection, false).await?;
        self.direction = ChargeDirection::ToStarter;
        self.mark_unsettled(now);
        Ok(())
    }

    async fn move_direction_relay(
        &mut self,
        direction: ChargeDirection,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.enabled {
            return Err(GalvaniError::charge_control(
                "direction change attempted with charge path closed",
            ));
        }
        let close = matches!(direction, ChargeDirection::ToAux);
        if close {
            self.port.close_relay(RelayLine::ChargeDirection).await?;
        } else {
            self.port.open_relay(RelayLine::ChargeDirection).await?;
        }
        self.settle_ms(self.timers.direction_settle_ms).await;
        self.verify_relay(RelayLine::ChargeDirection, close).await?;
        self.direction = direction;
        self.mark_unsettled(now);
        Ok(())
    }

    /// Measured charge current from the shunt differential.
    ///
    /// Only meaningful with the charge path closed; calling this while
    /// disabled is a programming error surfaced as a fault.
    pub async fn charge_current(&self) -> Result<f64> {
        if !self.enabled {
            return Err(GalvaniError::charge_control(
                "charge current requested while charger disabled",
            ));
        }
        let high = self.port.read_voltage(AnalogLine::ShuntHigh).await?;
        let low = self.port.read_voltage(AnalogLine::ShuntLow).await?;
        Ok((high - low) * self.thresholds.shunt_amps_per_volt)
    }

    /// Close the keepalive relay if open, so the enable-switch sense circuit
    /// stays powered with the key off. Verified by read-back after a
    /// propagation wait.
    pub async fn ensure_keepalive_closed(&mut self) -> Result<()> {
        if self.port.is_relay_closed(RelayLine::Keepalive).await? {
            return Ok(());
        }
        self.logger.debug("Closing keepalive relay");
        self.port.close_relay(RelayLine::Keepalive).await?;
        self.settle_ms(self.timers.keepalive_propagation_ms).await;
        self.verify_relay(RelayLine::Keepalive, true).await
    }

    /// Open every relay, charge-enable first so the charge path is broken
    /// before anything else moves. All relays are commanded even if an
    /// earlier one fails verification; the first failure is returned.
    pub async fn open_all(&mut self) -> Result<()> {
        self.logger.info("Opening all relays");
        let mut first_err: Option<GalvaniError> = None;
        for line in RelayLine::ALL {
            if let Err(e) = self.open_and_verify(line).await {
                self.logger.error(&format!("Failed to open {:?}: {}", line, e));
                first_err.get_or_insert(e);
            }
        }
        self.enabled = false;
        self.direction = ChargeDirection::ToStarter;
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn open_and_verify(&mut self, line: RelayLine) -> Result<()> {
        self.port.open_relay(line).await?;
        if line == RelayLine::ChargeEnable {
            self.settle_ms(self.timers.relay_settle_ms).await;
        }
        self.verify_relay(line, false).await
    }

    /// Compare the cached charge state against relay read-back. Relays are
    /// commanded only through this controller, so a mismatch means a contact
    /// changed state on its own; the cache is corrected to match the hardware
    /// and the drift is surfaced as a relay fault.
    pub async fn audit_relay_state(&mut self) -> Result<()> {
        let enable = self.port.is_relay_closed(RelayLine::ChargeEnable).await?;
        let direction = self
            .port
            .is_relay_closed(RelayLine::ChargeDirection)
            .await?;
        let direction_expected = self.direction == ChargeDirection::ToAux;
        if enable == self.enabled && direction == direction_expected {
            return Ok(());
        }
        self.enabled = enable;
        self.direction = if direction {
            ChargeDirection::ToAux
        } else {
            ChargeDirection::ToStarter
        };
        Err(GalvaniError::relay(format!(
            "relay state drifted from commanded state (enable closed={}, direction closed={})",
            enable, direction
        )))
    }

    async fn verify_relay(&self, line: RelayLine, expect_closed: bool) -> Result<()> {
        let closed = self.port.is_relay_closed(line).await?;
        if closed != expect_closed {
            return Err(GalvaniError::relay(format!(
                "{:?} read back {} after being commanded {}",
                line,
                if closed { "closed" } else { "open" },
                if expect_closed { "closed" } else { "open" },
            )));
        }
        Ok(())
    }

    async fn settle_ms(&self, ms: u64) {
        tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{RelayCommand, SimulatedPort};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn controller() -> (ChargeController, crate::hal::SimHandle) {
        let port = SimulatedPort::new();
        let handle = port.handle();
        let ctl = ChargeController::new(
            ThresholdsConfig::default(),
            TimersConfig::default(),
            Box::new(port),
        );
        (ctl, handle)
    }

    /// Every direction-relay command in the trace must be preceded by an
    /// open charge path
    fn assert_direction_never_moves_under_load(trace: &[RelayCommand]) {
        let mut enable_closed = false;
        for cmd in trace {
            match cmd.line {
                RelayLine::ChargeEnable => enable_closed = cmd.closed,
                RelayLine::ChargeDirection => {
                    assert!(
                        !enable_closed,
                        "direction relay moved while charge path closed: {:?}",
                        trace
                    );
                }
                RelayLine::Keepalive => {}
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn charge_to_aux_closes_direction_before_enable() {
        let (mut ctl, handle) = controller();
        ctl.charge(ChargeDirection::ToAux, t0()).await.unwrap();
        assert!(ctl.is_enabled());
        assert_eq!(ctl.mode(), ChargeMode::ToAux);
        assert!(handle.is_relay_closed(RelayLine::ChargeDirection));
        assert!(handle.is_relay_closed(RelayLine::ChargeEnable));
        assert_direction_never_moves_under_load(&handle.trace());
    }

    #[tokio::test(start_paused = true)]
    async fn direction_change_disables_first() {
        let (mut ctl, handle) = controller();
        ctl.charge(ChargeDirection::ToAux, t0()).await.unwrap();
        ctl.charge(ChargeDirection::ToStarter, t0()).await.unwrap();
        assert_eq!(ctl.mode(), ChargeMode::ToStarter);
        assert!(!handle.is_relay_closed(RelayLine::ChargeDirection));
        assert_direction_never_moves_under_load(&handle.trace());
    }

    #[tokio::test(start_paused = true)]
    async fn repeat_charge_same_direction_is_a_noop() {
        let (mut ctl, handle) = controller();
        ctl.charge(ChargeDirection::ToStarter, t0()).await.unwrap();
        let commands = handle.trace().len();
        ctl.charge(ChargeDirection::ToStarter, t0()).await.unwrap();
        assert_eq!(handle.trace().len(), commands);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_enable_relay_is_a_relay_fault() {
        let (mut ctl, handle) = controller();
        handle.stick_relay(RelayLine::ChargeEnable);
        let err = ctl.charge(ChargeDirection::ToStarter, t0()).await.unwrap_err();
        assert!(matches!(err, GalvaniError::Relay { .. }));
        assert!(!ctl.is_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_enable_relay_blocks_disable() {
        let (mut ctl, handle) = controller();
        ctl.charge(ChargeDirection::ToStarter, t0()).await.unwrap();
        handle.stick_relay(RelayLine::ChargeEnable);
        let err = ctl.stop(t0()).await.unwrap_err();
        assert!(matches!(err, GalvaniError::Relay { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn charge_current_requires_enabled_path() {
        let (ctl, _) = controller();
        let err = ctl.charge_current().await.unwrap_err();
        assert!(matches!(err, GalvaniError::ChargeControl { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn charge_current_scales_shunt_differential() {
        let (mut ctl, handle) = controller();
        ctl.charge(ChargeDirection::ToAux, t0()).await.unwrap();
        handle.set_voltage(AnalogLine::ShuntHigh, 12.675);
        handle.set_voltage(AnalogLine::ShuntLow, 12.6);
        let amps = ctl.charge_current().await.unwrap();
        // 0.075 V across the shunt is 20 A
        assert!((amps - 20.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn stabilization_window_gates_voltage_trust() {
        let (mut ctl, _) = controller();
        ctl.charge(ChargeDirection::ToAux, t0()).await.unwrap();
        assert!(!ctl.is_voltage_stable(t0() + Duration::seconds(5)));
        assert!(ctl.is_voltage_stable(t0() + Duration::seconds(15)));
        // Once observed stable, stays stable until the next transition
        assert!(ctl.is_voltage_stable(t0() + Duration::seconds(16)));
    }

    #[tokio::test(start_paused = true)]
    async fn open_all_breaks_charge_path_first() {
        let (mut ctl, handle) = controller();
        ctl.charge(ChargeDirection::ToAux, t0()).await.unwrap();
        ctl.ensure_keepalive_closed().await.unwrap();
        let before = handle.trace().len();
        ctl.open_all().await.unwrap();
        let trace = handle.trace()[before..].to_vec();
        assert_eq!(trace[0].line, RelayLine::ChargeEnable);
        assert!(!trace[0].closed);
        assert!(trace.iter().all(|c| !c.closed));
        assert_eq!(ctl.mode(), ChargeMode::Idle);
        for line in RelayLine::ALL {
            assert!(!handle.is_relay_closed(line));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn open_all_reports_stuck_relay_but_opens_the_rest() {
        let (mut ctl, handle) = controller();
        ctl.charge(ChargeDirection::ToAux, t0()).await.unwrap();
        ctl.ensure_keepalive_closed().await.unwrap();
        handle.stick_relay(RelayLine::ChargeDirection);
        let err = ctl.open_all().await.unwrap_err();
        assert!(matches!(err, GalvaniError::Relay { .. }));
        assert!(!handle.is_relay_closed(RelayLine::ChargeEnable));
        assert!(!handle.is_relay_closed(RelayLine::Keepalive));
    }

    #[tokio::test(start_paused = true)]
    async fn audit_detects_a_dropped_enable_relay() {
        let (mut ctl, handle) = controller();
        ctl.charge(ChargeDirection::ToStarter, t0()).await.unwrap();
        ctl.audit_relay_state().await.unwrap();

        // Contacts drop out on their own, no command issued
        handle.force_relay(RelayLine::ChargeEnable, false);
        let err = ctl.audit_relay_state().await.unwrap_err();
        assert!(matches!(err, GalvaniError::Relay { .. }));
        // Cached state now reflects the hardware
        assert_eq!(ctl.mode(), ChargeMode::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn audit_detects_a_spontaneously_closed_direction_relay() {
        let (mut ctl, handle) = controller();
        handle.force_relay(RelayLine::ChargeDirection, true);
        let err = ctl.audit_relay_state().await.unwrap_err();
        assert!(matches!(err, GalvaniError::Relay { .. }));
        assert_eq!(ctl.direction(), ChargeDirection::ToAux);
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_close_is_verified() {
        let (mut ctl, handle) = controller();
        ctl.ensure_keepalive_closed().await.unwrap();
        assert!(handle.is_relay_closed(RelayLine::Keepalive));
        // Already closed: no further commands issued
        let before = handle.trace().len();
        ctl.ensure_keepalive_closed().await.unwrap();
        assert_eq!(handle.trace().len(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_keepalive_is_a_relay_fault() {
        let (mut ctl, handle) = controller();
        handle.stick_relay(RelayLine::Keepalive);
        let err = ctl.ensure_keepalive_closed().await.unwrap_err();
        assert!(matches!(err, GalvaniError::Relay { .. }));
    }
}
