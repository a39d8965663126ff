//! Hardware port abstraction
//!
//! The controller never touches pins or relay numbers directly. Lines are
//! closed enums, so an invalid identifier cannot be constructed, and all
//! hardware access goes through the [`HardwarePort`] trait. The real board
//! driver (GPIO expander, ADC) lives behind this trait; the crate ships a
//! simulated port used by tests and the `sim` backend.

use crate::error::{GalvaniError, Result};
use std::sync::{Arc, Mutex};

/// Digital input lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputLine {
    /// ECU engine-run (W) signal
    EngineRun,
    /// Key ACC-detect
    KeyAcc,
    /// Key ON-detect
    KeyOn,
    /// Enable switch sense
    EnableSwitch,
}

/// Analog voltage-sense lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnalogLine {
    /// Low side of the current-sense shunt
    ShuntLow,
    /// High side of the current-sense shunt
    ShuntHigh,
    /// Charger output side
    ChargerOutput,
}

/// Relay lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayLine {
    /// Closes the charge path
    ChargeEnable,
    /// Selects charge direction (open = toward starter, closed = toward aux)
    ChargeDirection,
    /// Keeps the enable-switch sense circuit powered with the key off
    Keepalive,
}

impl RelayLine {
    /// All relays, charge-enable first. Opening in this order guarantees the
    /// charge path is broken before anything else moves.
    pub const ALL: [RelayLine; 3] = [
        RelayLine::ChargeEnable,
        RelayLine::ChargeDirection,
        RelayLine::Keepalive,
    ];
}

/// Port to the relay/analog/digital I/O hardware.
///
/// Reads take `&self`; relay writes take `&mut self` so only the owner of the
/// port (the charge controller) can command them. Implementations report
/// transient bus problems as `Hardware` errors so the process-level restart
/// policy can classify them.
#[async_trait::async_trait]
pub trait HardwarePort: Send + Sync {
    /// Read an analog line in volts
    async fn read_voltage(&self, line: AnalogLine) -> Result<f64>;

    /// Whether a digital input reads high
    async fn is_input_high(&self, line: InputLine) -> Result<bool>;

    /// Whether a relay reads closed
    async fn is_relay_closed(&self, line: RelayLine) -> Result<bool>;

    /// Command a relay closed. Callers verify via read-back.
    async fn close_relay(&mut self, line: RelayLine) -> Result<()>;

    /// Command a relay open. Callers verify via read-back.
    async fn open_relay(&mut self, line: RelayLine) -> Result<()>;
}

/// One commanded relay transition, as recorded by [`SimulatedPort`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayCommand {
    pub line: RelayLine,
    pub closed: bool,
}

#[derive(Debug, Default)]
struct SimState {
    inputs_high: std::collections::HashMap<InputLine, bool>,
    voltages: std::collections::HashMap<AnalogLine, f64>,
    relays_closed: std::collections::HashMap<RelayLine, bool>,
    /// Relays that ignore commands (stuck contacts)
    stuck_relays: std::collections::HashSet<RelayLine>,
    /// Pending injected read failures, consumed one per read
    pending_read_faults: u32,
    /// Successful reads remaining before injected failures begin
    reads_before_fault: u32,
    trace: Vec<RelayCommand>,
}

/// Shared handle into a [`SimulatedPort`], letting tests flip inputs and
/// voltages while the controller owns the port itself.
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimHandle {
    pub fn set_input(&self, line: InputLine, high: bool) {
        self.lock().inputs_high.insert(line, high);
    }

    pub fn set_voltage(&self, line: AnalogLine, volts: f64) {
        self.lock().voltages.insert(line, volts);
    }

    /// Force a relay state directly, bypassing the command path
    pub fn force_relay(&self, line: RelayLine, closed: bool) {
        self.lock().relays_closed.insert(line, closed);
    }

    pub fn is_relay_closed(&self, line: RelayLine) -> bool {
        *self.lock().relays_closed.get(&line).unwrap_or(&false)
    }

    /// Make a relay ignore subsequent commands (stuck contacts)
    pub fn stick_relay(&self, line: RelayLine) {
        self.lock().stuck_relays.insert(line);
    }

    pub fn unstick_relay(&self, line: RelayLine) {
        self.lock().stuck_relays.remove(&line);
    }

    /// Inject transient read failures, consumed one per hardware read
    pub fn inject_read_faults(&self, count: u32) {
        self.lock().pending_read_faults = count;
    }

    /// Inject transient read failures that begin only after the next `skip`
    /// reads succeed
    pub fn inject_read_faults_after(&self, skip: u32, count: u32) {
        let mut state = self.lock();
        state.reads_before_fault = skip;
        state.pending_read_faults = count;
    }

    /// Commanded relay transitions in order
    pub fn trace(&self) -> Vec<RelayCommand> {
        self.lock().trace.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        // A poisoned sim lock only happens when a test already panicked
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// In-memory hardware port for tests and the `sim` backend.
///
/// All relays start open, all inputs low, all voltages at a nominal resting
/// 12.6 V so a freshly constructed port passes the wiring check.
pub struct SimulatedPort {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedPort {
    pub fn new() -> Self {
        let mut state = SimState::default();
        for line in [
            AnalogLine::ShuntLow,
            AnalogLine::ShuntHigh,
            AnalogLine::ChargerOutput,
        ] {
            state.voltages.insert(line, 12.6);
        }
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Shared handle for scripting the port from outside
    pub fn handle(&self) -> SimHandle {
        SimHandle {
            state: Arc::clone(&self.state),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_read_fault(&self) -> Option<GalvaniError> {
        let mut state = self.lock();
        if state.reads_before_fault > 0 {
            state.reads_before_fault -= 1;
            return None;
        }
        if state.pending_read_faults > 0 {
            state.pending_read_faults -= 1;
            Some(GalvaniError::hardware("simulated bus read failure"))
        } else {
            None
        }
    }
}

impl Default for SimulatedPort {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl HardwarePort for SimulatedPort {
    async fn read_voltage(&self, line: AnalogLine) -> Result<f64> {
        if let Some(err) = self.take_read_fault() {
            return Err(err);
        }
        Ok(*self.lock().voltages.get(&line).unwrap_or(&0.0))
    }

    async fn is_input_high(&self, line: InputLine) -> Result<bool> {
        if let Some(err) = self.take_read_fault() {
            return Err(err);
        }
        Ok(*self.lock().inputs_high.get(&line).unwrap_or(&false))
    }

    async fn is_relay_closed(&self, line: RelayLine) -> Result<bool> {
        if let Some(err) = self.take_read_fault() {
            return Err(err);
        }
        Ok(*self.lock().relays_closed.get(&line).unwrap_or(&false))
    }

    async fn close_relay(&mut self, line: RelayLine) -> Result<()> {
        let mut state = self.lock();
        state.trace.push(RelayCommand { line, closed: true });
        if !state.stuck_relays.contains(&line) {
            state.relays_closed.insert(line, true);
        }
        Ok(())
    }

    async fn open_relay(&mut self, line: RelayLine) -> Result<()> {
        let mut state = self.lock();
        state.trace.push(RelayCommand {
            line,
            closed: false,
        });
        if !state.stuck_relays.contains(&line) {
            state.relays_closed.insert(line, false);
        }
        Ok(())
    }
}
