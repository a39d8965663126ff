//! Galvani: unattended dual-battery vehicle charge controller
//!
//! Galvani manages the bidirectional charge path between a vehicle's starter
//! battery and an auxiliary battery from a small Linux board wired to a relay
//! and ADC HAT. It infers vehicle state (key position, engine running, enable
//! switch) from raw pin reads, debounces every decision behind hold-off
//! timers, enforces a strict relay interlock on the charge path, reconciles
//! RTC and NTP time at startup, and shuts the host down when the enable
//! switch opens or the aux battery nears depletion.
//!
//! Layering, one way per tick:
//!
//! ```text
//! HardwarePort -> Vehicle -> Controller -> ChargeController -> HardwarePort
//! ```
//!
//! with [`clock::ClockSource`] and [`timer::DebounceTimer`] consulted along
//! the way. [`charger::ChargeController`] exclusively owns the port; all
//! relay mutation routes through it.

pub mod charger;
pub mod clock;
pub mod config;
pub mod controller;
pub mod datalog;
pub mod error;
pub mod hal;
pub mod logging;
pub mod power;
pub mod timer;
pub mod vehicle;

pub use charger::{ChargeController, ChargeDirection, ChargeMode};
pub use config::Config;
pub use controller::{Controller, Exit};
pub use error::{GalvaniError, Result};
pub use hal::{AnalogLine, HardwarePort, InputLine, RelayLine, SimulatedPort};
pub use vehicle::{KeyPosition, Vehicle, VoltageAnnotation, VoltageReading};

/// Application version, derived at build time from the Cargo version plus
/// the short git sha when available
pub const APP_VERSION: &str = env!("APP_VERSION");
