//! Instrument Capabilities
//!
//! Fine-grained capability traits that instrument adapters implement. The acquisition
//! pipeline only ever sees these traits, never a concrete instrument type:
//!
//! - A power-supply channel implements: `Readable + Writable`
//! - A flow controller implements: `Readable + Writable + StatefulDiscrete<ValveState>`
//! - A vacuum gauge implements: `Readable + StatefulDiscrete<GasType>`
//! - A thermocouple scanner implements: `MultiChannelReadable`
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Never fails: faults are contained inside the adapter and reported through
//!   [`Reading::valid`] or [`Delivery::Dropped`]
//! - Focuses on ONE thing
//!
//! # Example
//!
//! ```rust,ignore
//! async fn log_pair<T>(device: &T) -> Reading
//! where
//!     T: Readable + Writable,
//! {
//!     device.write(12.5).await;
//!     device.read().await
//! }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::snapshot::Reading;

/// Outcome of a best-effort write.
///
/// `Transmitted` only means the command left the host; instruments do not acknowledge
/// setpoints, so the applied value is observed on the next poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Delivery {
    /// The command was written to the transport.
    Transmitted,
    /// The command could not be written (adapter uninitialized or transport fault).
    Dropped,
}

impl Delivery {
    /// Whether the command reached the transport.
    pub fn is_transmitted(self) -> bool {
        matches!(self, Delivery::Transmitted)
    }
}

/// Capability: Scalar Measurement
///
/// # Contract
/// - Never fails; a transport or parse fault yields [`Reading::fallback`]
/// - Returns within the adapter's transport timeout
#[async_trait]
pub trait Readable: Send + Sync {
    /// Take one reading.
    async fn read(&self) -> Reading;
}

/// Capability: Scalar Setpoint
///
/// # Contract
/// - Best-effort; failures are logged and reported as [`Delivery::Dropped`]
/// - Does not read the value back
#[async_trait]
pub trait Writable: Send + Sync {
    /// Send a new setpoint.
    async fn write(&self, value: f64) -> Delivery;
}

/// Capability: Multi-channel Measurement
///
/// # Contract
/// - `read_all` always returns exactly `channel_count()` readings
/// - On failure every element is [`Reading::fallback`]
#[async_trait]
pub trait MultiChannelReadable: Send + Sync {
    /// Number of channels, fixed at configuration time.
    fn channel_count(&self) -> usize;

    /// Read every channel in order.
    async fn read_all(&self) -> Vec<Reading>;
}

/// Capability: Discrete State
///
/// Devices with a small set of named states (valve modes, output enable, gas selection).
///
/// # Contract
/// - `state` returns `None` when the state cannot be determined
/// - `set_state` is best-effort like [`Writable::write`]
#[async_trait]
pub trait StatefulDiscrete<S: Send + 'static>: Send + Sync {
    /// Current state, if it can be determined.
    async fn state(&self) -> Option<S>;

    /// Request a new state.
    async fn set_state(&self, state: S) -> Delivery;
}

/// Initialization status recorded once when an adapter is constructed.
pub trait Connection: Send + Sync {
    /// Human-readable adapter name used in logs.
    fn name(&self) -> &str;

    /// Whether the construction-time handshake succeeded.
    fn is_initialized(&self) -> bool;
}

fn parse_choice<T: Copy>(input: &str, choices: &[(&str, T)], what: &str) -> Result<T, String> {
    let needle = input.trim().to_ascii_lowercase();
    choices
        .iter()
        .find(|(name, _)| *name == needle)
        .map(|(_, value)| *value)
        .ok_or_else(|| format!("unknown {what} '{input}'"))
}

/// Flow-controller valve mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValveState {
    /// Valve fully open.
    Open,
    /// Valve closed.
    Closed,
    /// Valve regulating to the flow setpoint.
    Modulating,
}

impl fmt::Display for ValveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ValveState::Open => "open",
            ValveState::Closed => "closed",
            ValveState::Modulating => "modulating",
        })
    }
}

impl FromStr for ValveState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_choice(
            s,
            &[
                ("open", ValveState::Open),
                ("closed", ValveState::Closed),
                ("close", ValveState::Closed),
                ("modulating", ValveState::Modulating),
                ("regulate", ValveState::Modulating),
            ],
            "valve state",
        )
    }
}

/// Power-supply output enable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputState {
    /// Output energized.
    On,
    /// Output disabled.
    Off,
}

impl fmt::Display for OutputState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OutputState::On => "on",
            OutputState::Off => "off",
        })
    }
}

impl FromStr for OutputState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_choice(
            s,
            &[("on", OutputState::On), ("off", OutputState::Off)],
            "output state",
        )
    }
}

/// Gas calibration a vacuum gauge converts pressure for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GasType {
    /// Argon.
    Argon,
    /// Helium.
    Helium,
    /// Air / nitrogen.
    Air,
}

impl fmt::Display for GasType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GasType::Argon => "argon",
            GasType::Helium => "helium",
            GasType::Air => "air",
        })
    }
}

impl FromStr for GasType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_choice(
            s,
            &[
                ("argon", GasType::Argon),
                ("ar", GasType::Argon),
                ("helium", GasType::Helium),
                ("he", GasType::Helium),
                ("air", GasType::Air),
                ("n2", GasType::Air),
            ],
            "gas",
        )
    }
}
