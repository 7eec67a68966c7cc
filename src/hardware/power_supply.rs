//! SCPI Programmable Power Supply Driver
//!
//! Protocol Overview:
//! - Format: SCPI over a raw TCP socket (port 5025 by convention) or a serial line
//! - Terminator: LF (\n) both directions
//! - Handshake: `*IDN?`
//! - Queries: `MEASURE:VOLTAGE?`, `MEASURE:CURRENT?`, `MEASURE:POWER?`
//! - Setpoints: `VOLTAGE <v>`, `CURRENT <a>`, `POWER <w>`, `OUTPUT ON|OFF` (no reply)
//!
//! # Important Notes
//!
//! - Some supplies pad replies with NUL bytes; they are stripped before parsing
//! - Measurements are rounded to 2 decimals, the resolution shown to the operator
//! - Setpoints are recorded in the last-known state as soon as they are transmitted;
//!   there is no read-back
//!
//! # Example Usage
//!
//! ```no_run
//! use plm_daq::hardware::link::Endpoint;
//! use plm_daq::hardware::power_supply::{Quantity, ScpiPowerSupply};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let endpoint = Endpoint::Tcp { host: "192.168.0.21".into(), port: 5025 };
//! let cathode = ScpiPowerSupply::connect("cathode", endpoint, Duration::from_secs(1)).await;
//! let volts = cathode.measure(Quantity::Voltage).await;
//! println!("cathode: {} V (valid: {})", volts.value, volts.valid);
//! # }
//! ```

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::hardware::capabilities::{
    Connection, Delivery, OutputState, Readable, StatefulDiscrete, Writable,
};
use crate::hardware::link::{Endpoint, Link};
use crate::snapshot::{round2, Reading};

/// Electrical quantity a supply measures and regulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quantity {
    /// Volts.
    Voltage,
    /// Amperes.
    Current,
    /// Watts.
    Power,
}

impl Quantity {
    /// Lower-case name used in instrument keys.
    pub fn as_str(self) -> &'static str {
        match self {
            Quantity::Voltage => "voltage",
            Quantity::Current => "current",
            Quantity::Power => "power",
        }
    }

    fn measure_command(self) -> &'static str {
        match self {
            Quantity::Voltage => "MEASURE:VOLTAGE?",
            Quantity::Current => "MEASURE:CURRENT?",
            Quantity::Power => "MEASURE:POWER?",
        }
    }

    fn setpoint_command(self) -> &'static str {
        match self {
            Quantity::Voltage => "VOLTAGE",
            Quantity::Current => "CURRENT",
            Quantity::Power => "POWER",
        }
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last commanded state of a supply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SupplyState {
    /// Voltage setpoint.
    pub voltage: f64,
    /// Current setpoint.
    pub current: f64,
    /// Power setpoint.
    pub power: f64,
    /// Output enabled.
    pub output: bool,
}

impl SupplyState {
    fn record(&mut self, quantity: Quantity, value: f64) {
        match quantity {
            Quantity::Voltage => self.voltage = value,
            Quantity::Current => self.current = value,
            Quantity::Power => self.power = value,
        }
    }
}

/// Parse a SCPI numeric reply, tolerating NUL padding.
pub fn parse_measurement(raw: &str) -> Result<f64> {
    let trimmed = raw.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    if trimmed.is_empty() {
        bail!("empty reply");
    }
    let value: f64 = trimmed
        .parse()
        .with_context(|| format!("unparseable reply '{trimmed}'"))?;
    if !value.is_finite() {
        bail!("non-finite reply '{trimmed}'");
    }
    Ok(value)
}

/// Driver for an SCPI programmable power supply.
pub struct ScpiPowerSupply {
    name: String,
    link: Link,
    initialized: bool,
    identity: Option<String>,
    state: Mutex<SupplyState>,
}

impl ScpiPowerSupply {
    /// Connect and handshake once. Never fails: an unreachable supply comes back
    /// uninitialized and every operation on it returns the fallback.
    pub async fn connect(name: impl Into<String>, endpoint: Endpoint, timeout: Duration) -> Self {
        let name = name.into();
        let link = Link::new(name.clone(), endpoint, timeout);
        Self::handshake(name, link).await
    }

    /// Handshake over an existing link.
    pub async fn with_link(name: impl Into<String>, link: Link) -> Self {
        Self::handshake(name.into(), link).await
    }

    async fn handshake(name: String, link: Link) -> Self {
        let (initialized, identity) = match link.query_line(b"*IDN?\n", b'\n').await {
            Ok(idn) => {
                info!(device = %name, identity = %idn, "power supply initialized");
                (true, Some(idn))
            }
            Err(err) => {
                warn!(device = %name, error = %err, "power supply failed to initialize");
                (false, None)
            }
        };

        Self {
            name,
            link,
            initialized,
            identity,
            state: Mutex::new(SupplyState::default()),
        }
    }

    /// Reply to `*IDN?` received during the handshake.
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// Last commanded setpoints and output state.
    pub fn last_known_state(&self) -> SupplyState {
        *self.state.lock()
    }

    async fn query(&self, command: &str) -> Result<String> {
        self.link
            .query_line(format!("{command}\n").as_bytes(), b'\n')
            .await
    }

    async fn command(&self, command: &str) -> Result<()> {
        self.link.send(format!("{command}\n").as_bytes()).await
    }

    /// Measure one quantity. Faults yield the fallback reading.
    #[instrument(skip(self), fields(device = %self.name), level = "trace")]
    pub async fn measure(&self, quantity: Quantity) -> Reading {
        if !self.initialized {
            return Reading::fallback();
        }

        let result = match self.query(quantity.measure_command()).await {
            Ok(raw) => parse_measurement(&raw),
            Err(err) => Err(err),
        };

        match result {
            Ok(value) => Reading::ok(round2(value)),
            Err(err) => {
                warn!(device = %self.name, %quantity, error = %err, "measurement failed");
                Reading::fallback()
            }
        }
    }

    /// Send a setpoint. Recorded in the last-known state once transmitted.
    pub async fn set(&self, quantity: Quantity, value: f64) -> Delivery {
        if !self.initialized {
            debug!(device = %self.name, %quantity, "setpoint ignored, supply not initialized");
            return Delivery::Dropped;
        }

        match self
            .command(&format!("{} {}", quantity.setpoint_command(), value))
            .await
        {
            Ok(()) => {
                self.state.lock().record(quantity, value);
                Delivery::Transmitted
            }
            Err(err) => {
                warn!(device = %self.name, %quantity, value, error = %err, "setpoint not sent");
                Delivery::Dropped
            }
        }
    }

    /// Enable or disable the output.
    pub async fn set_output(&self, output: OutputState) -> Delivery {
        if !self.initialized {
            return Delivery::Dropped;
        }

        let command = match output {
            OutputState::On => "OUTPUT ON",
            OutputState::Off => "OUTPUT OFF",
        };
        match self.command(command).await {
            Ok(()) => {
                self.state.lock().output = output == OutputState::On;
                Delivery::Transmitted
            }
            Err(err) => {
                warn!(device = %self.name, %output, error = %err, "cannot switch output");
                Delivery::Dropped
            }
        }
    }

    /// A view of one quantity implementing `Readable + Writable`.
    pub fn channel(self: &Arc<Self>, quantity: Quantity) -> SupplyChannel {
        SupplyChannel {
            supply: Arc::clone(self),
            quantity,
        }
    }

    /// Close the transport.
    pub async fn shutdown(&self) {
        self.link.close().await;
    }
}

impl Connection for ScpiPowerSupply {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }
}

#[async_trait]
impl StatefulDiscrete<OutputState> for ScpiPowerSupply {
    async fn state(&self) -> Option<OutputState> {
        if !self.initialized {
            return None;
        }
        Some(if self.state.lock().output {
            OutputState::On
        } else {
            OutputState::Off
        })
    }

    async fn set_state(&self, state: OutputState) -> Delivery {
        self.set_output(state).await
    }
}

/// One quantity of a power supply.
pub struct SupplyChannel {
    supply: Arc<ScpiPowerSupply>,
    quantity: Quantity,
}

#[async_trait]
impl Readable for SupplyChannel {
    async fn read(&self) -> Reading {
        self.supply.measure(self.quantity).await
    }
}

#[async_trait]
impl Writable for SupplyChannel {
    async fn write(&self, value: f64) -> Delivery {
        self.supply.set(self.quantity, value).await
    }
}
