//! Operator commands.
//!
//! Commands arrive as text lines:
//!
//! ```text
//! set voltage cathode 24.5
//! set current sample -0.5
//! output discharge on
//! flow 12.5
//! valve modulating
//! gas pressure_2 argon
//! record start hollow-cathode-run
//! record stop
//! ```
//!
//! Setpoints are range-checked against the configured limits before anything is sent.
//! Writes are best-effort: a command the transport drops is logged and reported, never
//! retried.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{AppResult, PlmError};
use crate::fanout::storage::RecordingControl;
use crate::fanout::ExperimentInfo;
use crate::hardware::{
    Connection, Delivery, GasType, OutputState, Quantity, StatefulDiscrete, ValveState, Writable,
};
use crate::rig::PlmRig;

/// One parsed operator command.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    /// New setpoint for one supply quantity.
    Setpoint {
        /// Supply role.
        role: String,
        /// Regulated quantity.
        quantity: Quantity,
        /// Target value.
        value: f64,
    },
    /// Switch a supply output.
    Output {
        /// Supply role.
        role: String,
        /// Requested state.
        state: OutputState,
    },
    /// New flow setpoint.
    Flow(f64),
    /// New valve mode.
    Valve(ValveState),
    /// Gas correction of one gauge.
    Gas {
        /// Gauge key.
        gauge: String,
        /// Gas to correct for.
        gas: GasType,
    },
    /// Open a new experiment file and start recording.
    RecordStart {
        /// Experiment name.
        name: String,
    },
    /// Stop recording.
    RecordStop,
}

fn parse_quantity(word: &str) -> Result<Quantity, PlmError> {
    match word.to_ascii_lowercase().as_str() {
        "voltage" | "v" => Ok(Quantity::Voltage),
        "current" | "i" => Ok(Quantity::Current),
        "power" | "p" => Ok(Quantity::Power),
        other => Err(PlmError::InvalidCommand(format!("unknown quantity '{other}'"))),
    }
}

fn parse_value(word: &str) -> Result<f64, PlmError> {
    word.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| PlmError::InvalidCommand(format!("'{word}' is not a number")))
}

impl FromStr for ControlCommand {
    type Err = PlmError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let usage = || PlmError::InvalidCommand(format!("cannot parse '{}'", line.trim()));
        let choice = |e: String| PlmError::InvalidCommand(e);

        match words.as_slice() {
            ["set", quantity, role, value] => Ok(ControlCommand::Setpoint {
                role: (*role).to_string(),
                quantity: parse_quantity(quantity)?,
                value: parse_value(value)?,
            }),
            ["output", role, state] => Ok(ControlCommand::Output {
                role: (*role).to_string(),
                state: state.parse().map_err(choice)?,
            }),
            ["flow", value] => Ok(ControlCommand::Flow(parse_value(value)?)),
            ["valve", state] => Ok(ControlCommand::Valve(state.parse().map_err(choice)?)),
            ["gas", gauge, gas] => Ok(ControlCommand::Gas {
                gauge: (*gauge).to_string(),
                gas: gas.parse().map_err(choice)?,
            }),
            ["record", "start", name @ ..] if !name.is_empty() => Ok(ControlCommand::RecordStart {
                name: name.join(" "),
            }),
            ["record", "stop"] => Ok(ControlCommand::RecordStop),
            _ => Err(usage()),
        }
    }
}

/// What a command achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// An instrument command was attempted.
    Instrument(Delivery),
    /// Recording switched.
    Recording {
        /// Whether recording is now active.
        active: bool,
    },
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Instrument(Delivery::Transmitted) => f.write_str("sent"),
            Outcome::Instrument(Delivery::Dropped) => f.write_str("dropped"),
            Outcome::Recording { active: true } => f.write_str("recording"),
            Outcome::Recording { active: false } => f.write_str("recording stopped"),
        }
    }
}

fn check_range(target: String, value: f64, min: f64, max: f64) -> AppResult<()> {
    if value < min || value > max {
        return Err(PlmError::SetpointOutOfRange {
            target,
            value,
            min,
            max,
        });
    }
    Ok(())
}

fn require(name: &str, initialized: bool) -> AppResult<()> {
    if initialized {
        Ok(())
    } else {
        Err(PlmError::InstrumentUnavailable(name.to_string()))
    }
}

fn delivered(target: &str, delivery: Delivery) -> Outcome {
    match delivery {
        Delivery::Transmitted => info!(%target, "command sent"),
        Delivery::Dropped => warn!(%target, "command dropped by the transport"),
    }
    Outcome::Instrument(delivery)
}

/// Applies operator commands to the rig.
pub struct Controller {
    rig: Arc<PlmRig>,
    recording: Option<RecordingControl>,
}

impl Controller {
    /// Controller for `rig`, without recording.
    pub fn new(rig: Arc<PlmRig>) -> Self {
        Self {
            rig,
            recording: None,
        }
    }

    /// Route record commands to `control`.
    pub fn with_recording(mut self, control: RecordingControl) -> Self {
        self.recording = Some(control);
        self
    }

    /// Parse and apply one text line.
    pub async fn apply_line(&self, line: &str) -> AppResult<Outcome> {
        self.apply(line.parse()?).await
    }

    /// Apply one command.
    pub async fn apply(&self, command: ControlCommand) -> AppResult<Outcome> {
        match command {
            ControlCommand::Setpoint {
                role,
                quantity,
                value,
            } => {
                let supply = self.rig.supply(&role).ok_or_else(|| {
                    PlmError::InvalidCommand(format!("no power supply '{role}'"))
                })?;
                let target = format!("{role} {quantity}");
                let max = supply.limits.max(quantity);
                let min = if supply.bipolar && quantity != Quantity::Power {
                    -max
                } else {
                    0.0
                };
                check_range(target.clone(), value, min, max)?;
                require(&role, supply.connection().is_initialized())?;
                let writer = supply.writer(quantity).ok_or_else(|| {
                    PlmError::InvalidCommand(format!("{role} has no {quantity} setpoint"))
                })?;
                Ok(delivered(&target, writer.write(value).await))
            }
            ControlCommand::Output { role, state } => {
                let supply = self.rig.supply(&role).ok_or_else(|| {
                    PlmError::InvalidCommand(format!("no power supply '{role}'"))
                })?;
                require(&role, supply.connection().is_initialized())?;
                let delivery = supply.output().set_state(state).await;
                Ok(delivered(&format!("{role} output {state}"), delivery))
            }
            ControlCommand::Flow(value) => {
                let flow = self.flow()?;
                check_range("flow".into(), value, 0.0, flow.max_flow)?;
                require(flow.connection().name(), flow.connection().is_initialized())?;
                Ok(delivered("flow", flow.writer().write(value).await))
            }
            ControlCommand::Valve(state) => {
                let flow = self.flow()?;
                require(flow.connection().name(), flow.connection().is_initialized())?;
                let delivery = flow.valve().set_state(state).await;
                Ok(delivered(&format!("valve {state}"), delivery))
            }
            ControlCommand::Gas { gauge, gas } => {
                let port = self.rig.gauge(&gauge).ok_or_else(|| {
                    PlmError::InvalidCommand(format!("no gauge '{gauge}'"))
                })?;
                require(&gauge, port.connection().is_initialized())?;
                let delivery = port.gas().set_state(gas).await;
                Ok(delivered(&format!("{gauge} gas {gas}"), delivery))
            }
            ControlCommand::RecordStart { name } => {
                self.recording()?.start(ExperimentInfo::new(name)).await?;
                Ok(Outcome::Recording { active: true })
            }
            ControlCommand::RecordStop => {
                self.recording()?.stop().await?;
                Ok(Outcome::Recording { active: false })
            }
        }
    }

    fn flow(&self) -> AppResult<&crate::rig::FlowPort> {
        self.rig
            .flow()
            .ok_or_else(|| PlmError::InvalidCommand("no flow controller configured".into()))
    }

    fn recording(&self) -> AppResult<&RecordingControl> {
        self.recording
            .as_ref()
            .ok_or_else(|| PlmError::InvalidCommand("recording is not available".into()))
    }
}
