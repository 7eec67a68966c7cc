//! Mass-flow controller over Modbus RTU.
//!
//! Register map (holding registers, unit configurable):
//!
//! | Register | Meaning |
//! |----------|---------|
//! | 2        | Flags; bits 2/3 select the valve mode |
//! | 4        | Flow setpoint / measured flow, hundredths of a unit |
//!
//! Valve bits (bit 2, bit 3): `10` open, `01` closed, `00` modulating, `11` open.

use anyhow::{ensure, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::capabilities::{
    Connection, Delivery, Readable, StatefulDiscrete, ValveState, Writable,
};
use super::link::{Endpoint, Link};
use super::modbus::ModbusRtu;
use crate::snapshot::{round2, Reading};

const REGISTER_COUNT: u16 = 7;
const FLAGS_REGISTER: u16 = 2;
const FLOW_REGISTER: u16 = 4;
const OPEN_BIT: u16 = 1 << 2;
const CLOSED_BIT: u16 = 1 << 3;
const FLOW_SCALE: f64 = 100.0;

/// Decode the valve mode from the flags register.
pub fn decode_valve(flags: u16) -> ValveState {
    match (flags & OPEN_BIT != 0, flags & CLOSED_BIT != 0) {
        (true, _) => ValveState::Open,
        (false, true) => ValveState::Closed,
        (false, false) => ValveState::Modulating,
    }
}

/// Rewrite the valve bits of `flags`, leaving every other bit untouched.
pub fn encode_valve(flags: u16, state: ValveState) -> u16 {
    let cleared = flags & !(OPEN_BIT | CLOSED_BIT);
    match state {
        ValveState::Open => cleared | OPEN_BIT,
        ValveState::Closed => cleared | CLOSED_BIT,
        ValveState::Modulating => cleared,
    }
}

/// Convert a flow setpoint to its register value.
pub fn flow_to_register(value: f64) -> Result<u16> {
    ensure!(value.is_finite(), "flow setpoint must be finite");
    let scaled = (value * FLOW_SCALE).round();
    ensure!(
        (0.0..=f64::from(u16::MAX)).contains(&scaled),
        "flow setpoint {value} does not fit the flow register"
    );
    Ok(scaled as u16)
}

/// Mass-flow controller adapter.
pub struct FlowController {
    name: String,
    master: ModbusRtu,
    initialized: bool,
    setpoint: Mutex<f64>,
}

impl FlowController {
    /// Open the link once; the controller is initialized if the transport opens.
    ///
    /// When `zero_setpoint` is set the flow setpoint is written to zero right after
    /// connecting so the rig never starts with gas flowing.
    pub async fn connect(
        name: impl Into<String>,
        endpoint: Endpoint,
        unit: u8,
        timeout: Duration,
        zero_setpoint: bool,
    ) -> Self {
        let name = name.into();
        let link = Link::new(name.clone(), endpoint, timeout);
        Self::with_link(name, link, unit, zero_setpoint).await
    }

    /// Build over an existing link.
    pub async fn with_link(
        name: impl Into<String>,
        link: Link,
        unit: u8,
        zero_setpoint: bool,
    ) -> Self {
        let name = name.into();
        let initialized = match link.open().await {
            Ok(()) => {
                info!(device = %name, unit, "flow controller initialized");
                true
            }
            Err(err) => {
                warn!(device = %name, error = %err, "flow controller failed to initialize");
                false
            }
        };

        let controller = Self {
            name,
            master: ModbusRtu::new(link, unit),
            initialized,
            setpoint: Mutex::new(0.0),
        };

        if initialized && zero_setpoint {
            if let Err(err) = controller.master.write_register(FLOW_REGISTER, 0).await {
                warn!(device = %controller.name, error = %err, "cannot zero flow setpoint");
            }
        }
        controller
    }

    /// Last commanded flow setpoint.
    pub fn last_setpoint(&self) -> f64 {
        *self.setpoint.lock()
    }

    async fn registers(&self) -> Result<Vec<u16>> {
        let registers = self
            .master
            .read_holding_registers(0, REGISTER_COUNT)
            .await
            .context("reading holding registers")?;
        ensure!(
            registers.len() == REGISTER_COUNT as usize,
            "short register block"
        );
        Ok(registers)
    }

    /// Measured flow.
    pub async fn flow(&self) -> Reading {
        if !self.initialized {
            return Reading::fallback();
        }
        match self.registers().await {
            Ok(registers) => Reading::ok(round2(f64::from(registers[FLOW_REGISTER as usize]) / FLOW_SCALE)),
            Err(err) => {
                warn!(device = %self.name, error = %err, "flow read failed");
                Reading::fallback()
            }
        }
    }

    /// Send a new flow setpoint.
    pub async fn set_flow(&self, value: f64) -> Delivery {
        if !self.initialized {
            return Delivery::Dropped;
        }
        let result = match flow_to_register(value) {
            Ok(raw) => self.master.write_register(FLOW_REGISTER, raw).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => {
                *self.setpoint.lock() = value;
                debug!(device = %self.name, value, "flow setpoint sent");
                Delivery::Transmitted
            }
            Err(err) => {
                warn!(device = %self.name, value, error = %err, "flow setpoint not sent");
                Delivery::Dropped
            }
        }
    }

    async fn write_valve(&self, state: ValveState) -> Result<()> {
        let registers = self.registers().await?;
        let flags = encode_valve(registers[FLAGS_REGISTER as usize], state);
        self.master.write_register(FLAGS_REGISTER, flags).await
    }

    /// Change the valve mode. Closing the valve also zeroes the flow setpoint.
    pub async fn set_valve(&self, state: ValveState) -> Delivery {
        if !self.initialized {
            return Delivery::Dropped;
        }
        if let Err(err) = self.write_valve(state).await {
            warn!(device = %self.name, %state, error = %err, "valve change not sent");
            return Delivery::Dropped;
        }
        if state == ValveState::Closed {
            return self.set_flow(0.0).await;
        }
        Delivery::Transmitted
    }

    /// Close the transport.
    pub async fn shutdown(&self) {
        self.master.link().close().await;
    }
}

impl Connection for FlowController {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }
}

#[async_trait]
impl Readable for FlowController {
    async fn read(&self) -> Reading {
        self.flow().await
    }
}

#[async_trait]
impl Writable for FlowController {
    async fn write(&self, value: f64) -> Delivery {
        self.set_flow(value).await
    }
}

#[async_trait]
impl StatefulDiscrete<ValveState> for FlowController {
    async fn state(&self) -> Option<ValveState> {
        if !self.initialized {
            return None;
        }
        match self.registers().await {
            Ok(registers) => Some(decode_valve(registers[FLAGS_REGISTER as usize])),
            Err(err) => {
                warn!(device = %self.name, error = %err, "valve state read failed");
                None
            }
        }
    }

    async fn set_state(&self, state: ValveState) -> Delivery {
        self.set_valve(state).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::modbus::{crc16, READ_HOLDING_REGISTERS, WRITE_SINGLE_REGISTER};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// Register-file simulator speaking Modbus RTU on a duplex stream.
    fn simulator(mut host: DuplexStream, registers: Arc<Mutex<[u16; 7]>>) {
        tokio::spawn(async move {
            let mut request = [0u8; 8];
            while host.read_exact(&mut request).await.is_ok() {
                let unit = request[0];
                let address = u16::from_be_bytes([request[2], request[3]]);
                let operand = u16::from_be_bytes([request[4], request[5]]);
                let mut reply = vec![unit, request[1]];
                match request[1] {
                    READ_HOLDING_REGISTERS => {
                        reply.push((operand * 2) as u8);
                        let regs = registers.lock();
                        for value in &regs[address as usize..(address + operand) as usize] {
                            reply.extend_from_slice(&value.to_be_bytes());
                        }
                    }
                    WRITE_SINGLE_REGISTER => {
                        registers.lock()[address as usize] = operand;
                        reply.extend_from_slice(&request[2..6]);
                    }
                    _ => break,
                }
                let crc = crc16(&reply);
                reply.extend_from_slice(&crc.to_le_bytes());
                if host.write_all(&reply).await.is_err() {
                    break;
                }
            }
        });
    }

    async fn controller(initial: [u16; 7], zero: bool) -> (FlowController, Arc<Mutex<[u16; 7]>>) {
        let (host, device) = tokio::io::duplex(256);
        let registers = Arc::new(Mutex::new(initial));
        simulator(host, Arc::clone(&registers));
        let link = Link::attached("mfc", Box::new(device), Duration::from_millis(200));
        (FlowController::with_link("rrg", link, 1, zero).await, registers)
    }

    #[test]
    fn valve_bits_decode() {
        assert_eq!(decode_valve(0b0100), ValveState::Open);
        assert_eq!(decode_valve(0b1000), ValveState::Closed);
        assert_eq!(decode_valve(0b0000), ValveState::Modulating);
        assert_eq!(decode_valve(0b1100), ValveState::Open);
    }

    #[test]
    fn encode_preserves_other_bits() {
        assert_eq!(encode_valve(0b1_0001_1100, ValveState::Closed), 0b1_0001_1000);
        assert_eq!(encode_valve(0b1000, ValveState::Open), 0b0100);
        assert_eq!(encode_valve(0b1111, ValveState::Modulating), 0b0011);
    }

    #[test]
    fn flow_register_scaling() {
        assert_eq!(flow_to_register(1.5).unwrap(), 150);
        assert!(flow_to_register(-0.1).is_err());
        assert!(flow_to_register(1000.0).is_err());
    }

    #[tokio::test]
    async fn zeroes_setpoint_after_connect() {
        let (mfc, registers) = controller([0, 0, 0, 0, 1234, 0, 0], true).await;
        assert!(mfc.is_initialized());
        assert_eq!(registers.lock()[4], 0);
    }

    #[tokio::test]
    async fn reads_flow_in_units() {
        let (mfc, _) = controller([0, 0, 0, 0, 1234, 0, 0], false).await;
        assert_eq!(mfc.read().await, Reading::ok(12.34));
    }

    #[tokio::test]
    async fn closing_valve_zeroes_flow() {
        let (mfc, registers) = controller([0, 0, 0b1_0100, 0, 0, 0, 0], false).await;
        assert_eq!(mfc.write(2.5).await, Delivery::Transmitted);
        assert_eq!(registers.lock()[4], 250);

        assert_eq!(mfc.set_state(ValveState::Closed).await, Delivery::Transmitted);
        let regs = *registers.lock();
        assert_eq!(regs[2], 0b1_1000);
        assert_eq!(regs[4], 0);
        assert_eq!(mfc.last_setpoint(), 0.0);
        assert_eq!(mfc.state().await, Some(ValveState::Closed));
    }

    #[tokio::test]
    async fn dead_link_falls_back() {
        let (host, device) = tokio::io::duplex(64);
        drop(host);
        let link = Link::attached("mfc", Box::new(device), Duration::from_millis(50));
        let mfc = FlowController::with_link("rrg", link, 1, false).await;
        // The attached stream counts as connected; the first exchange fails.
        assert_eq!(mfc.read().await, Reading::fallback());
        assert_eq!(mfc.state().await, None);
    }
}
