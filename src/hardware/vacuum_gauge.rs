//! ERSTEVAK vacuum gauge driver.
//!
//! Protocol Overview:
//! - Format: ASCII, `"{address:03}{command}" + checksum + CR`
//! - Checksum: one character, `(sum of command bytes % 64) + 64`
//! - Measurement: command `M`; the reply carries a 4-digit mantissa at characters 4..8
//!   (thousandths) and a 2-digit exponent at 8..10 (offset by 20), in mbar
//! - Gas correction: `c1`/`c2` select a sensor channel, followed by the gas code
//!
//! Readings are converted to Torr before leaving the driver.

use anyhow::{anyhow, ensure, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::capabilities::{Connection, Delivery, GasType, Readable, StatefulDiscrete};
use super::link::{Endpoint, Link};
use crate::snapshot::Reading;

const MBAR_TO_TORR: f64 = 0.75;
const GAS_STEP_DELAY: Duration = Duration::from_millis(200);
const STALE_QUIET: Duration = Duration::from_millis(5);

/// Sensor principle, which decides how many channels a gas change touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GaugeKind {
    /// Single Pirani sensor.
    Pirani,
    /// Combined Pirani and ionization sensor.
    Ionization,
}

impl fmt::Display for GaugeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GaugeKind::Pirani => "pirani",
            GaugeKind::Ionization => "ionization",
        })
    }
}

impl GaugeKind {
    fn gas_channels(self) -> &'static [&'static str] {
        match self {
            GaugeKind::Pirani => &["c1"],
            GaugeKind::Ionization => &["c1", "c2"],
        }
    }
}

fn gas_code(gas: GasType) -> &'static str {
    match gas {
        GasType::Argon => "c000160",
        GasType::Helium | GasType::Air => "c000100",
    }
}

/// Checksum character over the address and command.
pub fn checksum(body: &[u8]) -> u8 {
    let sum: u32 = body.iter().map(|&b| u32::from(b)).sum();
    (sum % 64) as u8 + 64
}

/// Full command frame for `address`.
pub fn command_frame(address: u8, command: &str) -> Vec<u8> {
    let mut frame = format!("{address:03}{command}").into_bytes();
    frame.push(checksum(&frame));
    frame.push(b'\r');
    frame
}

/// Decode a measurement reply into Torr.
pub fn parse_pressure(reply: &str) -> Result<f64> {
    let mantissa = reply
        .get(4..8)
        .ok_or_else(|| anyhow!("reply '{reply}' too short for mantissa"))?;
    let exponent = reply
        .get(8..10)
        .ok_or_else(|| anyhow!("reply '{reply}' too short for exponent"))?;
    let mantissa: f64 = mantissa
        .parse::<u32>()
        .with_context(|| format!("bad mantissa in '{reply}'"))?
        .into();
    let exponent: i32 = exponent
        .parse::<i32>()
        .with_context(|| format!("bad exponent in '{reply}'"))?;
    let mbar = mantissa / 1000.0 * 10f64.powi(exponent - 20);
    ensure!(mbar.is_finite(), "pressure out of range in '{reply}'");
    Ok(mbar * MBAR_TO_TORR)
}

/// One ERSTEVAK gauge on a link.
pub struct VacuumGauge {
    name: String,
    link: Link,
    address: u8,
    kind: GaugeKind,
    initialized: bool,
    gas: Mutex<Option<GasType>>,
}

impl VacuumGauge {
    /// Open the link once; the gauge is initialized if the transport opens.
    pub async fn connect(
        name: impl Into<String>,
        endpoint: Endpoint,
        address: u8,
        kind: GaugeKind,
        timeout: Duration,
    ) -> Self {
        let name = name.into();
        let link = Link::new(name.clone(), endpoint, timeout);
        Self::with_link(name, link, address, kind).await
    }

    /// Build over an existing link.
    pub async fn with_link(name: impl Into<String>, link: Link, address: u8, kind: GaugeKind) -> Self {
        let name = name.into();
        let initialized = match link.open().await {
            Ok(()) => {
                info!(device = %name, address, %kind, "vacuum gauge initialized");
                true
            }
            Err(err) => {
                warn!(device = %name, error = %err, "vacuum gauge failed to initialize");
                false
            }
        };
        Self {
            name,
            link,
            address,
            kind,
            initialized,
            gas: Mutex::new(None),
        }
    }

    /// Sensor principle.
    pub fn kind(&self) -> GaugeKind {
        self.kind
    }

    /// Pressure in Torr.
    pub async fn pressure(&self) -> Reading {
        if !self.initialized {
            return Reading::fallback();
        }
        self.link.discard_pending(STALE_QUIET).await;
        let result = match self
            .link
            .query_line(&command_frame(self.address, "M"), b'\r')
            .await
        {
            Ok(reply) => parse_pressure(&reply),
            Err(err) => Err(err),
        };
        match result {
            Ok(torr) => Reading::ok(torr),
            Err(err) => {
                warn!(device = %self.name, error = %err, "pressure read failed");
                Reading::fallback()
            }
        }
    }

    async fn send_gas(&self, gas: GasType) -> Result<()> {
        let code = gas_code(gas);
        for channel in self.kind.gas_channels() {
            self.link.send(&command_frame(self.address, channel)).await?;
            tokio::time::sleep(GAS_STEP_DELAY).await;
            self.link.send(&command_frame(self.address, code)).await?;
            tokio::time::sleep(GAS_STEP_DELAY).await;
        }
        // The gauge acknowledges each step; nobody needs those replies.
        let discarded = self.link.discard_pending(STALE_QUIET).await;
        debug!(device = %self.name, discarded, "gas acknowledgements discarded");
        Ok(())
    }

    /// Select the gas the gauge corrects for.
    pub async fn set_gas(&self, gas: GasType) -> Delivery {
        if !self.initialized {
            return Delivery::Dropped;
        }
        match self.send_gas(gas).await {
            Ok(()) => {
                *self.gas.lock() = Some(gas);
                info!(device = %self.name, %gas, "gas correction selected");
                Delivery::Transmitted
            }
            Err(err) => {
                warn!(device = %self.name, %gas, error = %err, "gas selection not sent");
                Delivery::Dropped
            }
        }
    }

    /// Close the transport.
    pub async fn shutdown(&self) {
        self.link.close().await;
    }
}

impl Connection for VacuumGauge {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }
}

#[async_trait]
impl Readable for VacuumGauge {
    async fn read(&self) -> Reading {
        self.pressure().await
    }
}

#[async_trait]
impl StatefulDiscrete<GasType> for VacuumGauge {
    /// Last gas selected through this adapter; the gauge has no query for it.
    async fn state(&self) -> Option<GasType> {
        *self.gas.lock()
    }

    async fn set_state(&self, gas: GasType) -> Delivery {
        self.set_gas(gas).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::testing::{fake_instrument, Script};

    fn strip_frame(line: &str) -> &str {
        // drop address and checksum
        &line[3..line.len() - 1]
    }

    #[test]
    fn command_frame_layout() {
        let frame = command_frame(1, "M");
        // '0'+'0'+'1'+'M' = 48+48+49+77 = 222; 222 % 64 = 30; 30 + 64 = 94 = '^'
        assert_eq!(frame, b"001M^\r".to_vec());
    }

    #[test]
    fn parse_pressure_converts_to_torr() {
        // 1.234e-3 mbar
        let torr = parse_pressure("001M123417X").unwrap();
        assert!((torr - 1.234e-3 * 0.75).abs() < 1e-12);
        assert!(parse_pressure("001M12").is_err());
        assert!(parse_pressure("001Mabcd17").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn ionization_gauge_sets_both_channels() {
        let (link, log) = fake_instrument("gauge", b'\r', Script::new(|_| None));
        let gauge = VacuumGauge::with_link("pressure_2", link, 2, GaugeKind::Ionization).await;

        assert_eq!(gauge.set_state(GasType::Argon).await, Delivery::Transmitted);
        let sent: Vec<String> = log.lines().iter().map(|l| strip_frame(l).to_string()).collect();
        assert_eq!(sent, vec!["c1", "c000160", "c2", "c000160"]);
        assert_eq!(gauge.state().await, Some(GasType::Argon));
    }

    #[tokio::test]
    async fn pressure_read_over_link() {
        let (link, log) = fake_instrument(
            "gauge",
            b'\r',
            Script::new(|line| line.starts_with("003M").then(|| "003M500020Z".to_string())),
        );
        let gauge = VacuumGauge::with_link("pressure_3", link, 3, GaugeKind::Pirani).await;

        let reading = gauge.read().await;
        assert!(reading.valid);
        assert!((reading.value - 5.0 * 0.75).abs() < 1e-9);
        assert_eq!(log.lines().len(), 1);
    }

    #[tokio::test]
    async fn silent_gauge_falls_back() {
        let (link, _log) = fake_instrument("gauge", b'\r', Script::new(|_| None));
        let gauge = VacuumGauge::with_link("pressure_1", link, 1, GaugeKind::Pirani).await;
        assert_eq!(gauge.read().await, Reading::fallback());
    }
}
