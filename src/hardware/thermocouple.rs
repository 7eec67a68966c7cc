//! Multi-channel thermocouple scanner (SCPI).
//!
//! One `MEAS:TEMP? TC,<type>,(@<start>:<stop>)` query returns every channel of the
//! configured range as a comma-separated list. Values are passed through raw; the
//! aggregator applies the open-circuit clamp.

use anyhow::{ensure, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

use super::capabilities::{Connection, MultiChannelReadable};
use super::link::{Endpoint, Link};
use crate::snapshot::Reading;

/// Thermocouple junction type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum ThermocoupleType {
    #[default]
    K,
    J,
    B,
    E,
    N,
    R,
    S,
    T,
}

impl fmt::Display for ThermocoupleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Temperature unit the scanner reports in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TemperatureUnit {
    /// Degrees Celsius.
    #[default]
    #[serde(rename = "C")]
    Celsius,
    /// Kelvin.
    #[serde(rename = "K")]
    Kelvin,
}

impl TemperatureUnit {
    fn scpi(self) -> &'static str {
        match self {
            TemperatureUnit::Celsius => "C",
            TemperatureUnit::Kelvin => "K",
        }
    }
}

/// Parse a comma-separated reading list of exactly `expected` values.
pub fn parse_channels(reply: &str, expected: usize) -> Result<Vec<f64>> {
    let values = reply
        .split(',')
        .map(|field| {
            let field = field.trim();
            let value = field
                .parse::<f64>()
                .with_context(|| format!("bad channel value '{field}'"))?;
            ensure!(value.is_finite(), "non-finite channel value '{field}'");
            Ok(value)
        })
        .collect::<Result<Vec<_>>>()?;
    ensure!(
        values.len() == expected,
        "expected {expected} channels, got {}",
        values.len()
    );
    Ok(values)
}

/// SCPI thermocouple scanner covering channels `start..=stop`.
pub struct ThermocoupleScanner {
    name: String,
    link: Link,
    initialized: bool,
    channel_start: u32,
    channel_stop: u32,
    kind: ThermocoupleType,
}

impl ThermocoupleScanner {
    /// Connect, handshake and set the reporting unit.
    pub async fn connect(
        name: impl Into<String>,
        endpoint: Endpoint,
        timeout: Duration,
        channels: (u32, u32),
        kind: ThermocoupleType,
        unit: TemperatureUnit,
    ) -> Self {
        let name = name.into();
        let link = Link::new(name.clone(), endpoint, timeout);
        Self::with_link(name, link, channels, kind, unit).await
    }

    /// Build over an existing link.
    pub async fn with_link(
        name: impl Into<String>,
        link: Link,
        (channel_start, channel_stop): (u32, u32),
        kind: ThermocoupleType,
        unit: TemperatureUnit,
    ) -> Self {
        let name = name.into();
        let initialized = match Self::handshake(&link, unit).await {
            Ok(idn) => {
                info!(device = %name, identity = %idn, channel_start, channel_stop, %kind, "thermocouple scanner initialized");
                true
            }
            Err(err) => {
                warn!(device = %name, error = %err, "thermocouple scanner failed to initialize");
                false
            }
        };
        Self {
            name,
            link,
            initialized,
            channel_start,
            channel_stop,
            kind,
        }
    }

    async fn handshake(link: &Link, unit: TemperatureUnit) -> Result<String> {
        let idn = link.query_line(b"*IDN?\n", b'\n').await?;
        link.send(format!("UNIT:TEMP {}\n", unit.scpi()).as_bytes())
            .await?;
        Ok(idn)
    }

    async fn measure(&self) -> Result<Vec<f64>> {
        let query = format!(
            "MEAS:TEMP? TC,{},(@{}:{})\n",
            self.kind, self.channel_start, self.channel_stop
        );
        let reply = self.link.query_line(query.as_bytes(), b'\n').await?;
        parse_channels(&reply, self.channel_count())
    }

    /// Close the transport.
    pub async fn shutdown(&self) {
        self.link.close().await;
    }
}

impl Connection for ThermocoupleScanner {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }
}

#[async_trait]
impl MultiChannelReadable for ThermocoupleScanner {
    fn channel_count(&self) -> usize {
        self.channel_stop.saturating_sub(self.channel_start) as usize + 1
    }

    async fn read_all(&self) -> Vec<Reading> {
        let count = self.channel_count();
        if !self.initialized {
            return vec![Reading::fallback(); count];
        }
        match self.measure().await {
            Ok(values) => values.into_iter().map(Reading::ok).collect(),
            Err(err) => {
                warn!(device = %self.name, error = %err, "thermocouple scan failed");
                vec![Reading::fallback(); count]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::testing::{fake_line_instrument, Script};

    #[test]
    fn parse_channels_requires_exact_count() {
        assert_eq!(parse_channels("1.5, 2.0,3", 3).unwrap(), vec![1.5, 2.0, 3.0]);
        assert!(parse_channels("1.5,2.0", 3).is_err());
        assert!(parse_channels("1.5,x,3", 3).is_err());
        assert!(parse_channels("1.5,nan,3", 3).is_err());
        assert!(parse_channels("inf,2.0,3", 3).is_err());
    }

    #[tokio::test]
    async fn scans_configured_range() {
        let (link, log) = fake_line_instrument(
            "tc",
            Script::new(|line| match line {
                "*IDN?" => Some("ACME,TC-8,7,2.1".into()),
                l if l.starts_with("MEAS:TEMP?") => Some("+2.150E+01,+1.500E+03,+2.000E+01".into()),
                _ => None,
            }),
        );
        let scanner = ThermocoupleScanner::with_link(
            "thermocouples",
            link,
            (101, 103),
            ThermocoupleType::J,
            TemperatureUnit::Kelvin,
        )
        .await;

        assert!(scanner.is_initialized());
        assert_eq!(scanner.channel_count(), 3);
        let readings = scanner.read_all().await;
        assert_eq!(
            readings,
            vec![Reading::ok(21.5), Reading::ok(1500.0), Reading::ok(20.0)]
        );
        assert_eq!(
            log.lines(),
            vec!["*IDN?", "UNIT:TEMP K", "MEAS:TEMP? TC,J,(@101:103)"]
        );
    }

    #[tokio::test]
    async fn short_reply_falls_back_for_every_channel() {
        let (link, _log) = fake_line_instrument(
            "tc",
            Script::new(|line| match line {
                "*IDN?" => Some("ACME,TC-8,7,2.1".into()),
                l if l.starts_with("MEAS:TEMP?") => Some("21.5".into()),
                _ => None,
            }),
        );
        let scanner = ThermocoupleScanner::with_link(
            "thermocouples",
            link,
            (0, 3),
            ThermocoupleType::K,
            TemperatureUnit::Celsius,
        )
        .await;
        assert_eq!(scanner.read_all().await, vec![Reading::fallback(); 4]);
    }
}
