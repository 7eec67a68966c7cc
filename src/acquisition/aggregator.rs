//! Sample Aggregator
//!
//! Samples every probe concurrently against one cycle deadline and assembles one
//! [`Snapshot`]. A read cut off by the deadline falls back for the keys it had not
//! produced yet; a probe that panics contributes fallbacks for all of its keys. The other
//! probes are unaffected.
//!
//! ```text
//!  probe A ─┐ spawn + deadline
//!  probe B ─┼──────────────────► join in order ─► clamp ─► T_cathode ─► Snapshot
//!  probe C ─┘
//! ```

use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::derived::{cathode_reading, clamp_thermocouple};
use super::probe::{Probe, ProbeOutput};
use crate::error::{AppResult, PlmError};
use crate::snapshot::Snapshot;

/// Key the derived cathode temperature is stored under.
pub const CATHODE_TEMPERATURE_KEY: &str = "T_cathode";

/// Inputs and constant for the derived cathode temperature.
#[derive(Debug, Clone, PartialEq)]
pub struct CathodeTemperature {
    /// Key of the cathode supply voltage.
    pub voltage_key: String,
    /// Key of the cathode supply current.
    pub current_key: String,
    /// Calibration constant `k`.
    pub calibration_k: f64,
}

impl CathodeTemperature {
    /// Standard cathode keys with calibration constant `k`.
    pub fn new(calibration_k: f64) -> Self {
        Self {
            voltage_key: "cathode_voltage".into(),
            current_key: "cathode_current".into(),
            calibration_k,
        }
    }
}

/// Concurrent, time-bounded sampler of all configured probes.
#[derive(Debug)]
pub struct SampleAggregator {
    probes: Vec<Probe>,
    read_timeout: Duration,
    cathode: Option<CathodeTemperature>,
    cycle: AtomicU64,
}

impl SampleAggregator {
    /// Register probes. Keys must be unique across probes; the cathode inputs, if
    /// configured, must be among them.
    pub fn new(
        probes: Vec<Probe>,
        read_timeout: Duration,
        cathode: Option<CathodeTemperature>,
    ) -> AppResult<Self> {
        let mut seen = BTreeSet::new();
        for key in probes.iter().flat_map(|p| p.keys()) {
            if key == CATHODE_TEMPERATURE_KEY || !seen.insert(key) {
                return Err(PlmError::Configuration(format!(
                    "instrument key '{key}' is defined more than once"
                )));
            }
        }
        if let Some(cathode) = &cathode {
            for key in [&cathode.voltage_key, &cathode.current_key] {
                if !seen.contains(key.as_str()) {
                    return Err(PlmError::Configuration(format!(
                        "{CATHODE_TEMPERATURE_KEY} needs '{key}', which no instrument provides"
                    )));
                }
            }
        }
        if read_timeout.is_zero() {
            return Err(PlmError::Configuration(
                "read timeout must be positive".into(),
            ));
        }

        Ok(Self {
            probes,
            read_timeout,
            cathode,
            cycle: AtomicU64::new(0),
        })
    }

    /// Budget every probe shares within one cycle.
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Every instrument key a snapshot carries, derived keys included.
    pub fn schema(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .probes
            .iter()
            .flat_map(|p| p.keys())
            .map(str::to_string)
            .collect();
        if self.cathode.is_some() {
            keys.push(CATHODE_TEMPERATURE_KEY.to_string());
        }
        keys.sort();
        keys
    }

    /// Total thermocouple channels per snapshot.
    pub fn channel_count(&self) -> usize {
        self.probes.iter().map(Probe::channel_count).sum()
    }

    /// Run one acquisition cycle.
    ///
    /// Returns within roughly one read timeout regardless of how many probes hang.
    #[instrument(skip(self), level = "debug")]
    pub async fn poll(&self) -> Snapshot {
        let cycle = self.cycle.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + self.read_timeout;

        let handles: Vec<_> = self
            .probes
            .iter()
            .map(|probe| {
                let probe = probe.clone();
                tokio::spawn(async move { probe.sample_until(deadline).await })
            })
            .collect();

        let mut instruments = BTreeMap::new();
        let mut thermocouples = BTreeMap::new();
        let mut next_channel = 0usize;

        for (probe, handle) in self.probes.iter().zip(handles) {
            let output = match handle.await {
                Ok(output) => output,
                Err(join_err) => {
                    warn!(probe = probe.name(), error = %join_err, "read task failed, using fallback");
                    probe.fallback()
                }
            };

            match output {
                ProbeOutput::Scalars(readings) => {
                    for (key, reading) in probe.keys().into_iter().zip(readings) {
                        instruments.insert(key.to_string(), reading);
                    }
                }
                ProbeOutput::Channels(readings) => {
                    for reading in readings {
                        thermocouples.insert(next_channel, clamp_thermocouple(reading));
                        next_channel += 1;
                    }
                }
            }
        }

        if let Some(cathode) = &self.cathode {
            let input = |key: &str| instruments.get(key).copied().unwrap_or_default();
            let t = cathode_reading(
                input(&cathode.voltage_key),
                input(&cathode.current_key),
                cathode.calibration_k,
            );
            instruments.insert(CATHODE_TEMPERATURE_KEY.to_string(), t);
        }

        let snapshot = Snapshot {
            cycle,
            timestamp: Utc::now(),
            instruments,
            thermocouples,
        };
        let faulted = snapshot.faulted_keys();
        if !faulted.is_empty() {
            debug!(cycle, ?faulted, "cycle completed with fallbacks");
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::capabilities::Readable;
    use crate::hardware::mock::{MockBehavior, MockScanner, MockSensor};
    use crate::snapshot::Reading;
    use std::sync::Arc;

    fn sensor(key: &str, value: f64) -> Probe {
        Probe::scalar(key, Arc::new(MockSensor::new(key, value)))
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let err = SampleAggregator::new(
            vec![sensor("pressure_1", 1.0), sensor("pressure_1", 2.0)],
            Duration::from_millis(100),
            None,
        )
        .unwrap_err();
        assert!(err.to_string().contains("pressure_1"));
    }

    #[test]
    fn cathode_inputs_must_exist() {
        let err = SampleAggregator::new(
            vec![sensor("cathode_voltage", 1.0)],
            Duration::from_millis(100),
            Some(CathodeTemperature::new(1.0)),
        )
        .unwrap_err();
        assert!(err.to_string().contains("cathode_current"));
    }

    #[tokio::test]
    async fn derives_cathode_temperature_from_snapshot_values() {
        let aggregator = SampleAggregator::new(
            vec![sensor("cathode_voltage", 10.0), sensor("cathode_current", 2.0)],
            Duration::from_millis(100),
            Some(CathodeTemperature::new(1.0)),
        )
        .unwrap();

        let snapshot = aggregator.poll().await;
        assert_eq!(snapshot.instruments["T_cathode"], Reading::ok(152.46));
        assert_eq!(
            aggregator.schema(),
            vec!["T_cathode", "cathode_current", "cathode_voltage"]
        );
    }

    #[tokio::test]
    async fn panicking_probe_falls_back_for_all_its_keys() {
        let bad = Arc::new(MockSensor::new("bad", 5.0).with_behavior(MockBehavior::Panic));
        let probe = Probe::scalars(
            "solenoid_1",
            vec![
                ("solenoid_voltage_1".into(), Arc::clone(&bad) as Arc<dyn Readable>),
                ("solenoid_current_1".into(), bad),
            ],
        );
        let aggregator = SampleAggregator::new(
            vec![probe, sensor("rrg_value", 1.5)],
            Duration::from_millis(100),
            None,
        )
        .unwrap();

        let snapshot = aggregator.poll().await;
        assert_eq!(snapshot.instruments["solenoid_voltage_1"], Reading::fallback());
        assert_eq!(snapshot.instruments["solenoid_current_1"], Reading::fallback());
        assert_eq!(snapshot.instruments["rrg_value"], Reading::ok(1.5));
    }

    #[tokio::test]
    async fn thermocouples_are_clamped_and_numbered_from_zero() {
        let aggregator = SampleAggregator::new(
            vec![Probe::channels(
                "thermocouples",
                Arc::new(MockScanner::new("tc", vec![10.0, 1500.0, 20.004])),
            )],
            Duration::from_millis(100),
            None,
        )
        .unwrap();

        let snapshot = aggregator.poll().await;
        assert_eq!(snapshot.thermocouple_series(), vec![10.0, 0.0, 20.0]);
        assert!(!snapshot.thermocouples[&1].valid);
        assert_eq!(aggregator.channel_count(), 3);
    }

    #[tokio::test]
    async fn cycle_numbers_increase() {
        let aggregator =
            SampleAggregator::new(vec![sensor("pressure_1", 1.0)], Duration::from_millis(100), None)
                .unwrap();
        assert_eq!(aggregator.poll().await.cycle, 0);
        assert_eq!(aggregator.poll().await.cycle, 1);
    }
}
