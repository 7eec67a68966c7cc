//! Readings and snapshots flowing through the acquisition pipeline.
//!
//! A [`Reading`] is the result of one adapter operation: a value plus a validity flag, so
//! a fallback substituted after a fault stays distinguishable from a real zero all the way
//! to the consumers. A [`Snapshot`] is the set of readings produced by one poll cycle,
//! stamped once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Value substituted when a real reading cannot be obtained.
pub const FALLBACK_VALUE: f64 = 0.0;

/// One numeric reading and whether the adapter judged it successful.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Measured value; unit implied by the key it is stored under.
    pub value: f64,
    /// `false` when `value` is the fallback after a fault.
    pub valid: bool,
}

impl Reading {
    /// A successful reading.
    pub fn ok(value: f64) -> Self {
        Self { value, valid: true }
    }

    /// The fallback reading after a fault.
    pub fn fallback() -> Self {
        Self {
            value: FALLBACK_VALUE,
            valid: false,
        }
    }
}

impl Default for Reading {
    fn default() -> Self {
        Self::fallback()
    }
}

/// Round to two decimal places, the resolution every displayed value uses.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Label used for thermocouple channel `index` on the bus and in stored records.
pub fn channel_label(index: usize) -> String {
    format!("CH{index}")
}

/// One complete, time-consistent set of readings from all instruments for a single cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    /// Sequence number of the cycle that produced this snapshot.
    pub cycle: u64,
    /// Instant shared by every reading in the snapshot.
    pub timestamp: DateTime<Utc>,
    /// Instrument key to reading. The key set is fixed by configuration.
    pub instruments: BTreeMap<String, Reading>,
    /// Thermocouple channel index to reading.
    pub thermocouples: BTreeMap<usize, Reading>,
}

impl Snapshot {
    /// Timestamp as fractional seconds since the Unix epoch.
    pub fn timestamp_secs(&self) -> f64 {
        self.timestamp.timestamp_micros() as f64 / 1e6
    }

    /// Value of one instrument key, if the key is part of the schema.
    pub fn value(&self, key: &str) -> Option<f64> {
        self.instruments.get(key).map(|r| r.value)
    }

    /// Plain instrument values, validity dropped.
    pub fn instrument_values(&self) -> BTreeMap<String, f64> {
        self.instruments
            .iter()
            .map(|(k, r)| (k.clone(), r.value))
            .collect()
    }

    /// Plain thermocouple values keyed by channel label (`CH0`, `CH1`, ...).
    pub fn thermocouple_values(&self) -> BTreeMap<String, f64> {
        self.thermocouples
            .iter()
            .map(|(i, r)| (channel_label(*i), r.value))
            .collect()
    }

    /// Thermocouple values in channel order.
    pub fn thermocouple_series(&self) -> Vec<f64> {
        self.thermocouples.values().map(|r| r.value).collect()
    }

    /// Keys whose reading is a fallback this cycle.
    pub fn faulted_keys(&self) -> Vec<&str> {
        self.instruments
            .iter()
            .filter(|(_, r)| !r.valid)
            .map(|(k, _)| k.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> Snapshot {
        let mut instruments = BTreeMap::new();
        instruments.insert("pressure_1".to_string(), Reading::ok(1.5e-3));
        instruments.insert("rrg_value".to_string(), Reading::fallback());
        let mut thermocouples = BTreeMap::new();
        thermocouples.insert(0, Reading::ok(21.5));
        thermocouples.insert(1, Reading::fallback());
        Snapshot {
            cycle: 3,
            timestamp: DateTime::from_timestamp(1_700_000_000, 250_000_000).unwrap_or_default(),
            instruments,
            thermocouples,
        }
    }

    #[test]
    fn round2_matches_display_resolution() {
        assert_eq!(round2(12.345_6), 12.35);
        assert_eq!(round2(-0.004), -0.0);
        assert_eq!(round2(153.456_000_1), 153.46);
    }

    #[test]
    fn fallback_is_zero_and_invalid() {
        let r = Reading::fallback();
        assert_eq!(r.value, 0.0);
        assert!(!r.valid);
        assert_eq!(Reading::default(), r);
    }

    #[test]
    fn thermocouple_values_use_channel_labels() {
        let values = snapshot().thermocouple_values();
        assert_eq!(values.get("CH0"), Some(&21.5));
        assert_eq!(values.get("CH1"), Some(&0.0));
    }

    #[test]
    fn timestamp_secs_keeps_fraction() {
        assert!((snapshot().timestamp_secs() - 1_700_000_000.25).abs() < 1e-6);
    }

    #[test]
    fn faulted_keys_lists_fallbacks() {
        assert_eq!(snapshot().faulted_keys(), vec!["rrg_value"]);
    }
}
