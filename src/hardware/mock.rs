//! Mock Hardware Implementations
//!
//! Provides simulated instruments for running the rig without hardware and for testing
//! the acquisition pipeline. All mock devices use async-safe operations
//! (tokio::time::sleep, not std::thread::sleep).
//!
//! # Available Mocks
//!
//! - `MockSensor` - Scalar instrument (`Readable + Writable`) with latency and noise
//! - `MockScanner` - Multi-channel instrument (`MultiChannelReadable`)
//! - `MockSwitch` - Discrete-state device (`StatefulDiscrete<S>`)
//!
//! Every mock can be switched to a [`MockBehavior`] at runtime to reproduce a failing,
//! hanging or panicking instrument.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};

use crate::hardware::capabilities::{
    Connection, Delivery, MultiChannelReadable, Readable, StatefulDiscrete, Writable,
};
use crate::snapshot::Reading;

/// How a mock instrument responds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MockBehavior {
    /// Answer normally.
    #[default]
    Healthy,
    /// Report a contained fault (fallback reading, dropped write).
    Fail,
    /// Never answer.
    Hang,
    /// Panic inside the read.
    Panic,
}

#[allow(clippy::panic)]
async fn misbehave(behavior: MockBehavior, name: &str) {
    match behavior {
        MockBehavior::Hang => std::future::pending::<()>().await,
        MockBehavior::Panic => panic!("{name}: simulated driver panic"),
        MockBehavior::Healthy | MockBehavior::Fail => {}
    }
}

fn jitter(noise: f64) -> f64 {
    if noise <= 0.0 {
        return 1.0;
    }
    1.0 + rand::thread_rng().gen_range(-noise..=noise)
}

// =============================================================================
// MockSensor - Simulated Scalar Instrument
// =============================================================================

/// Mock scalar instrument with simulated readings
///
/// Simulates an instrument with:
/// - Configurable base value, changed by writes
/// - Fixed response latency
/// - Optional relative noise (`0.01` = +/-1%)
///
/// # Example
///
/// ```rust,ignore
/// let psu = MockSensor::new("cathode_voltage", 12.34);
/// assert_eq!(psu.read().await.value, 12.34);
/// ```
pub struct MockSensor {
    name: String,
    base: RwLock<f64>,
    latency: Duration,
    noise: f64,
    behavior: Mutex<MockBehavior>,
    reads: AtomicU64,
}

impl MockSensor {
    /// Noise-free, zero-latency sensor.
    pub fn new(name: impl Into<String>, base: f64) -> Self {
        Self {
            name: name.into(),
            base: RwLock::new(base),
            latency: Duration::ZERO,
            noise: 0.0,
            behavior: Mutex::new(MockBehavior::Healthy),
            reads: AtomicU64::new(0),
        }
    }

    /// Delay every read by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Add relative noise to every read.
    pub fn with_noise(mut self, noise: f64) -> Self {
        self.noise = noise;
        self
    }

    /// Start with `behavior`.
    pub fn with_behavior(self, behavior: MockBehavior) -> Self {
        *self.behavior.lock() = behavior;
        self
    }

    /// Switch behavior at runtime.
    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self.behavior.lock() = behavior;
    }

    /// Current base value.
    pub async fn base(&self) -> f64 {
        *self.base.read().await
    }

    /// Number of reads started.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }
}

impl Connection for MockSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_initialized(&self) -> bool {
        true
    }
}

#[async_trait]
impl Readable for MockSensor {
    async fn read(&self) -> Reading {
        self.reads.fetch_add(1, Ordering::Relaxed);
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }

        let behavior = *self.behavior.lock();
        misbehave(behavior, &self.name).await;
        if behavior == MockBehavior::Fail {
            return Reading::fallback();
        }

        let base = *self.base.read().await;
        Reading::ok(base * jitter(self.noise))
    }
}

#[async_trait]
impl Writable for MockSensor {
    async fn write(&self, value: f64) -> Delivery {
        if *self.behavior.lock() != MockBehavior::Healthy {
            return Delivery::Dropped;
        }
        *self.base.write().await = value;
        Delivery::Transmitted
    }
}

// =============================================================================
// MockScanner - Simulated Multi-channel Instrument
// =============================================================================

/// Mock multi-channel instrument returning fixed per-channel values.
pub struct MockScanner {
    name: String,
    channels: usize,
    values: RwLock<Vec<f64>>,
    latency: Duration,
    noise: f64,
    behavior: Mutex<MockBehavior>,
}

impl MockScanner {
    /// Scanner reporting `values`, one per channel.
    pub fn new(name: impl Into<String>, values: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            channels: values.len(),
            values: RwLock::new(values),
            latency: Duration::ZERO,
            noise: 0.0,
            behavior: Mutex::new(MockBehavior::Healthy),
        }
    }

    /// Delay every scan by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Add relative noise to every channel.
    pub fn with_noise(mut self, noise: f64) -> Self {
        self.noise = noise;
        self
    }

    /// Switch behavior at runtime.
    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self.behavior.lock() = behavior;
    }

    /// Replace the channel values. The channel count must not change.
    pub async fn set_values(&self, values: Vec<f64>) {
        if values.len() == self.channels {
            *self.values.write().await = values;
        }
    }
}

impl Connection for MockScanner {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_initialized(&self) -> bool {
        true
    }
}

#[async_trait]
impl MultiChannelReadable for MockScanner {
    fn channel_count(&self) -> usize {
        self.channels
    }

    async fn read_all(&self) -> Vec<Reading> {
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }
        let behavior = *self.behavior.lock();
        misbehave(behavior, &self.name).await;

        let values = self.values.read().await;
        if behavior == MockBehavior::Fail {
            return vec![Reading::fallback(); values.len()];
        }
        values
            .iter()
            .map(|v| Reading::ok(v * jitter(self.noise)))
            .collect()
    }
}

// =============================================================================
// MockSwitch - Simulated Discrete-state Device
// =============================================================================

/// Mock discrete-state device remembering the last requested state.
pub struct MockSwitch<S> {
    state: Mutex<Option<S>>,
    behavior: Mutex<MockBehavior>,
}

impl<S: Copy + Send + 'static> MockSwitch<S> {
    /// Switch starting in `initial`.
    pub fn new(initial: Option<S>) -> Self {
        Self {
            state: Mutex::new(initial),
            behavior: Mutex::new(MockBehavior::Healthy),
        }
    }

    /// Switch behavior at runtime.
    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self.behavior.lock() = behavior;
    }
}

#[async_trait]
impl<S: Copy + Send + 'static> StatefulDiscrete<S> for MockSwitch<S> {
    async fn state(&self) -> Option<S> {
        *self.state.lock()
    }

    async fn set_state(&self, state: S) -> Delivery {
        if *self.behavior.lock() != MockBehavior::Healthy {
            return Delivery::Dropped;
        }
        *self.state.lock() = Some(state);
        Delivery::Transmitted
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::capabilities::ValveState;

    #[tokio::test]
    async fn test_mock_sensor_read_and_write() {
        let sensor = MockSensor::new("cathode_voltage", 12.34);
        assert_eq!(sensor.read().await, Reading::ok(12.34));

        assert_eq!(sensor.write(20.0).await, Delivery::Transmitted);
        assert_eq!(sensor.base().await, 20.0);
        assert_eq!(sensor.read_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_sensor_noise_stays_in_band() {
        let sensor = MockSensor::new("pressure_1", 2.5).with_noise(0.01);
        for _ in 0..20 {
            let reading = sensor.read().await;
            assert!(
                reading.value > 2.47 && reading.value < 2.53,
                "Reading {} not in expected range",
                reading.value
            );
        }
    }

    #[tokio::test]
    async fn test_mock_sensor_fail_mode() {
        let sensor = MockSensor::new("rrg_value", 1.0);
        sensor.set_behavior(MockBehavior::Fail);
        assert_eq!(sensor.read().await, Reading::fallback());
        assert_eq!(sensor.write(2.0).await, Delivery::Dropped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_sensor_hang_never_answers() {
        let sensor = MockSensor::new("stuck", 1.0).with_behavior(MockBehavior::Hang);
        let outcome = tokio::time::timeout(Duration::from_secs(5), sensor.read()).await;
        assert!(outcome.is_err());
    }

    #[tokio::test]
    async fn test_mock_scanner_fail_keeps_length() {
        let scanner = MockScanner::new("thermocouples", vec![10.0, 20.0, 30.0]);
        assert_eq!(scanner.channel_count(), 3);
        scanner.set_behavior(MockBehavior::Fail);
        assert_eq!(scanner.read_all().await, vec![Reading::fallback(); 3]);
    }

    #[tokio::test]
    async fn test_mock_switch_remembers_state() {
        let valve = MockSwitch::new(Some(ValveState::Closed));
        assert_eq!(valve.set_state(ValveState::Open).await, Delivery::Transmitted);
        assert_eq!(valve.state().await, Some(ValveState::Open));
    }
}
