//! Configuration System using Figment
//!
//! Strongly-typed configuration for the acquisition core. Configuration is loaded from:
//! 1. a TOML file (`config/plm.toml` by default)
//! 2. environment variables prefixed with `PLM_`, `__` separating nested keys
//!
//! Every section has defaults, so a missing file yields a runnable (instrument-less)
//! configuration.
//!
//! # Example
//! ```no_run
//! use plm_daq::config::PlmConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PlmConfig::load_from("config/plm.toml")?;
//! config.validate()?;
//! println!("Polling every {:?}", config.acquisition.read_interval);
//! # Ok(())
//! # }
//! ```
//!
//! Override a nested value from the environment:
//!
//! ```text
//! PLM_ACQUISITION__READ_INTERVAL=500ms
//! PLM_INSTRUMENTS__POWER_SUPPLIES__CATHODE__HOST=192.168.0.25
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::acquisition::aggregator::CATHODE_TEMPERATURE_KEY;
use crate::acquisition::scheduler::{Pacing, SchedulerConfig};
use crate::error::{AppResult, PlmError};
use crate::fanout::{MqttSettings, TopicScheme};
use crate::hardware::link::Endpoint;
use crate::hardware::power_supply::Quantity;
use crate::hardware::thermocouple::{TemperatureUnit, ThermocoupleType};
use crate::hardware::vacuum_gauge::GaugeKind;

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/plm.toml";

/// Key the flow controller reading is stored under.
pub const FLOW_KEY: &str = "rrg_value";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlmConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Polling cycle settings
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    /// Message-bus republishing
    #[serde(default)]
    pub bus: BusConfig,
    /// Experiment recording
    #[serde(default)]
    pub storage: StorageConfig,
    /// Instrument connections, one entry per role
    #[serde(default)]
    pub instruments: InstrumentsConfig,
}

/// Output format of the log
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Multi-line, colored
    #[default]
    Pretty,
    /// One line per event
    Compact,
    /// JSON lines
    Json,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

/// Polling cycle configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Target interval between cycle starts
    #[serde(default = "default_read_interval", with = "humantime_serde")]
    pub read_interval: Duration,
    /// Bound on each instrument read within a cycle
    #[serde(default = "default_read_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Cathode calibration constant `k`
    #[serde(default = "default_calibration_k")]
    pub calibration_k: f64,
    /// Cycle pacing policy
    #[serde(default)]
    pub pacing: Pacing,
    /// Consecutive overruns before a backpressure warning
    #[serde(default = "default_overrun_warning_after")]
    pub overrun_warning_after: u32,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            read_interval: default_read_interval(),
            read_timeout: default_read_timeout(),
            calibration_k: default_calibration_k(),
            pacing: Pacing::default(),
            overrun_warning_after: default_overrun_warning_after(),
        }
    }
}

impl AcquisitionConfig {
    /// Scheduler timing derived from this section.
    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            period: self.read_interval,
            pacing: self.pacing,
            overrun_warning_after: self.overrun_warning_after.max(1),
        }
    }
}

/// Message-bus configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Publish snapshots to the broker
    #[serde(default)]
    pub enabled: bool,
    /// Broker host
    #[serde(default = "default_broker")]
    pub broker: String,
    /// Broker port
    #[serde(default = "default_broker_port")]
    pub port: u16,
    /// MQTT client identifier
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Root of every topic; the client id when unset
    #[serde(default)]
    pub root_topic: Option<String>,
    /// Bound on connecting to the broker and on each publish
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Minimum time between reconnection attempts
    #[serde(default = "default_reconnect_interval", with = "humantime_serde")]
    pub reconnect_interval: Duration,
    /// Snapshots buffered for the publisher
    #[serde(default = "default_bus_queue")]
    pub queue_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            broker: default_broker(),
            port: default_broker_port(),
            client_id: default_client_id(),
            root_topic: None,
            connect_timeout: default_connect_timeout(),
            reconnect_interval: default_reconnect_interval(),
            queue_capacity: default_bus_queue(),
        }
    }
}

impl BusConfig {
    /// Topic naming for this broker.
    pub fn topics(&self) -> TopicScheme {
        TopicScheme::new(Some(
            self.root_topic
                .clone()
                .unwrap_or_else(|| self.client_id.clone()),
        ))
    }

    /// Publisher settings.
    pub fn mqtt_settings(&self) -> MqttSettings {
        MqttSettings {
            broker: self.broker.clone(),
            port: self.port,
            client_id: self.client_id.clone(),
            connect_timeout: self.connect_timeout,
            reconnect_interval: self.reconnect_interval,
        }
    }
}

/// Experiment storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory experiment files are written to
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Records buffered for the recorder before the cycle waits
    #[serde(default = "default_storage_queue")]
    pub queue_capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            queue_capacity: default_storage_queue(),
        }
    }
}

/// Instrument roles
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstrumentsConfig {
    /// Power supplies by role (`sample`, `discharge`, `solenoid_1`, ...)
    #[serde(default)]
    pub power_supplies: BTreeMap<String, PowerSupplyConfig>,
    /// Mass-flow controller
    #[serde(default)]
    pub flow_controller: Option<FlowControllerConfig>,
    /// Vacuum gauges by key (`pressure_1`, ...)
    #[serde(default)]
    pub gauges: BTreeMap<String, GaugeConfig>,
    /// Thermocouple scanner
    #[serde(default)]
    pub thermocouples: Option<ThermocoupleConfig>,
}

/// Setpoint bounds of one supply
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SupplyLimits {
    /// Maximum voltage magnitude
    #[serde(default = "default_voltage_limit")]
    pub voltage: f64,
    /// Maximum current magnitude
    #[serde(default = "default_current_limit")]
    pub current: f64,
    /// Maximum power
    #[serde(default = "default_power_limit")]
    pub power: f64,
}

impl Default for SupplyLimits {
    fn default() -> Self {
        Self {
            voltage: default_voltage_limit(),
            current: default_current_limit(),
            power: default_power_limit(),
        }
    }
}

impl SupplyLimits {
    /// Maximum for one quantity.
    pub fn max(&self, quantity: Quantity) -> f64 {
        match quantity {
            Quantity::Voltage => self.voltage,
            Quantity::Current => self.current,
            Quantity::Power => self.power,
        }
    }
}

/// SCPI power supply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerSupplyConfig {
    /// Where the supply is connected
    #[serde(flatten)]
    pub endpoint: Endpoint,
    /// Transport timeout; the acquisition read timeout when unset
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    /// Voltage and current setpoints may be negative
    #[serde(default)]
    pub bipolar: bool,
    /// Poll output power as well as voltage and current
    #[serde(default = "default_true")]
    pub measure_power: bool,
    /// Setpoint bounds
    #[serde(default)]
    pub limits: SupplyLimits,
}

impl PowerSupplyConfig {
    /// Quantities polled every cycle.
    pub fn measured(&self) -> Vec<Quantity> {
        let mut quantities = vec![Quantity::Voltage, Quantity::Current];
        if self.measure_power {
            quantities.push(Quantity::Power);
        }
        quantities
    }
}

/// Modbus mass-flow controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowControllerConfig {
    /// Where the controller is connected
    #[serde(flatten)]
    pub endpoint: Endpoint,
    /// Modbus unit id
    #[serde(default = "default_modbus_unit")]
    pub unit: u8,
    /// Transport timeout; the acquisition read timeout when unset
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    /// Zero the flow setpoint right after connecting
    #[serde(default = "default_true")]
    pub zero_setpoint_on_start: bool,
    /// Largest accepted flow setpoint
    #[serde(default = "default_max_flow")]
    pub max_flow: f64,
}

/// ERSTEVAK vacuum gauge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaugeConfig {
    /// Where the gauge is connected
    #[serde(flatten)]
    pub endpoint: Endpoint,
    /// Bus address
    #[serde(default = "default_gauge_address")]
    pub address: u8,
    /// Sensor principle
    pub kind: GaugeKind,
    /// Transport timeout; the acquisition read timeout when unset
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

/// Thermocouple scanner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThermocoupleConfig {
    /// Where the scanner is connected
    #[serde(flatten)]
    pub endpoint: Endpoint,
    /// First channel scanned
    pub channel_start: u32,
    /// Last channel scanned, inclusive
    pub channel_stop: u32,
    /// Junction type
    #[serde(default)]
    pub thermocouple_type: ThermocoupleType,
    /// Reporting unit
    #[serde(default)]
    pub unit: TemperatureUnit,
    /// Transport timeout; the acquisition read timeout when unset
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

impl ThermocoupleConfig {
    /// Number of channels in the scanned range.
    pub fn channel_count(&self) -> usize {
        self.channel_stop.saturating_sub(self.channel_start) as usize + 1
    }
}

/// Instrument key of one supply quantity.
///
/// Roles ending in `_<n>` keep the index last: `solenoid_1` + voltage gives
/// `solenoid_voltage_1`; `cathode` + voltage gives `cathode_voltage`.
pub fn supply_key(role: &str, quantity: Quantity) -> String {
    match role.rsplit_once('_') {
        Some((prefix, index))
            if !prefix.is_empty()
                && !index.is_empty()
                && index.chars().all(|c| c.is_ascii_digit()) =>
        {
            format!("{prefix}_{quantity}_{index}")
        }
        _ => format!("{role}_{quantity}"),
    }
}

// Default value functions
fn default_app_name() -> String {
    "PLM DAQ".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_read_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_read_timeout() -> Duration {
    Duration::from_millis(800)
}

fn default_calibration_k() -> f64 {
    1.0
}

fn default_overrun_warning_after() -> u32 {
    5
}

fn default_broker() -> String {
    "localhost".to_string()
}

fn default_broker_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "plm".to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_reconnect_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_bus_queue() -> usize {
    4
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_storage_queue() -> usize {
    64
}

fn default_voltage_limit() -> f64 {
    60.0
}

fn default_current_limit() -> f64 {
    10.0
}

fn default_power_limit() -> f64 {
    600.0
}

fn default_true() -> bool {
    true
}

fn default_modbus_unit() -> u8 {
    1
}

fn default_max_flow() -> f64 {
    100.0
}

fn default_gauge_address() -> u8 {
    1
}

fn invalid(message: impl Into<String>) -> PlmError {
    PlmError::Configuration(message.into())
}

impl PlmConfig {
    /// Load configuration from the default file and environment variables
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and the environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("PLM_").split("__"))
            .extract()?)
    }

    /// Parse configuration from TOML text, without the environment
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        Ok(Figment::from(Toml::string(toml)).extract()?)
    }

    /// Transport timeout for an instrument, defaulting to the read timeout.
    pub fn instrument_timeout(&self, timeout: Option<Duration>) -> Duration {
        timeout.unwrap_or(self.acquisition.read_timeout)
    }

    /// Transport timeout for one supply query. Unset, the read timeout is split evenly
    /// across the quantities the supply measures each cycle.
    pub fn supply_timeout(&self, supply: &PowerSupplyConfig) -> Duration {
        let reads = supply.measured().len() as u32;
        supply
            .timeout
            .unwrap_or(self.acquisition.read_timeout / reads.max(1))
    }

    /// Every instrument key the configured rig produces, derived keys included.
    pub fn instrument_keys(&self) -> Vec<String> {
        let instruments = &self.instruments;
        let mut keys = Vec::new();
        for (role, supply) in &instruments.power_supplies {
            for quantity in supply.measured() {
                keys.push(supply_key(role, quantity));
            }
        }
        if instruments.flow_controller.is_some() {
            keys.push(FLOW_KEY.to_string());
        }
        keys.extend(instruments.gauges.keys().cloned());
        if instruments.power_supplies.contains_key("cathode") {
            keys.push(CATHODE_TEMPERATURE_KEY.to_string());
        }
        keys
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let acquisition = &self.acquisition;
        if acquisition.read_interval.is_zero() {
            return Err(invalid("acquisition.read_interval must be positive"));
        }
        if acquisition.read_timeout.is_zero() {
            return Err(invalid("acquisition.read_timeout must be positive"));
        }
        if !(acquisition.calibration_k.is_finite() && acquisition.calibration_k > 0.0) {
            return Err(invalid(format!(
                "acquisition.calibration_k must be a positive number, got {}",
                acquisition.calibration_k
            )));
        }

        if self.bus.enabled {
            if self.bus.broker.trim().is_empty() {
                return Err(invalid("bus.broker must not be empty"));
            }
            if self.bus.client_id.trim().is_empty() {
                return Err(invalid("bus.client_id must not be empty"));
            }
        }
        if self.bus.queue_capacity == 0 || self.storage.queue_capacity == 0 {
            return Err(invalid("queue capacities must be at least 1"));
        }

        let read_timeout = acquisition.read_timeout;
        for (role, supply) in &self.instruments.power_supplies {
            let reads = supply.measured().len() as u32;
            if let Some(timeout) = supply.timeout {
                if timeout * reads > read_timeout {
                    return Err(invalid(format!(
                        "power_supplies.{role}.timeout ({timeout:?}) x {reads} reads exceeds acquisition.read_timeout ({read_timeout:?})"
                    )));
                }
            }
            let limits = supply.limits;
            for (name, value) in [
                ("voltage", limits.voltage),
                ("current", limits.current),
                ("power", limits.power),
            ] {
                if !(value.is_finite() && value >= 0.0) {
                    return Err(invalid(format!(
                        "power_supplies.{role}.limits.{name} must be a non-negative number"
                    )));
                }
            }
        }
        if let Some(flow) = &self.instruments.flow_controller {
            if !(flow.max_flow.is_finite() && flow.max_flow >= 0.0) {
                return Err(invalid("flow_controller.max_flow must be a non-negative number"));
            }
        }
        let single_read_timeouts = self
            .instruments
            .flow_controller
            .iter()
            .map(|flow| ("flow_controller".to_string(), flow.timeout))
            .chain(
                self.instruments
                    .gauges
                    .iter()
                    .map(|(key, gauge)| (format!("gauges.{key}"), gauge.timeout)),
            )
            .chain(
                self.instruments
                    .thermocouples
                    .iter()
                    .map(|tc| ("thermocouples".to_string(), tc.timeout)),
            );
        for (name, timeout) in single_read_timeouts {
            if let Some(timeout) = timeout.filter(|t| *t > read_timeout) {
                return Err(invalid(format!(
                    "{name}.timeout ({timeout:?}) exceeds acquisition.read_timeout ({read_timeout:?})"
                )));
            }
        }
        if let Some(tc) = &self.instruments.thermocouples {
            if tc.channel_stop < tc.channel_start {
                return Err(invalid(format!(
                    "thermocouples.channel_stop ({}) is below channel_start ({})",
                    tc.channel_stop, tc.channel_start
                )));
            }
        }

        let mut seen = BTreeSet::new();
        for key in self.instrument_keys() {
            if !seen.insert(key.clone()) {
                return Err(invalid(format!("Duplicate instrument key: {key}")));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [application]
        name = "PLM bench"
        log_level = "debug"

        [acquisition]
        read_interval = "500ms"
        read_timeout = "300ms"
        calibration_k = 0.92
        pacing = "back_to_back"

        [bus]
        enabled = true
        broker = "10.0.0.5"

        [instruments.power_supplies.cathode]
        transport = "tcp"
        host = "192.168.0.25"
        port = 5025
        limits = { voltage = 30.0, current = 50.0 }

        [instruments.power_supplies.solenoid_1]
        transport = "serial"
        path = "/dev/ttyUSB1"
        baud_rate = 115200
        timeout = "150ms"
        measure_power = false

        [instruments.flow_controller]
        transport = "serial"
        path = "/dev/ttyUSB2"
        unit = 3

        [instruments.gauges.pressure_1]
        transport = "tcp"
        host = "192.168.0.40"
        port = 4001
        address = 1
        kind = "pirani"

        [instruments.thermocouples]
        transport = "tcp"
        host = "192.168.0.50"
        port = 5025
        channel_start = 101
        channel_stop = 108
        thermocouple_type = "K"
        unit = "C"
    "#;

    #[test]
    fn parses_full_configuration() {
        let config = PlmConfig::from_toml_str(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.acquisition.read_interval, Duration::from_millis(500));
        assert_eq!(config.acquisition.pacing, Pacing::BackToBack);
        assert_eq!(config.bus.port, 1883);
        assert_eq!(config.bus.topics().timestamp(), "plm/timestamp");

        let cathode = &config.instruments.power_supplies["cathode"];
        assert_eq!(
            cathode.endpoint,
            Endpoint::Tcp {
                host: "192.168.0.25".into(),
                port: 5025
            }
        );
        assert_eq!(cathode.limits.voltage, 30.0);
        assert_eq!(cathode.limits.power, 600.0);
        assert_eq!(config.supply_timeout(cathode), Duration::from_millis(100));

        let solenoid = &config.instruments.power_supplies["solenoid_1"];
        assert_eq!(config.supply_timeout(solenoid), Duration::from_millis(150));
        assert_eq!(config.instrument_timeout(None), Duration::from_millis(300));

        assert_eq!(config.instruments.flow_controller.as_ref().unwrap().unit, 3);
        assert_eq!(config.instruments.thermocouples.as_ref().unwrap().channel_count(), 8);
    }

    #[test]
    fn instrument_keys_follow_naming_rule() {
        let config = PlmConfig::from_toml_str(SAMPLE).unwrap();
        let keys = config.instrument_keys();
        for expected in [
            "cathode_voltage",
            "cathode_current",
            "cathode_power",
            "solenoid_voltage_1",
            "solenoid_current_1",
            "rrg_value",
            "pressure_1",
            "T_cathode",
        ] {
            assert!(keys.contains(&expected.to_string()), "missing {expected}");
        }
        assert!(!keys.contains(&"solenoid_power_1".to_string()));
    }

    #[test]
    fn supply_key_rule() {
        assert_eq!(supply_key("sample", Quantity::Current), "sample_current");
        assert_eq!(supply_key("solenoid_2", Quantity::Voltage), "solenoid_voltage_2");
        assert_eq!(supply_key("aux_x", Quantity::Power), "aux_x_power");
    }

    #[test]
    fn empty_configuration_is_valid() {
        let config = PlmConfig::from_toml_str("").unwrap();
        assert_eq!(config, PlmConfig::default());
        config.validate().unwrap();
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = PlmConfig::default();
        config.application.log_level = "verbose".into();
        assert!(config.validate().is_err());

        let mut config = PlmConfig::default();
        config.acquisition.calibration_k = 0.0;
        assert!(config.validate().is_err());

        let mut config = PlmConfig::from_toml_str(SAMPLE).unwrap();
        if let Some(tc) = config.instruments.thermocouples.as_mut() {
            tc.channel_stop = 100;
        }
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("channel_stop"));
    }

    #[test]
    fn instrument_timeouts_must_fit_the_read_timeout() {
        // cathode measures V, I and P: 3 x 120ms overruns a 300ms read timeout.
        let mut config = PlmConfig::from_toml_str(SAMPLE).unwrap();
        if let Some(cathode) = config.instruments.power_supplies.get_mut("cathode") {
            cathode.timeout = Some(Duration::from_millis(120));
        }
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("power_supplies.cathode.timeout"));

        let mut config = PlmConfig::from_toml_str(SAMPLE).unwrap();
        if let Some(gauge) = config.instruments.gauges.get_mut("pressure_1") {
            gauge.timeout = Some(Duration::from_millis(400));
        }
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("gauges.pressure_1.timeout"));
    }

    #[test]
    fn gauge_key_colliding_with_supply_key_is_rejected() {
        let mut config = PlmConfig::from_toml_str(SAMPLE).unwrap();
        let gauge = config.instruments.gauges["pressure_1"].clone();
        config
            .instruments
            .gauges
            .insert("cathode_voltage".into(), gauge);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate instrument key: cathode_voltage"));
    }

    #[test]
    fn environment_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("plm.toml", SAMPLE)?;
            jail.set_env("PLM_ACQUISITION__CALIBRATION_K", "1.5");
            jail.set_env("PLM_BUS__ENABLED", "false");
            let config = PlmConfig::load_from("plm.toml").map_err(|e| e.to_string())?;
            assert_eq!(config.acquisition.calibration_k, 1.5);
            assert!(!config.bus.enabled);
            Ok(())
        });
    }
}
