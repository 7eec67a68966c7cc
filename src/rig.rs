//! Rig assembly.
//!
//! Builds every configured instrument once at startup and exposes it two ways: as
//! [`Probe`]s for the aggregator and as ports the operator [`Controller`] writes to.
//! Hardware and simulated rigs produce the same ports, so everything downstream of this
//! module is identical in both modes.
//!
//! An adapter whose handshake fails stays in the rig. Its probe yields fallbacks and its
//! controls report [`PlmError::InstrumentUnavailable`].
//!
//! [`Controller`]: crate::control::Controller
//! [`PlmError::InstrumentUnavailable`]: crate::error::PlmError::InstrumentUnavailable

use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::acquisition::{CathodeTemperature, Probe, SampleAggregator};
use crate::config::{
    supply_key, FlowControllerConfig, GaugeConfig, PlmConfig, PowerSupplyConfig,
    SupplyLimits, ThermocoupleConfig, FLOW_KEY,
};
use crate::error::AppResult;
use crate::hardware::mock::{MockScanner, MockSensor, MockSwitch};
use crate::hardware::{
    Connection, Endpoint, FlowController, GasType, GaugeKind, MultiChannelReadable,
    OutputState, Quantity, Readable, ScpiPowerSupply, StatefulDiscrete, ThermocoupleScanner,
    VacuumGauge, ValveState, Writable,
};

/// Name of the thermocouple probe.
pub const THERMOCOUPLE_PROBE: &str = "thermocouples";

const SIMULATED_LATENCY: Duration = Duration::from_millis(20);
const SIMULATED_NOISE: f64 = 0.01;

/// One power supply.
pub struct SupplyPort {
    /// Role name (`cathode`, `solenoid_1`, ...).
    pub role: String,
    /// Setpoint bounds.
    pub limits: SupplyLimits,
    /// Negative voltage and current allowed.
    pub bipolar: bool,
    measured: Vec<Quantity>,
    connection: Arc<dyn Connection>,
    readers: BTreeMap<Quantity, Arc<dyn Readable>>,
    writers: BTreeMap<Quantity, Arc<dyn Writable>>,
    output: Arc<dyn StatefulDiscrete<OutputState>>,
}

impl SupplyPort {
    /// Initialization status.
    pub fn connection(&self) -> &dyn Connection {
        self.connection.as_ref()
    }

    /// Setpoint channel for `quantity`.
    pub fn writer(&self, quantity: Quantity) -> Option<&Arc<dyn Writable>> {
        self.writers.get(&quantity)
    }

    /// Output switch.
    pub fn output(&self) -> &Arc<dyn StatefulDiscrete<OutputState>> {
        &self.output
    }

    fn probe(&self) -> Probe {
        let sources = self
            .measured
            .iter()
            .filter_map(|&q| {
                self.readers
                    .get(&q)
                    .map(|reader| (supply_key(&self.role, q), Arc::clone(reader)))
            })
            .collect();
        Probe::scalars(self.role.clone(), sources)
    }
}

/// The mass-flow controller.
pub struct FlowPort {
    /// Largest accepted setpoint.
    pub max_flow: f64,
    connection: Arc<dyn Connection>,
    reader: Arc<dyn Readable>,
    writer: Arc<dyn Writable>,
    valve: Arc<dyn StatefulDiscrete<ValveState>>,
}

impl FlowPort {
    /// Initialization status.
    pub fn connection(&self) -> &dyn Connection {
        self.connection.as_ref()
    }

    /// Flow setpoint.
    pub fn writer(&self) -> &Arc<dyn Writable> {
        &self.writer
    }

    /// Valve mode.
    pub fn valve(&self) -> &Arc<dyn StatefulDiscrete<ValveState>> {
        &self.valve
    }
}

/// One vacuum gauge.
pub struct GaugePort {
    /// Instrument key (`pressure_1`, ...).
    pub key: String,
    connection: Arc<dyn Connection>,
    reader: Arc<dyn Readable>,
    gas: Arc<dyn StatefulDiscrete<GasType>>,
}

impl GaugePort {
    /// Initialization status.
    pub fn connection(&self) -> &dyn Connection {
        self.connection.as_ref()
    }

    /// Gas correction selector.
    pub fn gas(&self) -> &Arc<dyn StatefulDiscrete<GasType>> {
        &self.gas
    }
}

/// Hardware adapters that own a transport.
enum Adapter {
    Supply(Arc<ScpiPowerSupply>),
    Flow(Arc<FlowController>),
    Gauge(Arc<VacuumGauge>),
    Scanner(Arc<ThermocoupleScanner>),
}

impl Adapter {
    async fn shutdown(&self) {
        match self {
            Adapter::Supply(a) => a.shutdown().await,
            Adapter::Flow(a) => a.shutdown().await,
            Adapter::Gauge(a) => a.shutdown().await,
            Adapter::Scanner(a) => a.shutdown().await,
        }
    }
}

/// Every instrument of the rig.
pub struct PlmRig {
    supplies: BTreeMap<String, SupplyPort>,
    flow: Option<FlowPort>,
    gauges: BTreeMap<String, GaugePort>,
    thermocouples: Option<Arc<dyn MultiChannelReadable>>,
    calibration_k: f64,
    read_timeout: Duration,
    adapters: Vec<Adapter>,
}

impl PlmRig {
    fn empty(config: &PlmConfig) -> Self {
        Self {
            supplies: BTreeMap::new(),
            flow: None,
            gauges: BTreeMap::new(),
            thermocouples: None,
            calibration_k: config.acquisition.calibration_k,
            read_timeout: config.acquisition.read_timeout,
            adapters: Vec::new(),
        }
    }

    /// Connect to the configured hardware. Never fails: unreachable instruments are
    /// logged and left disabled.
    pub async fn connect(config: &PlmConfig) -> Self {
        let mut rig = Self::empty(config);
        let instruments = &config.instruments;

        // Supplies sit on separate links; handshake them together.
        let handshakes = instruments.power_supplies.iter().map(|(role, supply)| {
            let timeout = config.supply_timeout(supply);
            ScpiPowerSupply::connect(role.clone(), supply.endpoint.clone(), timeout)
        });
        let connected = join_all(handshakes).await;
        for ((role, supply), adapter) in instruments.power_supplies.iter().zip(connected) {
            let adapter = Arc::new(adapter);
            rig.add_supply(role, supply, Arc::clone(&adapter));
            rig.adapters.push(Adapter::Supply(adapter));
        }

        if let Some(flow) = &instruments.flow_controller {
            let adapter = Arc::new(
                FlowController::connect(
                    FLOW_KEY,
                    flow.endpoint.clone(),
                    flow.unit,
                    config.instrument_timeout(flow.timeout),
                    flow.zero_setpoint_on_start,
                )
                .await,
            );
            rig.flow = Some(FlowPort {
                max_flow: flow.max_flow,
                connection: adapter.clone(),
                reader: adapter.clone(),
                writer: adapter.clone(),
                valve: adapter.clone(),
            });
            rig.adapters.push(Adapter::Flow(adapter));
        }

        for (key, gauge) in &instruments.gauges {
            let adapter = Arc::new(
                VacuumGauge::connect(
                    key.clone(),
                    gauge.endpoint.clone(),
                    gauge.address,
                    gauge.kind,
                    config.instrument_timeout(gauge.timeout),
                )
                .await,
            );
            rig.gauges.insert(
                key.clone(),
                GaugePort {
                    key: key.clone(),
                    connection: adapter.clone(),
                    reader: adapter.clone(),
                    gas: adapter.clone(),
                },
            );
            rig.adapters.push(Adapter::Gauge(adapter));
        }

        if let Some(tc) = &instruments.thermocouples {
            let adapter = Arc::new(
                ThermocoupleScanner::connect(
                    THERMOCOUPLE_PROBE,
                    tc.endpoint.clone(),
                    config.instrument_timeout(tc.timeout),
                    (tc.channel_start, tc.channel_stop),
                    tc.thermocouple_type,
                    tc.unit,
                )
                .await,
            );
            rig.thermocouples = Some(adapter.clone());
            rig.adapters.push(Adapter::Scanner(adapter));
        }

        rig.log_summary();
        rig
    }

    fn add_supply(&mut self, role: &str, config: &PowerSupplyConfig, supply: Arc<ScpiPowerSupply>) {
        let mut readers: BTreeMap<Quantity, Arc<dyn Readable>> = BTreeMap::new();
        let mut writers: BTreeMap<Quantity, Arc<dyn Writable>> = BTreeMap::new();
        for quantity in [Quantity::Voltage, Quantity::Current, Quantity::Power] {
            let channel = Arc::new(supply.channel(quantity));
            readers.insert(quantity, channel.clone());
            writers.insert(quantity, channel);
        }
        self.supplies.insert(
            role.to_string(),
            SupplyPort {
                role: role.to_string(),
                limits: config.limits,
                bipolar: config.bipolar,
                measured: config.measured(),
                connection: supply.clone(),
                readers,
                writers,
                output: supply,
            },
        );
    }

    /// A rig of simulated instruments with the configured roles, or the standard PLM
    /// layout when no instruments are configured.
    pub fn simulated(config: &PlmConfig) -> Self {
        let mut rig = Self::empty(config);
        let instruments = if config.instruments == Default::default() {
            standard_layout()
        } else {
            config.instruments.clone()
        };

        for (role, supply) in &instruments.power_supplies {
            let mut readers: BTreeMap<Quantity, Arc<dyn Readable>> = BTreeMap::new();
            let mut writers: BTreeMap<Quantity, Arc<dyn Writable>> = BTreeMap::new();
            let mut connection: Option<Arc<dyn Connection>> = None;
            for quantity in [Quantity::Voltage, Quantity::Current, Quantity::Power] {
                let sensor = Arc::new(
                    MockSensor::new(supply_key(role, quantity), simulated_supply_value(quantity))
                        .with_latency(SIMULATED_LATENCY)
                        .with_noise(SIMULATED_NOISE),
                );
                connection.get_or_insert_with(|| sensor.clone() as Arc<dyn Connection>);
                readers.insert(quantity, sensor.clone());
                writers.insert(quantity, sensor);
            }
            let connection = connection
                .unwrap_or_else(|| Arc::new(MockSensor::new(role.clone(), 0.0)));
            rig.supplies.insert(
                role.clone(),
                SupplyPort {
                    role: role.clone(),
                    limits: supply.limits,
                    bipolar: supply.bipolar,
                    measured: supply.measured(),
                    connection,
                    readers,
                    writers,
                    output: Arc::new(MockSwitch::new(Some(OutputState::Off))),
                },
            );
        }

        if let Some(flow) = &instruments.flow_controller {
            let sensor = Arc::new(MockSensor::new(FLOW_KEY, 0.0).with_latency(SIMULATED_LATENCY));
            rig.flow = Some(FlowPort {
                max_flow: flow.max_flow,
                connection: sensor.clone(),
                reader: sensor.clone(),
                writer: sensor,
                valve: Arc::new(MockSwitch::new(Some(ValveState::Closed))),
            });
        }

        for key in instruments.gauges.keys() {
            let sensor = Arc::new(
                MockSensor::new(key.clone(), 0.05)
                    .with_latency(SIMULATED_LATENCY)
                    .with_noise(SIMULATED_NOISE),
            );
            rig.gauges.insert(
                key.clone(),
                GaugePort {
                    key: key.clone(),
                    connection: sensor.clone(),
                    reader: sensor,
                    gas: Arc::new(MockSwitch::<GasType>::new(None)),
                },
            );
        }

        if let Some(tc) = &instruments.thermocouples {
            let values = (0..tc.channel_count()).map(|i| 20.0 + 5.0 * i as f64).collect();
            rig.thermocouples = Some(Arc::new(
                MockScanner::new(THERMOCOUPLE_PROBE, values)
                    .with_latency(SIMULATED_LATENCY)
                    .with_noise(SIMULATED_NOISE),
            ));
        }

        info!(
            supplies = rig.supplies.len(),
            gauges = rig.gauges.len(),
            "simulated rig ready"
        );
        rig
    }

    fn log_summary(&self) {
        let connections = self
            .supplies
            .values()
            .map(SupplyPort::connection)
            .chain(self.flow.iter().map(FlowPort::connection))
            .chain(self.gauges.values().map(GaugePort::connection));
        let mut disabled = Vec::new();
        let mut total = 0;
        for connection in connections {
            total += 1;
            if !connection.is_initialized() {
                disabled.push(connection.name().to_string());
            }
        }
        if disabled.is_empty() {
            info!(instruments = total, "all instruments initialized");
        } else {
            warn!(
                instruments = total,
                disabled = ?disabled,
                "some instruments failed to initialize and stay disabled"
            );
        }
    }

    /// Power supplies by role.
    pub fn supplies(&self) -> &BTreeMap<String, SupplyPort> {
        &self.supplies
    }

    /// Power supply by role.
    pub fn supply(&self, role: &str) -> Option<&SupplyPort> {
        self.supplies.get(role)
    }

    /// The flow controller, if configured.
    pub fn flow(&self) -> Option<&FlowPort> {
        self.flow.as_ref()
    }

    /// Gauge by key.
    pub fn gauge(&self, key: &str) -> Option<&GaugePort> {
        self.gauges.get(key)
    }

    /// One probe per adapter.
    pub fn probes(&self) -> Vec<Probe> {
        let mut probes: Vec<Probe> = self.supplies.values().map(SupplyPort::probe).collect();
        if let Some(flow) = &self.flow {
            probes.push(Probe::scalar(FLOW_KEY, Arc::clone(&flow.reader)));
        }
        for gauge in self.gauges.values() {
            probes.push(Probe::scalar(gauge.key.clone(), Arc::clone(&gauge.reader)));
        }
        if let Some(scanner) = &self.thermocouples {
            probes.push(Probe::channels(THERMOCOUPLE_PROBE, Arc::clone(scanner)));
        }
        probes
    }

    /// Aggregator over every probe, deriving `T_cathode` when a cathode supply exists.
    pub fn aggregator(&self) -> AppResult<SampleAggregator> {
        let cathode = self
            .supplies
            .contains_key("cathode")
            .then(|| CathodeTemperature::new(self.calibration_k));
        SampleAggregator::new(self.probes(), self.read_timeout, cathode)
    }

    /// Close every hardware transport.
    pub async fn shutdown(&self) {
        for adapter in &self.adapters {
            adapter.shutdown().await;
        }
        info!(adapters = self.adapters.len(), "instrument links closed");
    }
}

fn simulated_supply_value(quantity: Quantity) -> f64 {
    match quantity {
        Quantity::Voltage => 10.0,
        Quantity::Current => 2.0,
        Quantity::Power => 20.0,
    }
}

fn simulated_endpoint() -> Endpoint {
    Endpoint::Tcp {
        host: "simulated".into(),
        port: 0,
    }
}

/// Cathode, discharge, sample and two solenoid supplies, the flow controller, three
/// gauges and an eight-channel thermocouple scanner.
pub fn standard_layout() -> crate::config::InstrumentsConfig {
    let supply = |bipolar, measure_power| PowerSupplyConfig {
        endpoint: simulated_endpoint(),
        timeout: None,
        bipolar,
        measure_power,
        limits: SupplyLimits::default(),
    };
    let gauge = |kind| GaugeConfig {
        endpoint: simulated_endpoint(),
        address: 1,
        kind,
        timeout: None,
    };

    let mut power_supplies = BTreeMap::new();
    // Power is read back only on the discharge and cathode supplies; the sample supply
    // is the bipolar one.
    power_supplies.insert("cathode".to_string(), supply(false, true));
    power_supplies.insert("discharge".to_string(), supply(false, true));
    power_supplies.insert("sample".to_string(), supply(true, false));
    for role in ["solenoid_1", "solenoid_2"] {
        power_supplies.insert(role.to_string(), supply(false, false));
    }

    let mut gauges = BTreeMap::new();
    gauges.insert("pressure_1".to_string(), gauge(GaugeKind::Pirani));
    gauges.insert("pressure_2".to_string(), gauge(GaugeKind::Ionization));
    gauges.insert("pressure_3".to_string(), gauge(GaugeKind::Pirani));

    crate::config::InstrumentsConfig {
        power_supplies,
        flow_controller: Some(FlowControllerConfig {
            endpoint: simulated_endpoint(),
            unit: 1,
            timeout: None,
            zero_setpoint_on_start: true,
            max_flow: 100.0,
        }),
        gauges,
        thermocouples: Some(ThermocoupleConfig {
            endpoint: simulated_endpoint(),
            channel_start: 101,
            channel_stop: 108,
            thermocouple_type: Default::default(),
            unit: Default::default(),
            timeout: None,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn simulated_rig_covers_standard_layout() {
        let config = PlmConfig::default();
        let rig = PlmRig::simulated(&config);
        let aggregator = rig.aggregator().unwrap();

        let schema = aggregator.schema();
        for key in [
            "T_cathode",
            "cathode_voltage",
            "solenoid_current_2",
            "rrg_value",
            "pressure_3",
        ] {
            assert!(schema.contains(&key.to_string()), "missing {key}");
        }
        assert_eq!(aggregator.channel_count(), 8);

        let snapshot = aggregator.poll().await;
        assert_eq!(snapshot.thermocouples.len(), 8);
        assert!(snapshot.instruments["T_cathode"].valid);
    }

    #[test]
    fn standard_layout_matches_the_rig() {
        let layout = standard_layout();
        let bipolar: Vec<&str> = layout
            .power_supplies
            .iter()
            .filter(|(_, supply)| supply.bipolar)
            .map(|(role, _)| role.as_str())
            .collect();
        assert_eq!(bipolar, vec!["sample"]);

        let config = PlmConfig {
            instruments: layout,
            ..PlmConfig::default()
        };
        let keys = config.instrument_keys();
        let powers: Vec<&String> = keys.iter().filter(|k| k.contains("power")).collect();
        assert_eq!(powers, vec!["cathode_power", "discharge_power"]);
        for gauge in ["pressure_1", "pressure_2", "pressure_3"] {
            assert!(keys.contains(&gauge.to_string()), "missing {gauge}");
        }
        assert_eq!(keys.len(), 17);
    }

    #[tokio::test]
    async fn simulated_rig_follows_configured_roles() {
        let config = PlmConfig::from_toml_str(
            r#"
            [instruments.power_supplies.discharge]
            transport = "tcp"
            host = "10.0.0.1"
            port = 5025
            measure_power = false
            "#,
        )
        .unwrap();
        let rig = PlmRig::simulated(&config);
        let aggregator = rig.aggregator().unwrap();
        assert_eq!(
            aggregator.schema(),
            vec!["discharge_current".to_string(), "discharge_voltage".to_string()]
        );
        assert_eq!(aggregator.channel_count(), 0);
    }

    #[tokio::test]
    async fn unreachable_hardware_is_disabled_not_fatal() {
        let config = PlmConfig::from_toml_str(
            r#"
            [acquisition]
            read_timeout = "100ms"

            [instruments.power_supplies.cathode]
            transport = "tcp"
            host = "127.0.0.1"
            port = 1

            [instruments.gauges.pressure_1]
            transport = "tcp"
            host = "127.0.0.1"
            port = 1
            kind = "pirani"
            "#,
        )
        .unwrap();
        let rig = PlmRig::connect(&config).await;

        assert!(!rig.supply("cathode").unwrap().connection().is_initialized());
        assert!(!rig.gauge("pressure_1").unwrap().connection().is_initialized());

        let snapshot = rig.aggregator().unwrap().poll().await;
        assert!(snapshot.instruments.values().all(|r| !r.valid));
        assert_eq!(snapshot.instruments["T_cathode"].value, 0.0);
        rig.shutdown().await;
    }
}
