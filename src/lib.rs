//! # PLM DAQ Core Library
//!
//! Data acquisition and control core for the PLM plasma-source rig. The library polls a
//! heterogeneous set of instruments (power supplies, a mass-flow controller, vacuum
//! gauges and a thermocouple scanner) on a fixed cycle, assembles each cycle into one
//! time-consistent [`snapshot::Snapshot`], and fans it out to a live display, a message
//! bus and an experiment recorder.
//!
//! ## Crate Structure
//!
//! - **`hardware`**: Capability traits, the transport [`hardware::Link`] and one adapter
//!   per instrument protocol, plus simulated instruments.
//! - **`acquisition`**: Probes, the concurrent, time-bounded `SampleAggregator` and the
//!   `CycleScheduler` that drives it.
//! - **`fanout`**: The three-way snapshot sink (display, MQTT bus, CSV recorder).
//! - **`rig`**: Builds adapters and probes from configuration.
//! - **`control`**: Operator commands routed to the rig.
//! - **`config`**: Figment-based configuration (TOML file plus `PLM_` environment).
//! - **`logging`**: `tracing` subscriber setup.
//! - **`error`**: The `PlmError` type for the application surface.
//!
//! ## Fault containment
//!
//! Instrument faults never escape an adapter: a failed read yields a fallback
//! [`snapshot::Reading`] with `valid == false`, a hung or panicking read is cut off by the
//! aggregator, and the cycle continues with every other instrument.

pub mod acquisition;
pub mod config;
pub mod control;
pub mod error;
pub mod fanout;
pub mod hardware;
pub mod logging;
pub mod rig;
pub mod snapshot;
