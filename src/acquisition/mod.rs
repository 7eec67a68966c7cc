//! Acquisition pipeline: probes, the sample aggregator and the cycle scheduler.

pub mod aggregator;
pub mod derived;
pub mod probe;
pub mod scheduler;

pub use aggregator::{CathodeTemperature, SampleAggregator, CATHODE_TEMPERATURE_KEY};
pub use probe::{Probe, ProbeOutput};
pub use scheduler::{
    CycleScheduler, CycleStats, Pacing, SchedulerConfig, SchedulerHandle, SchedulerState,
};
