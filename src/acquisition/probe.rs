//! Probes: the unit of work the aggregator dispatches per cycle.
//!
//! A probe is one adapter as the aggregator sees it. It owns a fixed set of keys (or a
//! fixed number of thermocouple channels), is sampled in its own task, and is replaced
//! wholesale by fallbacks when that task panics.

use std::fmt;
use std::sync::Arc;
use tokio::time::{timeout_at, Instant};
use tracing::warn;

use crate::hardware::capabilities::{MultiChannelReadable, Readable};
use crate::snapshot::Reading;

#[derive(Clone)]
enum Source {
    Scalars(Vec<(String, Arc<dyn Readable>)>),
    Channels {
        count: usize,
        scanner: Arc<dyn MultiChannelReadable>,
    },
}

/// What a probe produced in one cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutput {
    /// One reading per owned key, in key order.
    Scalars(Vec<Reading>),
    /// One reading per channel.
    Channels(Vec<Reading>),
}

/// One adapter registered with the aggregator.
#[derive(Clone)]
pub struct Probe {
    name: String,
    source: Source,
}

impl Probe {
    /// A probe owning one key.
    pub fn scalar(key: impl Into<String>, source: Arc<dyn Readable>) -> Self {
        let key = key.into();
        Self {
            name: key.clone(),
            source: Source::Scalars(vec![(key, source)]),
        }
    }

    /// A probe owning several keys read back to back on the same device.
    pub fn scalars(name: impl Into<String>, sources: Vec<(String, Arc<dyn Readable>)>) -> Self {
        Self {
            name: name.into(),
            source: Source::Scalars(sources),
        }
    }

    /// A multi-channel probe. The channel count is fixed here.
    pub fn channels(name: impl Into<String>, scanner: Arc<dyn MultiChannelReadable>) -> Self {
        Self {
            name: name.into(),
            source: Source::Channels {
                count: scanner.channel_count(),
                scanner,
            },
        }
    }

    /// Name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Instrument keys this probe fills, empty for channel probes.
    pub fn keys(&self) -> Vec<&str> {
        match &self.source {
            Source::Scalars(sources) => sources.iter().map(|(key, _)| key.as_str()).collect(),
            Source::Channels { .. } => Vec::new(),
        }
    }

    /// Thermocouple channels this probe fills.
    pub fn channel_count(&self) -> usize {
        match &self.source {
            Source::Scalars(_) => 0,
            Source::Channels { count, .. } => *count,
        }
    }

    /// Take this cycle's readings, giving up at `deadline`.
    ///
    /// Keys read back to back keep the readings that finished in time; the read cut off by
    /// the deadline and every key after it fall back. A scanner returning the wrong number
    /// of channels is treated as a fault.
    pub async fn sample_until(&self, deadline: Instant) -> ProbeOutput {
        match &self.source {
            Source::Scalars(sources) => {
                let mut readings = Vec::with_capacity(sources.len());
                for (key, source) in sources {
                    match timeout_at(deadline, source.read()).await {
                        Ok(reading) => readings.push(reading),
                        Err(_elapsed) => {
                            warn!(probe = %self.name, %key, "read timed out, using fallback");
                            break;
                        }
                    }
                }
                readings.resize(sources.len(), Reading::fallback());
                ProbeOutput::Scalars(readings)
            }
            Source::Channels { count, scanner } => {
                let Ok(readings) = timeout_at(deadline, scanner.read_all()).await else {
                    warn!(probe = %self.name, "scan timed out, using fallback");
                    return self.fallback();
                };
                if readings.len() == *count {
                    ProbeOutput::Channels(readings)
                } else {
                    warn!(
                        probe = %self.name,
                        expected = count,
                        got = readings.len(),
                        "scanner returned wrong channel count"
                    );
                    self.fallback()
                }
            }
        }
    }

    /// Fallback readings for everything this probe owns.
    pub fn fallback(&self) -> ProbeOutput {
        match &self.source {
            Source::Scalars(sources) => {
                ProbeOutput::Scalars(vec![Reading::fallback(); sources.len()])
            }
            Source::Channels { count, .. } => {
                ProbeOutput::Channels(vec![Reading::fallback(); *count])
            }
        }
    }
}

impl fmt::Debug for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Probe")
            .field("name", &self.name)
            .field("keys", &self.keys())
            .field("channels", &self.channel_count())
            .finish()
    }
}
