//! Fan-out Sink
//!
//! Delivers each snapshot to three consumers with different guarantees:
//!
//! | Consumer | Channel | When the consumer is slow |
//! |----------|---------|---------------------------|
//! | Display  | `watch` (single slot) | older snapshot is overwritten |
//! | Bus      | bounded `mpsc`, `try_send` | snapshot skipped for the bus only |
//! | Recorder | bounded `mpsc`, `send().await` | the cycle waits (backpressure) |
//!
//! A storage fault is logged at error level and broadcast as an [`Alert`].

pub mod bus;
pub mod mqtt;
pub mod storage;

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, warn};

use crate::snapshot::Snapshot;
use storage::RecordingControl;

pub use bus::{publish_snapshot, spawn_bus_publisher, MessageBus, PublishReport, TopicScheme};
pub use mqtt::{MqttPublisher, MqttSettings};
pub use storage::{spawn_recorder, CsvRecordStore, ExperimentInfo, ExperimentRecord, RecordStore};

/// Capacity of the operator alert channel.
const ALERT_CAPACITY: usize = 32;

/// Operator-facing notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Alert {
    /// A durable write failed; recorded data may be incomplete.
    StorageFailure {
        /// What failed.
        message: String,
    },
}

/// Consumer of completed snapshots.
#[async_trait]
pub trait SnapshotSink: Send + Sync {
    /// Deliver one snapshot.
    async fn deliver(&self, snapshot: Arc<Snapshot>);
}

/// Latest-snapshot mailbox read by the display.
pub type DisplayReceiver = watch::Receiver<Option<Arc<Snapshot>>>;

/// Three-way snapshot distribution.
pub struct FanoutSink {
    display: watch::Sender<Option<Arc<Snapshot>>>,
    bus: Option<mpsc::Sender<Arc<Snapshot>>>,
    recording: Option<RecordingControl>,
    alerts: broadcast::Sender<Alert>,
    bus_skipped: AtomicU64,
}

impl FanoutSink {
    /// Sink with only the display consumer.
    pub fn new() -> Self {
        let (display, _) = watch::channel(None);
        let (alerts, _) = broadcast::channel(ALERT_CAPACITY);
        Self {
            display,
            bus: None,
            recording: None,
            alerts,
            bus_skipped: AtomicU64::new(0),
        }
    }

    /// Add the bus publisher queue.
    pub fn with_bus(mut self, queue: mpsc::Sender<Arc<Snapshot>>) -> Self {
        self.bus = Some(queue);
        self
    }

    /// Add the recorder.
    pub fn with_recording(mut self, control: RecordingControl) -> Self {
        self.recording = Some(control);
        self
    }

    /// Sender for alerts raised outside the sink (the recorder thread).
    pub fn alert_sender(&self) -> broadcast::Sender<Alert> {
        self.alerts.clone()
    }

    /// Watch the latest snapshot.
    pub fn subscribe_display(&self) -> DisplayReceiver {
        self.display.subscribe()
    }

    /// Receive operator alerts.
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<Alert> {
        self.alerts.subscribe()
    }

    /// Snapshots skipped for the bus because its queue was full.
    pub fn bus_skipped(&self) -> u64 {
        self.bus_skipped.load(Ordering::Relaxed)
    }

    fn raise(&self, alert: Alert) {
        // No subscribers is fine; the error log stands.
        let _ = self.alerts.send(alert);
    }
}

impl Default for FanoutSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SnapshotSink for FanoutSink {
    async fn deliver(&self, snapshot: Arc<Snapshot>) {
        self.display.send_replace(Some(Arc::clone(&snapshot)));

        if let Some(queue) = &self.bus {
            match queue.try_send(Arc::clone(&snapshot)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let skipped = self.bus_skipped.fetch_add(1, Ordering::Relaxed) + 1;
                    debug!(cycle = snapshot.cycle, skipped, "bus queue full, snapshot skipped for the bus");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    warn!(cycle = snapshot.cycle, "bus publisher has stopped");
                }
            }
        }

        if let Some(recording) = &self.recording {
            if let Err(err) = recording.record(&snapshot).await {
                error!(cycle = snapshot.cycle, error = %err, "snapshot not recorded");
                self.raise(Alert::StorageFailure {
                    message: err.to_string(),
                });
            }
        }
    }
}
