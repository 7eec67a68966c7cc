//! Message-bus republishing of snapshots.
//!
//! Every snapshot becomes one message per instrument key, one per thermocouple channel
//! and one for the timestamp:
//!
//! ```text
//! <root>/instruments/<key>        "12.34"
//! <root>/thermocouples/CH<n>      "21.5"
//! <root>/timestamp                "1700000000.25"
//! ```
//!
//! Delivery is at-most-once. A failed publish is logged and the remaining topics are
//! still attempted.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::snapshot::{channel_label, Snapshot};

/// A pub/sub client able to publish text payloads.
#[async_trait]
pub trait MessageBus: Send {
    /// Publish one payload. Errors are per-message.
    async fn publish(&mut self, topic: &str, payload: &str) -> Result<()>;

    /// Leave the broker cleanly.
    async fn disconnect(&mut self) {}
}

/// Topic naming under an optional root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicScheme {
    root: Option<String>,
}

impl TopicScheme {
    /// Topics under `root`; `None` or an empty root publishes at top level.
    pub fn new(root: Option<String>) -> Self {
        let root = root
            .map(|r| r.trim_matches('/').to_string())
            .filter(|r| !r.is_empty());
        Self { root }
    }

    fn topic(&self, suffix: &str) -> String {
        match &self.root {
            Some(root) => format!("{root}/{suffix}"),
            None => suffix.to_string(),
        }
    }

    /// Topic for one instrument key.
    pub fn instrument(&self, key: &str) -> String {
        self.topic(&format!("instruments/{key}"))
    }

    /// Topic for one thermocouple channel.
    pub fn thermocouple(&self, channel: usize) -> String {
        self.topic(&format!("thermocouples/{}", channel_label(channel)))
    }

    /// Topic for the snapshot timestamp.
    pub fn timestamp(&self) -> String {
        self.topic("timestamp")
    }
}

/// Text form of a published scalar.
pub fn format_value(value: f64) -> String {
    format!("{value:?}")
}

/// Every `(topic, payload)` pair for `snapshot`, in publish order.
pub fn snapshot_messages(topics: &TopicScheme, snapshot: &Snapshot) -> Vec<(String, String)> {
    let mut messages =
        Vec::with_capacity(snapshot.instruments.len() + snapshot.thermocouples.len() + 1);
    for (key, reading) in &snapshot.instruments {
        messages.push((topics.instrument(key), format_value(reading.value)));
    }
    for (channel, reading) in &snapshot.thermocouples {
        messages.push((topics.thermocouple(*channel), format_value(reading.value)));
    }
    messages.push((topics.timestamp(), format_value(snapshot.timestamp_secs())));
    messages
}

/// Outcome of publishing one snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Messages handed to the bus.
    pub published: usize,
    /// Messages that failed.
    pub failed: usize,
}

/// Publish every message of `snapshot`, continuing past failures.
pub async fn publish_snapshot<B: MessageBus + ?Sized>(
    bus: &mut B,
    topics: &TopicScheme,
    snapshot: &Snapshot,
) -> PublishReport {
    let mut report = PublishReport::default();
    for (topic, payload) in snapshot_messages(topics, snapshot) {
        match bus.publish(&topic, &payload).await {
            Ok(()) => report.published += 1,
            Err(err) => {
                report.failed += 1;
                debug!(%topic, error = %err, "publish failed");
            }
        }
    }
    report
}

/// Run a publisher task draining `capacity`-bounded snapshots into `bus`.
///
/// The returned sender is meant for `try_send`: a full queue means the bus is behind and
/// the snapshot is skipped for the bus only.
pub fn spawn_bus_publisher<B>(
    mut bus: B,
    topics: TopicScheme,
    capacity: usize,
) -> (mpsc::Sender<Arc<Snapshot>>, JoinHandle<()>)
where
    B: MessageBus + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Arc<Snapshot>>(capacity.max(1));
    let task = tokio::spawn(async move {
        let mut degraded = false;
        while let Some(snapshot) = rx.recv().await {
            let report = publish_snapshot(&mut bus, &topics, &snapshot).await;
            if report.failed > 0 && !degraded {
                warn!(
                    cycle = snapshot.cycle,
                    failed = report.failed,
                    published = report.published,
                    "telemetry publish degraded"
                );
                degraded = true;
            } else if report.failed == 0 && degraded {
                info!(cycle = snapshot.cycle, "telemetry publish recovered");
                degraded = false;
            }
        }
        bus.disconnect().await;
    });
    (tx, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::Reading;
    use anyhow::bail;
    use chrono::DateTime;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct Recording {
        seen: Vec<(String, String)>,
        fail_on: Option<String>,
    }

    #[async_trait]
    impl MessageBus for Recording {
        async fn publish(&mut self, topic: &str, payload: &str) -> Result<()> {
            if self.fail_on.as_deref() == Some(topic) {
                bail!("broker rejected {topic}");
            }
            self.seen.push((topic.to_string(), payload.to_string()));
            Ok(())
        }
    }

    fn snapshot() -> Snapshot {
        let mut instruments = BTreeMap::new();
        instruments.insert("pressure_1".to_string(), Reading::ok(0.25));
        instruments.insert("pressure_2".to_string(), Reading::ok(0.5));
        let mut thermocouples = BTreeMap::new();
        thermocouples.insert(0, Reading::ok(21.0));
        Snapshot {
            cycle: 9,
            timestamp: DateTime::from_timestamp(1_700_000_000, 500_000_000).unwrap(),
            instruments,
            thermocouples,
        }
    }

    #[test]
    fn topics_follow_root() {
        let topics = TopicScheme::new(Some("plm/".into()));
        assert_eq!(topics.instrument("rrg_value"), "plm/instruments/rrg_value");
        assert_eq!(topics.thermocouple(3), "plm/thermocouples/CH3");
        assert_eq!(TopicScheme::new(Some(String::new())).timestamp(), "timestamp");
    }

    #[test]
    fn payloads_keep_a_decimal_point() {
        assert_eq!(format_value(0.0), "0.0");
        assert_eq!(format_value(12.34), "12.34");
    }

    #[tokio::test]
    async fn failure_on_one_topic_does_not_stop_the_rest() {
        let mut bus = Recording {
            fail_on: Some("plm/instruments/pressure_1".into()),
            ..Default::default()
        };
        let topics = TopicScheme::new(Some("plm".into()));
        let report = publish_snapshot(&mut bus, &topics, &snapshot()).await;

        assert_eq!(report, PublishReport { published: 3, failed: 1 });
        assert_eq!(
            bus.seen,
            vec![
                ("plm/instruments/pressure_2".to_string(), "0.5".to_string()),
                ("plm/thermocouples/CH0".to_string(), "21.0".to_string()),
                ("plm/timestamp".to_string(), "1700000000.5".to_string()),
            ]
        );
    }
}
