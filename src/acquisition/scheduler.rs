//! Cycle Scheduler
//!
//! Drives the aggregator at a fixed period and hands every snapshot to a sink.
//!
//! # State machine
//!
//! ```text
//! Idle ──spawn──► Running ──stop / sender dropped──► Idle
//! ```
//!
//! Shutdown is cooperative: the signal is checked at every cycle boundary and interrupts
//! the pacing sleep, but a cycle in flight always completes and is delivered.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use super::aggregator::SampleAggregator;
use crate::error::{AppResult, PlmError};
use crate::fanout::SnapshotSink;

/// How the next cycle start is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pacing {
    /// Start cycles one period apart; sleep `max(0, period - elapsed)`.
    #[default]
    FixedRate,
    /// Start the next cycle as soon as the previous one is delivered.
    BackToBack,
}

/// Scheduler lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Not cycling.
    Idle,
    /// Cycling.
    Running,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SchedulerState::Idle => "idle",
            SchedulerState::Running => "running",
        })
    }
}

/// Timing parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerConfig {
    /// Target interval between cycle starts.
    pub period: Duration,
    /// Pacing policy.
    pub pacing: Pacing,
    /// Consecutive overruns before the backpressure warning.
    pub overrun_warning_after: u32,
}

/// Counters accumulated over a run.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CycleStats {
    /// Completed cycles.
    pub cycles: u64,
    /// Cycles whose duration reached the period.
    pub overruns: u64,
    /// Longest cycle.
    pub max_elapsed: Duration,
    /// Most recent cycle.
    pub last_elapsed: Duration,
}

/// Periodic driver of one aggregator.
pub struct CycleScheduler {
    aggregator: Arc<SampleAggregator>,
    sink: Arc<dyn SnapshotSink>,
    config: SchedulerConfig,
}

fn stop_requested(shutdown: &watch::Receiver<bool>) -> bool {
    shutdown.has_changed().is_err() || *shutdown.borrow()
}

impl CycleScheduler {
    /// Create an idle scheduler.
    pub fn new(
        aggregator: Arc<SampleAggregator>,
        sink: Arc<dyn SnapshotSink>,
        config: SchedulerConfig,
    ) -> AppResult<Self> {
        if config.period.is_zero() {
            return Err(PlmError::Configuration(
                "read interval must be positive".into(),
            ));
        }
        Ok(Self {
            aggregator,
            sink,
            config,
        })
    }

    /// Cycle until `shutdown` turns true or its sender is dropped.
    pub async fn run(
        self,
        mut shutdown: watch::Receiver<bool>,
        state: watch::Sender<SchedulerState>,
    ) -> CycleStats {
        let SchedulerConfig {
            period,
            pacing,
            overrun_warning_after,
        } = self.config;
        let mut stats = CycleStats::default();
        let mut consecutive_overruns = 0u32;
        let mut backpressure_reported = false;

        state.send_replace(SchedulerState::Running);
        info!(?period, ?pacing, "acquisition started");

        while !stop_requested(&shutdown) {
            let started = Instant::now();
            let snapshot = Arc::new(self.aggregator.poll().await);
            let cycle = snapshot.cycle;
            self.sink.deliver(snapshot).await;
            let elapsed = started.elapsed();

            stats.cycles += 1;
            stats.last_elapsed = elapsed;
            stats.max_elapsed = stats.max_elapsed.max(elapsed);

            if elapsed >= period {
                stats.overruns += 1;
                consecutive_overruns += 1;
                debug!(cycle, ?elapsed, ?period, "cycle overran its period");
                if consecutive_overruns >= overrun_warning_after && !backpressure_reported {
                    warn!(
                        consecutive = consecutive_overruns,
                        ?period,
                        ?elapsed,
                        "acquisition cannot keep up with the read interval"
                    );
                    backpressure_reported = true;
                }
            } else {
                consecutive_overruns = 0;
                backpressure_reported = false;
            }

            let pause = match pacing {
                Pacing::FixedRate => period.saturating_sub(elapsed),
                Pacing::BackToBack => Duration::ZERO,
            };
            if pause.is_zero() {
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                _ = sleep(pause) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        state.send_replace(SchedulerState::Idle);
        info!(
            cycles = stats.cycles,
            overruns = stats.overruns,
            max_elapsed = ?stats.max_elapsed,
            "acquisition stopped"
        );
        stats
    }

    /// Run on its own task.
    pub fn spawn(self) -> SchedulerHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(SchedulerState::Idle);
        let task = tokio::spawn(self.run(stop_rx, state_tx));
        SchedulerHandle {
            stop_tx,
            state_rx,
            task,
        }
    }
}

/// Control handle of a spawned scheduler.
pub struct SchedulerHandle {
    stop_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<SchedulerState>,
    task: JoinHandle<CycleStats>,
}

impl SchedulerHandle {
    /// Current lifecycle state.
    pub fn state(&self) -> SchedulerState {
        *self.state_rx.borrow()
    }

    /// Wait until the scheduler reports `wanted`.
    pub async fn wait_for(&mut self, wanted: SchedulerState) {
        // Err only when the task is gone, which also means Idle.
        let _ = self.state_rx.wait_for(|s| *s == wanted).await;
    }

    /// Request a stop, wait for the cycle in flight, and return the run's counters.
    pub async fn stop(self) -> AppResult<CycleStats> {
        self.stop_tx.send_replace(true);
        self.task
            .await
            .map_err(|err| PlmError::TaskFailed(format!("acquisition task: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::probe::Probe;
    use crate::hardware::mock::MockSensor;
    use crate::snapshot::Snapshot;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tracing_test::traced_test;

    #[derive(Default)]
    struct Collect(Mutex<Vec<u64>>);

    #[async_trait]
    impl SnapshotSink for Collect {
        async fn deliver(&self, snapshot: Arc<Snapshot>) {
            self.0.lock().push(snapshot.cycle);
        }
    }

    fn aggregator(latency: Duration) -> Arc<SampleAggregator> {
        let sensor = MockSensor::new("pressure_1", 1.0).with_latency(latency);
        Arc::new(
            SampleAggregator::new(
                vec![Probe::scalar("pressure_1", Arc::new(sensor))],
                Duration::from_secs(1),
                None,
            )
            .unwrap(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_rate_paces_cycles() {
        let sink = Arc::new(Collect::default());
        let scheduler = CycleScheduler::new(
            aggregator(Duration::from_millis(10)),
            sink.clone(),
            SchedulerConfig {
                period: Duration::from_millis(100),
                pacing: Pacing::FixedRate,
                overrun_warning_after: 3,
            },
        )
        .unwrap();
        let mut handle = scheduler.spawn();
        handle.wait_for(SchedulerState::Running).await;

        sleep(Duration::from_millis(450)).await;
        let stats = handle.stop().await.unwrap();

        // cycles start at 0, 100, 200, 300, 400 ms
        assert_eq!(stats.cycles, 5);
        assert_eq!(stats.overruns, 0);
        assert_eq!(*sink.0.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn slow_cycles_count_as_overruns() {
        let sink = Arc::new(Collect::default());
        let scheduler = CycleScheduler::new(
            aggregator(Duration::from_millis(150)),
            sink,
            SchedulerConfig {
                period: Duration::from_millis(100),
                pacing: Pacing::FixedRate,
                overrun_warning_after: 2,
            },
        )
        .unwrap();
        // Run inline so the warning is emitted inside the test's span.
        let (stop_tx, stop_rx) = watch::channel(false);
        let (state_tx, _state_rx) = watch::channel(SchedulerState::Idle);
        let stopper = async {
            sleep(Duration::from_millis(500)).await;
            stop_tx.send_replace(true);
        };
        let (stats, ()) = tokio::join!(scheduler.run(stop_rx, state_tx), stopper);
        assert!(stats.cycles >= 3);
        assert_eq!(stats.overruns, stats.cycles);
        assert!(stats.max_elapsed >= Duration::from_millis(150));
        assert!(logs_contain("acquisition cannot keep up with the read interval"));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_the_pacing_sleep() {
        let scheduler = CycleScheduler::new(
            aggregator(Duration::ZERO),
            Arc::new(Collect::default()),
            SchedulerConfig {
                period: Duration::from_secs(3600),
                pacing: Pacing::FixedRate,
                overrun_warning_after: 3,
            },
        )
        .unwrap();
        let mut handle = scheduler.spawn();
        handle.wait_for(SchedulerState::Running).await;

        let started = Instant::now();
        let stats = handle.stop().await.unwrap();
        assert_eq!(stats.cycles, 1);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn zero_period_is_rejected() {
        let result = CycleScheduler::new(
            aggregator(Duration::ZERO),
            Arc::new(Collect::default()),
            SchedulerConfig {
                period: Duration::ZERO,
                pacing: Pacing::BackToBack,
                overrun_warning_after: 1,
            },
        );
        assert!(result.is_err());
    }
}
