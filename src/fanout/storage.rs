//! Per-experiment durable store.
//!
//! While recording is active every snapshot becomes one [`ExperimentRecord`] appended by
//! the recorder thread. Records are never dropped: the queue to the recorder applies
//! backpressure, and a failed write is raised as [`Alert::StorageFailure`].
//!
//! The shipped backend, [`CsvRecordStore`], writes one CSV file per experiment named
//! `dd-mm-yyyy_<name>.csv` with the experiment metadata next to it as JSON.

use chrono::{DateTime, Local, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::Alert;
use crate::error::{AppResult, PlmError};
use crate::snapshot::Snapshot;

/// Operator-supplied description of one experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentInfo {
    /// Short name, part of the file name.
    pub name: String,
    /// Day the experiment ran.
    pub date: NaiveDate,
    /// Project the run belongs to.
    #[serde(default)]
    pub project: String,
    /// Facility or rig.
    #[serde(default)]
    pub facility: String,
    /// Sample under test.
    #[serde(default)]
    pub sample: String,
    /// Free text.
    #[serde(default)]
    pub description: String,
}

impl ExperimentInfo {
    /// An experiment dated today with empty metadata.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            date: Local::now().date_naive(),
            project: String::new(),
            facility: String::new(),
            sample: String::new(),
            description: String::new(),
        }
    }

    /// `dd-mm-yyyy_<name>` with path separators and whitespace replaced.
    pub fn file_stem(&self) -> String {
        let name: String = self
            .name
            .trim()
            .chars()
            .map(|c| {
                if c.is_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}_{}", self.date.format("%d-%m-%Y"), name)
    }
}

/// One stored row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExperimentRecord {
    /// Absolute snapshot time.
    pub timestamp: DateTime<Utc>,
    /// Seconds since recording started.
    pub experiment_time: f64,
    /// Instrument key to value.
    pub instruments: BTreeMap<String, f64>,
    /// Channel label to value.
    pub thermocouples: BTreeMap<String, f64>,
}

impl ExperimentRecord {
    /// Record for `snapshot` in a session that started at `started`.
    pub fn from_snapshot(snapshot: &Snapshot, started: DateTime<Utc>) -> Self {
        let offset = snapshot.timestamp - started;
        Self {
            timestamp: snapshot.timestamp,
            experiment_time: offset.num_microseconds().unwrap_or_default() as f64 / 1e6,
            instruments: snapshot.instrument_values(),
            thermocouples: snapshot.thermocouple_values(),
        }
    }
}

/// Durable, append-only experiment storage, owned by the recorder thread.
pub trait RecordStore: Send {
    /// Open a new experiment.
    fn begin(&mut self, info: &ExperimentInfo) -> AppResult<()>;

    /// Append one record to the open experiment.
    fn append(&mut self, record: &ExperimentRecord) -> AppResult<()>;

    /// Close the open experiment.
    fn finish(&mut self) -> AppResult<()>;
}

#[derive(Serialize)]
struct CsvRow<'a> {
    timestamp: String,
    unix_time: f64,
    experiment_time: f64,
    instruments: &'a str,
    thermocouples: &'a str,
}

/// CSV file per experiment, JSON maps per row.
pub struct CsvRecordStore {
    output_dir: PathBuf,
    writer: Option<csv::Writer<File>>,
    current: Option<PathBuf>,
}

impl CsvRecordStore {
    /// Store experiments under `output_dir`, created on first use.
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            writer: None,
            current: None,
        }
    }

    /// File of the open experiment.
    pub fn current_path(&self) -> Option<&Path> {
        self.current.as_deref()
    }
}

impl RecordStore for CsvRecordStore {
    fn begin(&mut self, info: &ExperimentInfo) -> AppResult<()> {
        self.finish()?;
        fs::create_dir_all(&self.output_dir)?;

        let stem = info.file_stem();
        let data_path = self.output_dir.join(format!("{stem}.csv"));
        let info_path = self.output_dir.join(format!("{stem}.json"));

        serde_json::to_writer_pretty(File::create(&info_path)?, info)?;

        let fresh = !data_path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&data_path)?;
        let writer = csv::WriterBuilder::new()
            .has_headers(fresh)
            .from_writer(file);

        info!(path = %data_path.display(), resumed = !fresh, "experiment file opened");
        self.writer = Some(writer);
        self.current = Some(data_path);
        Ok(())
    }

    fn append(&mut self, record: &ExperimentRecord) -> AppResult<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| PlmError::Storage("no experiment is open".into()))?;
        let instruments = serde_json::to_string(&record.instruments)?;
        let thermocouples = serde_json::to_string(&record.thermocouples)?;
        writer.serialize(CsvRow {
            timestamp: record.timestamp.to_rfc3339(),
            unix_time: record.timestamp.timestamp_micros() as f64 / 1e6,
            experiment_time: record.experiment_time,
            instruments: &instruments,
            thermocouples: &thermocouples,
        })?;
        writer.flush()?;
        Ok(())
    }

    fn finish(&mut self) -> AppResult<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            if let Some(path) = self.current.take() {
                info!(path = %path.display(), "experiment file closed");
            }
        }
        Ok(())
    }
}

/// Work items for the recorder thread.
#[derive(Debug)]
pub enum RecorderCommand {
    /// Open a new experiment.
    Begin(ExperimentInfo),
    /// Append one record.
    Append(ExperimentRecord),
    /// Close the experiment.
    Finish,
}

#[derive(Debug, Clone)]
struct Session {
    name: String,
    started: DateTime<Utc>,
}

/// Start/stop switch for recording, shared by the operator surface and the fan-out sink.
#[derive(Debug, Clone)]
pub struct RecordingControl {
    session: Arc<Mutex<Option<Session>>>,
    // Held across start/stop so the session check and the queued command stay paired.
    transition: Arc<tokio::sync::Mutex<()>>,
    commands: mpsc::Sender<RecorderCommand>,
}

impl RecordingControl {
    /// Whether records are being written.
    pub fn is_recording(&self) -> bool {
        self.session.lock().is_some()
    }

    /// When the active session started.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.session.lock().as_ref().map(|s| s.started)
    }

    /// Open a new experiment and start recording.
    pub async fn start(&self, info: ExperimentInfo) -> AppResult<()> {
        let _transition = self.transition.lock().await;
        let active = self.session.lock().as_ref().map(|s| s.name.clone());
        if let Some(active) = active {
            return Err(PlmError::InvalidCommand(format!(
                "recording '{active}' is already active"
            )));
        }
        let name = info.name.clone();
        self.commands
            .send(RecorderCommand::Begin(info))
            .await
            .map_err(|_| PlmError::Storage("recorder is not running".into()))?;
        *self.session.lock() = Some(Session {
            name: name.clone(),
            started: Utc::now(),
        });
        info!(experiment = %name, "recording started");
        Ok(())
    }

    /// Stop recording and close the experiment.
    pub async fn stop(&self) -> AppResult<()> {
        let _transition = self.transition.lock().await;
        let session = self
            .session
            .lock()
            .take()
            .ok_or_else(|| PlmError::InvalidCommand("recording is not active".into()))?;
        self.commands
            .send(RecorderCommand::Finish)
            .await
            .map_err(|_| PlmError::Storage("recorder is not running".into()))?;
        info!(experiment = %session.name, "recording stopped");
        Ok(())
    }

    /// Queue `snapshot` if recording. Waits while the recorder is behind.
    ///
    /// Returns whether a record was queued.
    pub async fn record(&self, snapshot: &Snapshot) -> AppResult<bool> {
        let Some(started) = self.started_at() else {
            return Ok(false);
        };
        let record = ExperimentRecord::from_snapshot(snapshot, started);
        self.commands
            .send(RecorderCommand::Append(record))
            .await
            .map_err(|_| PlmError::Storage("recorder is not running; record lost".into()))?;
        Ok(true)
    }
}

/// Run `store` on a blocking thread fed by a bounded queue.
pub fn spawn_recorder(
    mut store: Box<dyn RecordStore>,
    capacity: usize,
    alerts: broadcast::Sender<Alert>,
) -> (RecordingControl, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(capacity.max(1));
    let task = tokio::task::spawn_blocking(move || {
        while let Some(command) = rx.blocking_recv() {
            let (what, result) = match command {
                RecorderCommand::Begin(info) => ("open experiment", store.begin(&info)),
                RecorderCommand::Append(record) => ("append record", store.append(&record)),
                RecorderCommand::Finish => ("close experiment", store.finish()),
            };
            if let Err(err) = result {
                error!(error = %err, "storage failed to {what}");
                // No receivers is fine; the error log stands.
                let _ = alerts.send(Alert::StorageFailure {
                    message: format!("failed to {what}: {err}"),
                });
            }
        }
        if let Err(err) = store.finish() {
            error!(error = %err, "storage failed to close experiment at shutdown");
        }
    });
    let control = RecordingControl {
        session: Arc::new(Mutex::new(None)),
        transition: Arc::new(tokio::sync::Mutex::new(())),
        commands: tx,
    };
    (control, task)
}
