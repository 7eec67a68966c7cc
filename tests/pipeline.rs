//! End-to-end pipeline tests: configuration, simulated rig, scheduler and fan-out.

use plm_daq::acquisition::{CycleScheduler, Pacing, SchedulerConfig, SchedulerState};
use plm_daq::config::PlmConfig;
use plm_daq::control::Controller;
use plm_daq::fanout::{spawn_recorder, CsvRecordStore, FanoutSink};
use plm_daq::rig::PlmRig;
use std::sync::Arc;
use std::time::Duration;

#[test]
fn test_shipped_configuration_is_valid() {
    let config = PlmConfig::load_from(concat!(env!("CARGO_MANIFEST_DIR"), "/config/plm.toml"))
        .unwrap();
    config.validate().unwrap();

    let keys = config.instrument_keys();
    assert!(keys.contains(&"solenoid_current_2".to_string()));
    assert!(keys.contains(&"T_cathode".to_string()));
    assert!(keys.contains(&"pressure_3".to_string()));
    assert!(!keys.contains(&"sample_power".to_string()));
    assert!(!keys.contains(&"solenoid_power_1".to_string()));

    let supplies = &config.instruments.power_supplies;
    assert!(supplies["sample"].bipolar);
    assert!(!supplies["solenoid_1"].bipolar);
    assert!(!supplies["solenoid_2"].bipolar);
    assert_eq!(config.instruments.thermocouples.unwrap().channel_count(), 8);
}

#[tokio::test]
async fn test_simulated_rig_runs_records_and_stops() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = PlmConfig::default();
    config.acquisition.read_interval = Duration::from_millis(50);
    config.acquisition.read_timeout = Duration::from_millis(40);

    let rig = Arc::new(PlmRig::simulated(&config));
    let aggregator = Arc::new(rig.aggregator().unwrap());
    let schema = aggregator.schema();

    let sink = FanoutSink::new();
    let (recording, recorder) = spawn_recorder(
        Box::new(CsvRecordStore::new(dir.path())),
        16,
        sink.alert_sender(),
    );
    let sink = Arc::new(sink.with_recording(recording.clone()));
    let mut display = sink.subscribe_display();

    let controller = Controller::new(Arc::clone(&rig)).with_recording(recording.clone());
    controller.apply_line("record start pipeline").await.unwrap();

    let scheduler = CycleScheduler::new(
        aggregator,
        sink.clone(),
        SchedulerConfig {
            period: config.acquisition.read_interval,
            pacing: Pacing::FixedRate,
            overrun_warning_after: 5,
        },
    )
    .unwrap();
    let mut handle = scheduler.spawn();
    handle.wait_for(SchedulerState::Running).await;

    // Let a few cycles reach the display.
    for _ in 0..3 {
        tokio::time::timeout(Duration::from_secs(2), display.changed())
            .await
            .unwrap()
            .unwrap();
        let snapshot = display.borrow_and_update().clone().unwrap();
        let keys: Vec<String> = snapshot.instruments.keys().cloned().collect();
        assert_eq!(keys, schema);
        assert_eq!(snapshot.thermocouples.len(), 8);
    }

    let stats = handle.stop().await.unwrap();
    assert!(stats.cycles >= 3);

    controller.apply_line("record stop").await.unwrap();
    drop(controller);
    drop(recording);
    drop(sink);
    recorder.await.unwrap();

    let csv = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok().map(|e| e.path()))
        .find(|p| p.extension().is_some_and(|ext| ext == "csv"))
        .unwrap();
    let rows = csv::Reader::from_path(&csv).unwrap().records().count();
    assert!(rows as u64 >= 3 && rows as u64 <= stats.cycles, "{rows} rows for {} cycles", stats.cycles);
    rig.shutdown().await;
}
