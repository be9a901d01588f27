//! Integration tests for the scan driver against mock hardware.
//!
//! The driver is stepped tick by tick so the tests stay deterministic; one
//! test exercises the real `run` loop on a paused clock.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ir_align::data::report::Reporter;
use ir_align::data::table::{SampleTable, FALLBACK_NAME};
use ir_align::data::SampleStore;
use ir_align::error::IrAlignError;
use ir_align::experiment::{
    operator_channel, DriverSettings, JogDirection, OperatorCommand, ScanDriver, ScanParams,
    ScanState,
};
use ir_align::geometry::Position;
use ir_align::hardware::mock::{ConeField, EchoLink, MockMotionStage, SimulatedIrLink};

const ORIGIN: Position = Position {
    x: 100.0,
    y: 100.0,
    z: 10.0,
};

fn settings(dir: &Path, speeds: Vec<u32>) -> DriverSettings {
    DriverSettings {
        origin: ORIGIN,
        match_tolerance: 0.04,
        safe_feedrate: 1200.0,
        jog_feedrate: 600.0,
        jog_step: Position::new(0.5, 0.5, 0.25),
        speeds,
        passes: 1,
        settle: Duration::ZERO,
        poll_interval: Duration::from_millis(1),
        output_dir: dir.to_path_buf(),
    }
}

/// A link that never answers: every sample scores zero.
fn dead_link() -> EchoLink {
    EchoLink::new(9600, |_| Vec::new())
}

fn dead_driver(dir: &Path, speeds: Vec<u32>) -> ScanDriver<MockMotionStage, EchoLink> {
    ScanDriver::new(
        MockMotionStage::default(),
        dead_link(),
        settings(dir, speeds),
        ScanParams::default(),
    )
    .unwrap()
}

/// Tick until the driver stops scanning. Returns the number of ticks used.
async fn tick_until_idle<M, L>(driver: &mut ScanDriver<M, L>, limit: usize) -> usize
where
    M: ir_align::hardware::MotionController,
    L: ir_align::hardware::LinkTransport,
{
    for n in 0..limit {
        if driver.state() != ScanState::Scanning {
            return n;
        }
        driver.tick().await.unwrap();
    }
    panic!("scan still running after {} ticks", limit);
}

struct CountingReporter(Arc<AtomicUsize>);

impl Reporter for CountingReporter {
    fn report(&mut self, _store: &SampleStore) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn dead_link_completes_after_vertical_stop_and_saves() {
    let dir = tempfile::tempdir().unwrap();
    let reports = Arc::new(AtomicUsize::new(0));
    let mut driver = dead_driver(dir.path(), vec![9600])
        .with_reporter(Box::new(CountingReporter(reports.clone())));

    driver.handle(OperatorCommand::ToggleScan).await.unwrap();
    assert_eq!(driver.state(), ScanState::Scanning);

    tick_until_idle(&mut driver, 500).await;

    assert_eq!(driver.state(), ScanState::Idle);
    assert_eq!(driver.store().len(9600), 88);
    assert!(driver.session().finished);
    assert_eq!(reports.load(Ordering::SeqCst), 1);

    let saved = driver.last_saved().expect("completed scan is saved");
    assert!(saved.starts_with(dir.path()));
    assert!(saved.to_string_lossy().ends_with("_9600"));

    let (loaded, histogram) = SampleTable::new(saved.clone()).load().unwrap();
    assert_eq!(loaded.len(9600), 88);
    assert_eq!(histogram.unwrap().total(), 88 * 256);
}

#[tokio::test]
async fn scan_moves_change_height_without_moving_sideways() {
    let dir = tempfile::tempdir().unwrap();
    let mut driver = dead_driver(dir.path(), vec![9600]);

    driver.handle(OperatorCommand::ToggleScan).await.unwrap();
    tick_until_idle(&mut driver, 500).await;

    let moves = driver.motion().moves().await;
    assert_eq!(moves[0], (ORIGIN, 1200.0));
    assert!(moves[1..].iter().all(|&(_, feedrate)| feedrate < 0.0));

    let mut layer_changes = 0;
    for pair in moves.windows(2) {
        let (previous, current) = (pair[0].0, pair[1].0);
        if (current.z - previous.z).abs() > 0.01 {
            layer_changes += 1;
            assert!((current.x - previous.x).abs() < 1e-9, "{} -> {}", previous, current);
            assert!((current.y - previous.y).abs() < 1e-9, "{} -> {}", previous, current);
        }
    }
    assert_eq!(layer_changes, 10);
}

#[tokio::test]
async fn unacknowledged_scan_move_is_resent_before_the_next_sample() {
    let dir = tempfile::tempdir().unwrap();
    let mut driver = dead_driver(dir.path(), vec![9600]);
    driver.handle(OperatorCommand::ToggleScan).await.unwrap();
    assert_eq!(driver.motion().moves().await.len(), 1);

    driver.motion().fail_next_moves(1);
    driver.tick().await.unwrap();
    assert_eq!(driver.store().len(9600), 1);
    assert_eq!(driver.motion().moves().await.len(), 1);

    // Feedback still shows the old position; only the move goes out.
    driver.tick().await.unwrap();
    assert_eq!(driver.store().len(9600), 1);
    let moves = driver.motion().moves().await;
    assert_eq!(moves.len(), 2);
    let desired = driver.session().desired;
    assert_eq!(moves[1], (ORIGIN + desired, -1.0));

    driver.tick().await.unwrap();
    assert_eq!(driver.store().len(9600), 2);
    assert_eq!(driver.store().samples(9600)[1].position(), desired);
}

#[tokio::test]
async fn dropped_acknowledgements_never_turn_a_layer_change_diagonal() {
    let dir = tempfile::tempdir().unwrap();
    let mut driver = dead_driver(dir.path(), vec![9600]);
    driver.handle(OperatorCommand::ToggleScan).await.unwrap();

    // The first move after every sample goes unacknowledged.
    for _ in 0..500 {
        if driver.state() != ScanState::Scanning {
            break;
        }
        driver.motion().fail_next_moves(1);
        driver.tick().await.unwrap();
        if driver.state() != ScanState::Scanning {
            break;
        }
        driver.tick().await.unwrap();
    }

    assert_eq!(driver.state(), ScanState::Idle);
    assert_eq!(driver.store().len(9600), 88);

    let moves = driver.motion().moves().await;
    let mut layer_changes = 0;
    for pair in moves.windows(2) {
        let (previous, current) = (pair[0].0, pair[1].0);
        if (current.z - previous.z).abs() > 0.01 {
            layer_changes += 1;
            assert!((current.x - previous.x).abs() < 1e-9, "{} -> {}", previous, current);
            assert!((current.y - previous.y).abs() < 1e-9, "{} -> {}", previous, current);
        }
    }
    assert_eq!(layer_changes, 10);
}

#[tokio::test]
async fn exhausted_speed_switches_link_and_restarts_at_center() {
    let dir = tempfile::tempdir().unwrap();
    let mut driver = dead_driver(dir.path(), vec![9600, 19_200]);

    driver.handle(OperatorCommand::ToggleScan).await.unwrap();
    for _ in 0..88 {
        driver.tick().await.unwrap();
    }

    assert_eq!(driver.state(), ScanState::Scanning);
    assert_eq!(driver.link().speed_changes().await, vec![19_200]);
    assert_eq!(driver.generator().cursor().speed_index, 1);
    assert_eq!(driver.session().desired, Position::ZERO);

    tick_until_idle(&mut driver, 500).await;
    assert_eq!(driver.store().len(9600), 88);
    assert_eq!(driver.store().len(19_200), 88);
    assert!(driver
        .last_saved()
        .unwrap()
        .to_string_lossy()
        .ends_with("_9600-19200"));
}

#[tokio::test]
async fn manual_commands_are_rejected_while_scanning() {
    let dir = tempfile::tempdir().unwrap();
    let mut driver = dead_driver(dir.path(), vec![9600]);
    driver.handle(OperatorCommand::ToggleScan).await.unwrap();

    for command in [
        OperatorCommand::Home,
        OperatorCommand::DisableMotors,
        OperatorCommand::Jog(JogDirection::XPlus),
        OperatorCommand::ResetOrigin,
    ] {
        let err = driver.handle(command).await.unwrap_err();
        assert!(matches!(err, IrAlignError::CommandRejected { .. }), "{}", err);
        assert!(err.is_recoverable());
    }
    assert_eq!(driver.motion().home_count().await, 0);

    driver.handle(OperatorCommand::ToggleScan).await.unwrap();
    assert_eq!(driver.state(), ScanState::Idle);

    driver
        .handle(OperatorCommand::Jog(JogDirection::XPlus))
        .await
        .unwrap();
    let (target, feedrate) = *driver.motion().moves().await.last().unwrap();
    assert_eq!(target, ORIGIN + Position::new(0.5, 0.0, 0.0));
    assert_eq!(feedrate, 600.0);
}

#[tokio::test]
async fn operator_commands_reach_the_stage_when_idle() {
    let dir = tempfile::tempdir().unwrap();
    let mut driver = dead_driver(dir.path(), vec![9600]);

    driver.handle(OperatorCommand::Home).await.unwrap();
    assert_eq!(driver.motion().home_count().await, 1);
    assert!(driver.session().homed);

    driver
        .handle(OperatorCommand::Jog(JogDirection::ZMinus))
        .await
        .unwrap();
    driver.handle(OperatorCommand::ResetOrigin).await.unwrap();
    assert_eq!(
        *driver.motion().moves().await.last().unwrap(),
        (ORIGIN, 1200.0)
    );
    assert_eq!(driver.session().desired, Position::ZERO);

    driver.handle(OperatorCommand::DisableMotors).await.unwrap();
    assert!(!driver.motion().motors_enabled().await);
    assert!(driver.session().motors_disabled);
}

#[tokio::test]
async fn no_sample_without_feedback_or_outside_the_gate() {
    let dir = tempfile::tempdir().unwrap();
    let mut driver = dead_driver(dir.path(), vec![9600]);
    driver.handle(OperatorCommand::ToggleScan).await.unwrap();

    driver.motion().fail_next_queries(2);
    driver.tick().await.unwrap();
    driver.tick().await.unwrap();
    assert!(driver.store().is_empty());
    assert!(driver.session().feedback.is_none());

    driver
        .motion()
        .set_feedback_error(Position::new(0.1, 0.0, 0.0))
        .await;
    driver.tick().await.unwrap();
    assert!(driver.store().is_empty());
    assert!(driver.session().feedback.is_some());

    driver
        .motion()
        .set_feedback_error(Position::new(0.01, -0.01, 0.0))
        .await;
    driver.tick().await.unwrap();
    assert_eq!(driver.store().len(9600), 1);
}

#[tokio::test]
async fn snapshot_while_scanning_and_final_save_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let mut driver = dead_driver(dir.path(), vec![9600]);
    driver.handle(OperatorCommand::ToggleScan).await.unwrap();
    for _ in 0..5 {
        driver.tick().await.unwrap();
    }

    driver.handle(OperatorCommand::Snapshot).await.unwrap();
    assert_eq!(driver.state(), ScanState::Scanning);
    let snapshot = driver.last_saved().unwrap().clone();
    let (loaded, _) = SampleTable::new(snapshot).load().unwrap();
    assert_eq!(loaded.len(9600), 5);

    driver.tick().await.unwrap();
    driver.shutdown().await.unwrap();
    let (loaded, _) = SampleTable::new(dir.path().join(FALLBACK_NAME))
        .load()
        .unwrap();
    assert_eq!(loaded.len(9600), 6);
}

#[tokio::test]
async fn shutdown_without_samples_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mut driver = dead_driver(dir.path(), vec![9600]);

    driver.shutdown().await.unwrap();
    assert!(driver.last_saved().is_none());
    assert!(!dir.path().join(FALLBACK_NAME).exists());
}

#[tokio::test]
async fn toggling_after_completion_starts_a_fresh_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut driver = dead_driver(dir.path(), vec![9600]);
    driver.handle(OperatorCommand::ToggleScan).await.unwrap();
    tick_until_idle(&mut driver, 500).await;

    driver.handle(OperatorCommand::ToggleScan).await.unwrap();
    assert_eq!(driver.state(), ScanState::Scanning);
    assert!(driver.store().is_empty());
    assert_eq!(driver.generator().cursor().layer, 0);
    assert_eq!(driver.session().desired, Position::ZERO);
}

#[tokio::test]
async fn simulated_cone_is_found_at_the_origin() {
    let dir = tempfile::tempdir().unwrap();
    let stage = MockMotionStage::default();
    let link = SimulatedIrLink::new(ConeField::at(ORIGIN), stage.head(), 9600, 11);
    let params = ScanParams {
        max_radius: 3.0,
        max_height: 2.0,
        ..ScanParams::default()
    };
    let mut driver =
        ScanDriver::new(stage, link, settings(dir.path(), vec![9600]), params).unwrap();

    driver.initialize().await.unwrap();
    assert!(!driver.motion().auto_reports_enabled().await);

    driver.handle(OperatorCommand::ToggleScan).await.unwrap();
    tick_until_idle(&mut driver, 5000).await;

    let samples = driver.store().samples(9600);
    assert!(samples[0].score > 0.8, "center scored {}", samples[0].score);
    assert!(samples.iter().any(|s| s.score == 0.0));
    assert!(samples.len() > 88);
}

#[tokio::test(start_paused = true)]
async fn run_loop_finishes_once_queue_closes_and_scan_completes() {
    let dir = tempfile::tempdir().unwrap();
    let mut driver = dead_driver(dir.path(), vec![9600]);
    let (tx, mut rx) = operator_channel();

    tx.send(OperatorCommand::ToggleScan).unwrap();
    tx.send(OperatorCommand::Jog(JogDirection::YPlus)).unwrap();
    drop(tx);

    driver.run(&mut rx).await.unwrap();

    assert_eq!(driver.state(), ScanState::Idle);
    assert_eq!(driver.store().len(9600), 88);
    assert!(driver.last_saved().is_some());
}

#[tokio::test(start_paused = true)]
async fn run_loop_stops_on_quit() {
    let dir = tempfile::tempdir().unwrap();
    let mut driver = dead_driver(dir.path(), vec![9600]);
    let (tx, mut rx) = operator_channel();

    tx.send(OperatorCommand::ToggleScan).unwrap();
    tx.send(OperatorCommand::Quit).unwrap();

    driver.run(&mut rx).await.unwrap();
    assert_eq!(driver.state(), ScanState::Scanning);
    assert!(driver.store().is_empty());
}
