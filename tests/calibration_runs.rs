//! Calibration sequences against the simulated camera server.

use camera_operator::config::{DefaultPaths, ObservationSettings, Settings};
use camera_operator::runs::CalibrationRun;
use camera_operator::simulator::SimulatedController;
use camera_operator::state::{ConfigFile, InstrumentState, OnOffState};
use camera_operator::Orchestrator;
use std::path::Path;
use std::time::Duration;

async fn ready_camera(root: &Path) -> (Orchestrator, SimulatedController) {
    let settings = Settings {
        paths: DefaultPaths::rooted_at(root),
        observation: ObservationSettings {
            check_interval: Duration::from_millis(1),
        },
        ..Settings::default()
    };
    let sim = SimulatedController::new(&settings.paths).with_state(InstrumentState::Ready);
    let orchestrator = Orchestrator::from_settings(settings);
    let (reader, writer) = sim.connect();
    orchestrator.attach(reader, writer).await.unwrap();
    orchestrator.refresh().await.unwrap();
    (orchestrator, sim)
}

#[tokio::test]
async fn test_short_transfer_function_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, sim) = ready_camera(dir.path()).await;
    let paths = DefaultPaths::rooted_at(dir.path());

    let recipe = CalibrationRun {
        events: 6,
        vped: vec![800, 840, 880],
        ..CalibrationRun::transfer_function(paths.clone())
    };
    let outcome = recipe.run(&orchestrator).await.unwrap();

    assert_eq!(outcome.completed, 3);
    assert!(!outcome.interrupted);
    assert_eq!(sim.state(), InstrumentState::Ready);
    assert_eq!(sim.data_sending(), OnOffState::On);
    assert_eq!(orchestrator.pulse_rate().await, Some(600));

    // Three observations, each entered and left once.
    let commands = sim.commands();
    let observing = commands.iter().filter(|c| *c == "toobserving").count();
    assert_eq!(observing, 3);

    // Default Vped restored after the sweep.
    let settings = tokio::fs::read_to_string(paths.run_settings()).await.unwrap();
    assert!(settings.contains("ASIC0_Vped=1050"), "{settings}");

    let card = tokio::fs::read_to_string(paths.config_file(ConfigFile::Run))
        .await
        .unwrap();
    assert!(card.starts_with("RunType=tf\n"), "{card}");
}

#[tokio::test]
async fn test_sequence_stops_when_run_is_interrupted() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, sim) = ready_camera(dir.path()).await;

    let recipe = CalibrationRun {
        events: 600 * 3600,
        vped: vec![800, 840],
        ..CalibrationRun::transfer_function(DefaultPaths::rooted_at(dir.path()))
    };
    let task = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { recipe.run(&orchestrator).await })
    };

    tokio::time::timeout(Duration::from_secs(5), async {
        while sim.state() != InstrumentState::Observing {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    orchestrator.go_to_state(InstrumentState::Ready).await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(outcome.completed, 0);
    assert!(outcome.interrupted);
}
