//! Orchestrator behaviour against the simulated camera server.

use camera_operator::config::{DefaultPaths, ObservationSettings, Settings};
use camera_operator::observation::ObservationPhase;
use camera_operator::orchestrator::EXTERNAL_TRIGGER_MARKER;
use camera_operator::simulator::SimulatedController;
use camera_operator::state::{
    ConfigFile, ExternalRate, FilePathRequest, HvLevel, HvRange, InstrumentState, OnOffState,
    Threshold, TriggerSetting,
};
use camera_operator::{ControlError, Orchestrator};
use std::path::Path;
use std::time::Duration;

fn settings(root: &Path) -> Settings {
    Settings {
        paths: DefaultPaths::rooted_at(root),
        observation: ObservationSettings {
            check_interval: Duration::from_millis(1),
        },
        ..Settings::default()
    }
}

/// Orchestrator attached to a simulated camera starting in `state`, refreshed once.
async fn attached(root: &Path, state: InstrumentState) -> (Orchestrator, SimulatedController) {
    let settings = settings(root);
    let sim = SimulatedController::new(&settings.paths).with_state(state);
    let orchestrator = Orchestrator::from_settings(settings);
    let (reader, writer) = sim.connect();
    orchestrator.attach(reader, writer).await.unwrap();
    orchestrator.refresh().await.unwrap();
    (orchestrator, sim)
}

#[tokio::test]
async fn test_refresh_reports_live_status() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, _sim) = attached(dir.path(), InstrumentState::Ready).await;

    let snapshot = orchestrator.snapshot();
    assert_eq!(snapshot.state, InstrumentState::Ready);
    assert_eq!(
        snapshot.transitions,
        vec![
            InstrumentState::Observing,
            InstrumentState::Calibration,
            InstrumentState::Maintenance,
            InstrumentState::Safe,
            InstrumentState::Ready,
        ]
    );
    assert_eq!(snapshot.high_voltage, OnOffState::Off);
    assert_eq!(snapshot.hv_level, HvLevel::Low);
    let paths = DefaultPaths::rooted_at(dir.path());
    assert_eq!(
        Path::new(snapshot.paths.get(ConfigFile::Config)),
        paths.config_file(ConfigFile::Config)
    );
}

#[tokio::test]
async fn test_illegal_transition_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, sim) = attached(dir.path(), InstrumentState::Ready).await;

    for state in InstrumentState::ALL {
        let allowed = orchestrator.snapshot().allows(state);
        if allowed {
            continue;
        }
        let err = orchestrator.go_to_state(state).await.unwrap_err();
        assert!(
            matches!(err, ControlError::IllegalTransition { from: InstrumentState::Ready, to } if to == state),
            "{err}"
        );
        assert_eq!(orchestrator.snapshot().state, InstrumentState::Ready);
    }
    assert_eq!(sim.state(), InstrumentState::Ready);
    assert!(!sim.commands().iter().any(|c| c.starts_with("to")));
}

#[tokio::test]
async fn test_successful_transition_agrees_with_refresh() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, _sim) = attached(dir.path(), InstrumentState::Off).await;

    orchestrator.go_to_state_named("safe").await.unwrap();
    orchestrator.go_to_state(InstrumentState::Standby).await.unwrap();
    assert_eq!(orchestrator.snapshot().state, InstrumentState::Standby);

    let refreshed = orchestrator.refresh().await.unwrap();
    assert_eq!(refreshed.state, InstrumentState::Standby);
}

#[tokio::test]
async fn test_diverging_camera_fails_verification() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, sim) = attached(dir.path(), InstrumentState::Ready).await;
    sim.freeze_state(true);

    let err = orchestrator.go_to_state(InstrumentState::Safe).await.unwrap_err();
    assert!(matches!(
        err,
        ControlError::TransitionFailed {
            from: InstrumentState::Ready,
            requested: InstrumentState::Safe,
            actual: InstrumentState::Ready,
        }
    ));

    sim.freeze_state(false);
    sim.force_state(InstrumentState::Fault);
    let snapshot = orchestrator.refresh().await.unwrap();
    assert_eq!(snapshot.state, InstrumentState::Fault);
    assert_eq!(snapshot.transitions, vec![InstrumentState::Maintenance]);
}

#[tokio::test]
async fn test_disconnected_refresh_keeps_last_configuration() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, _sim) = attached(dir.path(), InstrumentState::Ready).await;

    orchestrator.set_high_voltage(OnOffState::On).await.unwrap();
    orchestrator.set_data_sending(OnOffState::On).await.unwrap();
    let live = orchestrator.refresh().await.unwrap();
    assert_eq!(live.high_voltage, OnOffState::On);

    orchestrator.disconnect().await.unwrap();
    assert!(!orchestrator.is_connected().await);
    let offline = orchestrator.refresh().await.unwrap();

    assert_eq!(offline.state, InstrumentState::Disconnected);
    assert!(offline.transitions.is_empty());
    assert_eq!(offline.high_voltage, OnOffState::On);
    assert_eq!(offline.flasher, live.flasher);
    assert_eq!(offline.data_sending, OnOffState::On);
    assert_eq!(offline.paths, live.paths);
    assert_eq!(offline.camera_trigger, live.camera_trigger);
}

#[tokio::test]
async fn test_exited_camera_server_reports_disconnected() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, sim) = attached(dir.path(), InstrumentState::Ready).await;
    orchestrator.set_high_voltage(OnOffState::On).await.unwrap();
    let live = orchestrator.refresh().await.unwrap();

    sim.exit_on_next_command();
    let snapshot = orchestrator.refresh().await.unwrap();

    assert!(!orchestrator.is_connected().await);
    assert_eq!(snapshot.state, InstrumentState::Disconnected);
    assert!(snapshot.transitions.is_empty());
    assert_eq!(snapshot.high_voltage, OnOffState::On);
    assert_eq!(snapshot.paths, live.paths);

    let err = orchestrator.go_to_state(InstrumentState::Observing).await.unwrap_err();
    assert!(matches!(
        err,
        ControlError::IllegalTransition {
            from: InstrumentState::Disconnected,
            ..
        }
    ));
}

#[tokio::test]
async fn test_persisted_configuration_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, _sim) = attached(dir.path(), InstrumentState::Ready).await;

    for kind in ConfigFile::ALL {
        let path = format!("/custom/{}.cfg", kind);
        orchestrator
            .set_file_path(kind, FilePathRequest::path(path))
            .await
            .unwrap();
    }
    orchestrator.set_observation_time_from_string("0:02:30").await.unwrap();
    let written = orchestrator.refresh().await.unwrap();
    orchestrator.disconnect().await.unwrap();

    // A fresh camera and orchestrator pick the configuration up on connect.
    let (restored, sim) = attached(dir.path(), InstrumentState::Ready).await;
    let snapshot = restored.snapshot();
    assert_eq!(snapshot.paths, written.paths);
    assert_eq!(restored.observation_time_string().await, "0:02:30");
    assert_eq!(sim.path(ConfigFile::Led), "/custom/LED.cfg");
}

#[tokio::test]
async fn test_timed_observation_returns_to_ready() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, sim) = attached(dir.path(), InstrumentState::Ready).await;
    orchestrator
        .set_observation_time(Duration::from_millis(200))
        .await;

    let begin = std::time::Instant::now();
    let handle = orchestrator.start_observation().await.unwrap().unwrap();
    assert_eq!(sim.state(), InstrumentState::Observing);
    assert!(orchestrator.pulse_generator_active().await);

    handle.wait_for_end().await;
    let elapsed = begin.elapsed();
    assert!(elapsed >= Duration::from_millis(200), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "{elapsed:?}");
    assert!(handle.reached_natural_end());
    assert_eq!(handle.phase(), ObservationPhase::NaturallyEnded);

    assert_eq!(sim.state(), InstrumentState::Ready);
    assert_eq!(orchestrator.snapshot().state, InstrumentState::Ready);
    assert!(orchestrator.observation().await.is_none());
    assert!(!orchestrator.pulse_generator_active().await);
}

#[tokio::test]
async fn test_counted_observation_stops_at_trigger_count() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, sim) = attached(dir.path(), InstrumentState::Ready).await;
    orchestrator.set_observation_trigger_count(100).await;

    let handle = orchestrator.start_observation().await.unwrap().unwrap();
    handle.wait_for_end().await;

    assert!(handle.reached_natural_end());
    assert_eq!(handle.start_trigger_count(), Some(0));
    // Start read plus exactly one hundred ticks.
    assert_eq!(sim.trigger_count(), 101);
    assert_eq!(sim.state(), InstrumentState::Ready);
}

#[tokio::test]
async fn test_operator_transition_interrupts_observation() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, sim) = attached(dir.path(), InstrumentState::Ready).await;
    orchestrator
        .set_observation_time(Duration::from_secs(3600))
        .await;

    let handle = orchestrator.start_observation().await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    orchestrator.go_to_state(InstrumentState::Safe).await.unwrap();

    assert!(handle.is_finished());
    assert!(!handle.reached_natural_end());
    assert_eq!(handle.phase(), ObservationPhase::Interrupted);
    assert_eq!(sim.state(), InstrumentState::Safe);
    assert!(orchestrator.observation().await.is_none());
}

#[tokio::test]
async fn test_unbounded_observation_has_no_supervisor() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, sim) = attached(dir.path(), InstrumentState::Ready).await;

    assert!(orchestrator.start_observation().await.unwrap().is_none());
    assert_eq!(sim.state(), InstrumentState::Observing);
    assert!(orchestrator.pulse_generator_active().await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(sim.state(), InstrumentState::Observing);

    // Leaving OBSERVING stops the pulses even without a supervisor.
    orchestrator.go_to_state(InstrumentState::Ready).await.unwrap();
    assert!(!orchestrator.pulse_generator_active().await);
}

#[tokio::test]
async fn test_presets_require_ready() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, sim) = attached(dir.path(), InstrumentState::Standby).await;

    let err = orchestrator
        .set_high_voltage_level(HvRange::High)
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::NotReady(_)));
    assert!(matches!(
        orchestrator.set_trigger(TriggerSetting::External(ExternalRate::Hz50)).await,
        Err(ControlError::NotReady(_))
    ));
    assert!(!sim.commands().iter().any(|c| c.starts_with("hvfile")));
}

#[tokio::test]
async fn test_high_voltage_level_selects_preset_file() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, _sim) = attached(dir.path(), InstrumentState::Ready).await;

    orchestrator.set_high_voltage_level(HvRange::Medium).await.unwrap();
    let snapshot = orchestrator.refresh().await.unwrap();
    assert_eq!(snapshot.hv_level, HvLevel::Medium);
}

#[tokio::test]
async fn test_trigger_presets() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, sim) = attached(dir.path(), InstrumentState::Ready).await;
    let paths = DefaultPaths::rooted_at(dir.path());

    let internal = TriggerSetting::Internal {
        hv: HvRange::Low,
        threshold: Threshold::Pe11,
    };
    orchestrator.set_trigger(internal).await.unwrap();
    assert_eq!(orchestrator.refresh().await.unwrap().trigger, internal);

    orchestrator
        .set_trigger(TriggerSetting::External(ExternalRate::Hz600))
        .await
        .unwrap();
    let marker = tokio::fs::read_to_string(paths.trigger_external()).await.unwrap();
    assert_eq!(marker, EXTERNAL_TRIGGER_MARKER);
    assert_eq!(orchestrator.pulse_rate().await, Some(600));

    let snapshot = orchestrator.refresh().await.unwrap();
    assert_eq!(snapshot.trigger, TriggerSetting::External(ExternalRate::Hz600));
    assert_eq!(
        Path::new(&sim.path(ConfigFile::Trigger)),
        paths.trigger_external()
    );
}
