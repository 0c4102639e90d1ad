//! Camera orchestrator.
//!
//! [`Orchestrator`] is the single owner of the protocol client and the pulse
//! generator. Every public operation takes one async lock for its whole
//! duration, so refreshes, transitions and setters never interleave. Helpers
//! that need to compose operations take the held guard (`*_locked`) rather
//! than locking again.
//!
//! Status is published as `Arc<StatusSnapshot>` through a watch channel;
//! readers never wait on camera I/O.

use crate::config::Settings;
use crate::error::{AppResult, ControlError, ProtocolError};
use crate::gui_config::GuiConfig;
use crate::observation::{
    format_observation_time, parse_observation_time, ObservationHandle, ObservationSpec,
    ObservationTarget,
};
use crate::protocol::{ProtocolClient, Subsystem};
use crate::pulse_generator::{PulseGenerator, PulseLink};
use crate::snapshot::{hv_level_for, trigger_for, ConfigPaths, StatusSnapshot};
use crate::state::{
    CameraTrigger, ConfigFile, FilePathRequest, HvRange, InstrumentState, OnOffState,
    TriggerSetting,
};
use async_trait::async_trait;
use chrono::Local;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{watch, Mutex};

/// Contents of the external trigger file.
pub const EXTERNAL_TRIGGER_MARKER: &str = "BP|TriggerType=0\n";

struct ActiveObservation {
    id: u64,
    handle: Arc<ObservationHandle>,
}

struct Inner {
    client: ProtocolClient,
    pulse_generator: PulseGenerator,
    snapshot_tx: watch::Sender<Arc<StatusSnapshot>>,
    current: Option<Arc<StatusSnapshot>>,
    observation_spec: ObservationSpec,
    observation: Option<ActiveObservation>,
    gui_config_enabled: bool,
    runs_started: u64,
}

impl Inner {
    fn current(&self) -> Arc<StatusSnapshot> {
        self.current
            .clone()
            .unwrap_or_else(|| Arc::new(StatusSnapshot::initial()))
    }
}

/// Cloneable handle to the camera orchestrator.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Mutex<Inner>>,
    snapshot_rx: watch::Receiver<Arc<StatusSnapshot>>,
    settings: Arc<Settings>,
}

impl Orchestrator {
    /// Wrap an unconnected client and pulse generator.
    pub fn new(settings: Settings, client: ProtocolClient, pulse_generator: PulseGenerator) -> Self {
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(StatusSnapshot::initial()));
        Self {
            inner: Arc::new(Mutex::new(Inner {
                client,
                pulse_generator,
                snapshot_tx,
                current: None,
                observation_spec: ObservationSpec::default(),
                observation: None,
                gui_config_enabled: false,
                runs_started: 0,
            })),
            snapshot_rx,
            settings: Arc::new(settings),
        }
    }

    /// Build from settings, launching nothing yet.
    pub fn from_settings(settings: Settings) -> Self {
        let client = ProtocolClient::new(&settings.controller, settings.paths.executable());
        let pulse_generator = PulseGenerator::from_settings(&settings.pulse_generator);
        Self::new(settings, client, pulse_generator)
    }

    /// Settings this orchestrator was built with.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    // ---------------------------------------------------------------------
    // Connection
    // ---------------------------------------------------------------------

    /// Launch the camera server and replay the persisted configuration.
    pub async fn connect(&self) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        let controller = &self.settings.controller;
        inner
            .client
            .connect(&controller.address, &self.settings.paths.log())
            .await?;
        self.enable_gui_config_locked(&mut inner).await
    }

    /// Adopt an open camera server stream and replay the persisted configuration.
    pub async fn attach<R, W>(&self, reader: R, writer: W) -> AppResult<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut inner = self.inner.lock().await;
        inner.client.attach(reader, writer).await?;
        self.enable_gui_config_locked(&mut inner).await
    }

    /// Stop the camera server session and stop persisting configuration.
    pub async fn disconnect(&self) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        inner.client.disconnect().await?;
        inner.gui_config_enabled = false;
        Ok(())
    }

    /// Whether a camera server session is attached.
    pub async fn is_connected(&self) -> bool {
        self.inner.lock().await.client.is_connected()
    }

    /// Open the configured serial pulse generator.
    pub async fn connect_pulse_generator(&self) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        let pulse = &self.settings.pulse_generator;
        inner
            .pulse_generator
            .connect(&pulse.port, pulse.baud_rate)
            .await
            .map_err(|e| {
                error!("Connecting to the pulse generator failed: {}", e);
                e.into()
            })
    }

    /// Drive the pulse generator over an already-open link.
    pub async fn attach_pulse_generator<L: PulseLink + 'static>(&self, link: L) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        Ok(inner.pulse_generator.attach(link).await?)
    }

    // ---------------------------------------------------------------------
    // Status
    // ---------------------------------------------------------------------

    /// Pull fresh status and publish a new snapshot.
    pub async fn refresh(&self) -> AppResult<Arc<StatusSnapshot>> {
        let mut inner = self.inner.lock().await;
        self.refresh_locked(&mut inner).await
    }

    async fn refresh_locked(&self, inner: &mut Inner) -> AppResult<Arc<StatusSnapshot>> {
        let defaults = &self.settings.paths;
        let rate = inner.pulse_generator.rate();

        let live = if inner.client.is_connected() {
            match query_status(&mut inner.client, &self.settings, rate).await {
                Ok(snapshot) => Some(snapshot),
                // The client has dropped the session; report Disconnected.
                Err(e) if e.is_connection_lost() => None,
                Err(e) => return Err(e.into()),
            }
        } else {
            None
        };
        let connected = live.is_some();

        let snapshot = match live {
            Some(snapshot) => snapshot,
            None => match &inner.current {
                Some(previous) => previous.carried_over(defaults, rate),
                None => StatusSnapshot {
                    state: InstrumentState::Disconnected,
                    transitions: Vec::new(),
                    ..query_status(&mut inner.client, &self.settings, rate).await?
                },
            },
        };

        let snapshot = Arc::new(snapshot);
        inner.current = Some(snapshot.clone());
        inner.snapshot_tx.send_replace(snapshot.clone());

        if connected && inner.gui_config_enabled {
            let observation_time = format_observation_time(inner.observation_spec.duration);
            let path = defaults.gui_config();
            if let Err(e) = GuiConfig::from_snapshot(&snapshot, observation_time)
                .write(&path)
                .await
            {
                warn!("Could not write {}: {}", path.display(), e);
            }
        }
        Ok(snapshot)
    }

    /// Most recently published snapshot.
    pub fn snapshot(&self) -> Arc<StatusSnapshot> {
        self.snapshot_rx.borrow().clone()
    }

    /// Receiver notified on every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<StatusSnapshot>> {
        self.snapshot_rx.clone()
    }

    /// Backplane trigger counter.
    pub async fn backplane_trigger_count(&self) -> AppResult<u64> {
        let mut inner = self.inner.lock().await;
        Ok(inner.client.backplane_trigger_count().await?)
    }

    // ---------------------------------------------------------------------
    // Transitions
    // ---------------------------------------------------------------------

    /// Request a transition by state name.
    pub async fn go_to_state_named(&self, name: &str) -> AppResult<()> {
        let requested: InstrumentState = name.parse().map_err(|name| {
            warn!("Attempted transition to unknown state refused: {}", name);
            ControlError::UnknownState(name)
        })?;
        self.go_to_state(requested).await
    }

    /// Request a transition and verify the camera reached it.
    pub async fn go_to_state(&self, requested: InstrumentState) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        self.go_to_state_locked(&mut inner, requested).await
    }

    async fn go_to_state_locked(
        &self,
        inner: &mut Inner,
        requested: InstrumentState,
    ) -> AppResult<()> {
        let current = inner.current();
        info!("Going to state: {}", requested);
        if !current.allows(requested) {
            warn!(
                "Attempt to perform restricted transition refused: {} -> {}",
                current.state, requested
            );
            return Err(ControlError::IllegalTransition {
                from: current.state,
                to: requested,
            });
        }

        Self::interrupt_observation_locked(inner).await;
        if inner.pulse_generator.is_active() {
            inner.pulse_generator.deactivate().await?;
        }
        inner.client.go_to_state(requested).await?;

        let actual = recover(inner.client.current_state().await, InstrumentState::Unknown)?;
        if actual != requested {
            error!("State transition failed: {} -> {}", current.state, requested);
            return Err(ControlError::TransitionFailed {
                from: current.state,
                requested,
                actual,
            });
        }

        if requested == InstrumentState::Observing {
            self.begin_observation_locked(inner).await?;
        }
        self.refresh_locked(inner).await?;
        Ok(())
    }

    async fn begin_observation_locked(&self, inner: &mut Inner) -> AppResult<()> {
        if inner.current().camera_trigger == CameraTrigger::External {
            inner.pulse_generator.activate().await?;
        }
        let spec = inner.observation_spec;
        if spec.is_bounded() {
            inner.runs_started += 1;
            let id = inner.runs_started;
            let target = Arc::new(RunTarget {
                orchestrator: self.clone(),
                run: id,
            });
            let handle = ObservationHandle::spawn(
                spec,
                target,
                self.settings.observation.check_interval,
            );
            inner.observation = Some(ActiveObservation {
                id,
                handle: Arc::new(handle),
            });
        }
        Ok(())
    }

    async fn interrupt_observation_locked(inner: &mut Inner) {
        if let Some(active) = inner.observation.take() {
            active.handle.interrupt().await;
        }
    }

    /// Called by the supervisor of run `run` once a bound is reached.
    async fn end_observation(&self, run: u64) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        match &inner.observation {
            Some(active) if active.id == run => {}
            _ => {
                info!("Observation run {} was already superseded", run);
                return Ok(());
            }
        }
        self.go_to_state_locked(&mut inner, InstrumentState::Ready).await
    }

    /// Enter OBSERVING and return the supervisor of the new run, if bounded.
    pub async fn start_observation(&self) -> AppResult<Option<Arc<ObservationHandle>>> {
        let mut inner = self.inner.lock().await;
        self.go_to_state_locked(&mut inner, InstrumentState::Observing)
            .await?;
        Ok(inner.observation.as_ref().map(|active| active.handle.clone()))
    }

    /// Active supervised observation, if any.
    pub async fn observation(&self) -> Option<Arc<ObservationHandle>> {
        let inner = self.inner.lock().await;
        inner.observation.as_ref().map(|active| active.handle.clone())
    }

    /// Re-enter READY so the camera re-reads its configuration files.
    pub async fn apply_settings_files(&self) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        self.apply_settings_files_locked(&mut inner).await
    }

    async fn apply_settings_files_locked(&self, inner: &mut Inner) -> AppResult<()> {
        if inner.current().state != InstrumentState::Ready {
            return Err(ControlError::NotReady("apply settings".to_string()));
        }
        Ok(inner.client.go_to_state(InstrumentState::Ready).await?)
    }

    // ---------------------------------------------------------------------
    // Observation bounds
    // ---------------------------------------------------------------------

    /// Duration of the next observation; zero for no time bound.
    pub async fn set_observation_time(&self, duration: Duration) {
        let mut inner = self.inner.lock().await;
        info!("Setting observation time to {}", format_observation_time(duration));
        inner.observation_spec.duration = duration;
    }

    /// Parse and store an `hours:minutes:seconds` duration. Blank input is ignored.
    pub async fn set_observation_time_from_string(&self, text: &str) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        Self::set_observation_time_from_string_locked(&mut inner, text)
    }

    fn set_observation_time_from_string_locked(inner: &mut Inner, text: &str) -> AppResult<()> {
        if text.trim().is_empty() {
            return Ok(());
        }
        info!("Setting observation time to {}", text);
        inner.observation_spec.duration = parse_observation_time(text)?;
        Ok(())
    }

    /// Duration of the next observation.
    pub async fn observation_time(&self) -> Duration {
        self.inner.lock().await.observation_spec.duration
    }

    /// Duration of the next observation as `H:MM:SS`.
    pub async fn observation_time_string(&self) -> String {
        format_observation_time(self.observation_time().await)
    }

    /// Trigger count of the next observation; zero for no count bound.
    pub async fn set_observation_trigger_count(&self, count: u64) {
        let mut inner = self.inner.lock().await;
        info!("Setting observation trigger count to {}", count);
        inner.observation_spec.trigger_count = count;
    }

    /// Bounds of the next observation.
    pub async fn observation_spec(&self) -> ObservationSpec {
        self.inner.lock().await.observation_spec
    }

    // ---------------------------------------------------------------------
    // Camera settings
    // ---------------------------------------------------------------------

    /// Point the camera at a configuration file.
    pub async fn set_file_path(&self, kind: ConfigFile, request: FilePathRequest) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        Ok(inner.client.set_file_path(kind, &request).await?)
    }

    /// Switch high voltage. `Unknown` is ignored.
    pub async fn set_high_voltage(&self, requested: OnOffState) -> AppResult<()> {
        self.switch(Subsystem::HighVoltage, requested).await
    }

    /// Switch the LED flasher. `Unknown` is ignored.
    pub async fn set_flasher(&self, requested: OnOffState) -> AppResult<()> {
        self.switch(Subsystem::Flasher, requested).await
    }

    /// Switch data sending. `Unknown` is ignored.
    pub async fn set_data_sending(&self, requested: OnOffState) -> AppResult<()> {
        self.switch(Subsystem::DataSending, requested).await
    }

    async fn switch(&self, subsystem: Subsystem, requested: OnOffState) -> AppResult<()> {
        let on = match requested {
            OnOffState::On => true,
            OnOffState::Off => false,
            OnOffState::Unknown => {
                warn!("Ignoring request to switch {:?} to {}", subsystem, requested);
                return Ok(());
            }
        };
        let mut inner = self.inner.lock().await;
        Ok(inner.client.switch(subsystem, on).await?)
    }

    /// Select one of the three HV presets. Requires READY.
    pub async fn set_high_voltage_level(&self, range: HvRange) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        info!("Setting hv to: {:?}", range);
        Self::require_ready_live(&mut inner, "set hv").await?;
        let path = self.settings.paths.high_voltage(range);
        let request = FilePathRequest::path(path.to_string_lossy());
        Ok(inner
            .client
            .set_file_path(ConfigFile::HighVoltage, &request)
            .await?)
    }

    /// Select a trigger mode. Requires READY.
    pub async fn set_trigger(&self, setting: TriggerSetting) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        info!("Setting trigger to: {}", setting);
        Self::require_ready_live(&mut inner, "set trigger").await?;
        match setting {
            TriggerSetting::External(rate) => {
                self.enable_external_trigger_locked(&mut inner).await?;
                inner.pulse_generator.set_rate(rate.hz()).await?;
            }
            TriggerSetting::Internal { hv, threshold } => {
                let path = self.settings.paths.threshold_file(hv, threshold);
                let request = FilePathRequest::path(path.to_string_lossy());
                inner
                    .client
                    .set_file_path(ConfigFile::Trigger, &request)
                    .await?;
                self.apply_settings_files_locked(&mut inner).await?;
            }
            TriggerSetting::Unknown => warn!("Ignoring unknown trigger setting"),
        }
        Ok(())
    }

    /// Write the external trigger file, select it and re-apply settings.
    pub async fn enable_external_trigger(&self) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        self.enable_external_trigger_locked(&mut inner).await
    }

    async fn enable_external_trigger_locked(&self, inner: &mut Inner) -> AppResult<()> {
        let path = self.settings.paths.trigger_external();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, EXTERNAL_TRIGGER_MARKER).await?;
        let request = FilePathRequest::path(path.to_string_lossy());
        inner
            .client
            .set_file_path(ConfigFile::Trigger, &request)
            .await?;
        self.apply_settings_files_locked(inner).await
    }

    async fn require_ready_live(inner: &mut Inner, action: &str) -> AppResult<()> {
        let state = recover(inner.client.current_state().await, InstrumentState::Unknown)?;
        if state == InstrumentState::Ready {
            Ok(())
        } else {
            warn!("Cannot {}, not in READY", action);
            Err(ControlError::NotReady(action.to_string()))
        }
    }

    // ---------------------------------------------------------------------
    // Pulse generator
    // ---------------------------------------------------------------------

    /// Configure the pulse generator for pedestal runs.
    pub async fn setup_pedestal(&self) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        Ok(inner.pulse_generator.setup_pedestal().await?)
    }

    /// Configure the pulse generator for transfer function runs.
    pub async fn setup_transfer_function(&self) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        Ok(inner.pulse_generator.setup_transfer_function().await?)
    }

    /// Set the pulse generator rate.
    pub async fn set_pulse_rate(&self, hz: u32) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        Ok(inner.pulse_generator.set_rate(hz).await?)
    }

    /// Last requested pulse rate.
    pub async fn pulse_rate(&self) -> Option<u32> {
        self.inner.lock().await.pulse_generator.rate()
    }

    /// Whether pulse output is on.
    pub async fn pulse_generator_active(&self) -> bool {
        self.inner.lock().await.pulse_generator.is_active()
    }

    // ---------------------------------------------------------------------
    // Persisted configuration
    // ---------------------------------------------------------------------

    /// Replay the persisted configuration and keep it updated on refresh.
    pub async fn enable_gui_config(&self) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        self.enable_gui_config_locked(&mut inner).await
    }

    /// Stop updating the persisted configuration.
    pub async fn disable_gui_config(&self) {
        self.inner.lock().await.gui_config_enabled = false;
    }

    async fn enable_gui_config_locked(&self, inner: &mut Inner) -> AppResult<()> {
        inner.gui_config_enabled = true;
        let path = self.settings.paths.gui_config();
        let Some(config) = GuiConfig::read(&path).await? else {
            return Ok(());
        };
        info!("Loading gui config: {}", path.display());
        for (kind, file) in &config.files {
            inner
                .client
                .set_file_path(*kind, &FilePathRequest::path(file.as_str()))
                .await?;
        }
        if let Some(obstime) = &config.observation_time {
            if let Err(e) = Self::set_observation_time_from_string_locked(inner, obstime) {
                warn!("{}", e);
            }
        }
        Ok(())
    }
}

/// Supervisor view of the orchestrator for one run.
struct RunTarget {
    orchestrator: Orchestrator,
    run: u64,
}

#[async_trait]
impl ObservationTarget for RunTarget {
    async fn trigger_count(&self) -> Result<u64, ControlError> {
        self.orchestrator.backplane_trigger_count().await
    }

    async fn end_observation(&self) -> Result<(), ControlError> {
        self.orchestrator.end_observation(self.run).await
    }
}

/// Degrade a timed-out query to `fallback`.
fn recover<T>(result: Result<T, ProtocolError>, fallback: T) -> Result<T, ProtocolError> {
    match result {
        Err(e) if e.is_recoverable() => {
            warn!("{}", e);
            Ok(fallback)
        }
        other => other,
    }
}

async fn query_status(
    client: &mut ProtocolClient,
    settings: &Settings,
    pulse_rate: Option<u32>,
) -> Result<StatusSnapshot, ProtocolError> {
    let state = recover(client.current_state().await, InstrumentState::Unknown)?;
    let transitions = recover(client.allowed_transitions().await, Vec::new())?;
    let high_voltage = recover(client.hv_status().await, OnOffState::Unknown)?;
    let flasher = recover(client.flasher_status().await, OnOffState::Unknown)?;
    let data_sending = recover(client.data_sending_status().await, OnOffState::Unknown)?;

    let mut paths = ConfigPaths::default();
    for kind in ConfigFile::ALL {
        *paths.slot_mut(kind) = recover(client.file_path(kind).await, String::new())?;
    }
    let camera_trigger = recover(client.trigger_type().await, CameraTrigger::Unknown)?;

    let defaults = &settings.paths;
    Ok(StatusSnapshot {
        state,
        transitions,
        high_voltage,
        flasher,
        data_sending,
        hv_level: hv_level_for(&paths.high_voltage, defaults),
        trigger: trigger_for(&paths.trigger, defaults, pulse_rate),
        paths,
        camera_trigger,
        captured_at: Local::now(),
    })
}
