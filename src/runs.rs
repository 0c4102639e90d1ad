//! Calibration run recipes.
//!
//! Recipes only use the orchestrator's public surface. A run writes the run
//! card, configures the pulse generator for external triggering, sets the
//! amplifier pedestal voltage (Vped) and then enters OBSERVING for
//! `events / rate` seconds, once per Vped value.

use crate::config::DefaultPaths;
use crate::error::ControlError;
use crate::orchestrator::Orchestrator;
use crate::state::{ConfigFile, FilePathRequest, OnOffState};
use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Number of ASICs per module carrying a Vped register.
const ASICS: u32 = 4;

/// Run card consumed by the camera server's data watcher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunCard {
    /// Run type (`ped`, `tf`, ...).
    pub run_type: String,
    /// Output directory.
    pub directory: PathBuf,
    /// Data file format.
    pub file_format: String,
    /// Watcher poll period.
    pub watcher_sleep: u32,
    /// Global run number file.
    pub run_number_file: PathBuf,
}

impl RunCard {
    /// File contents.
    pub fn render(&self) -> String {
        format!(
            "RunType={}\nDirectory={}\nFileFormat={}\nWatcherSleep={}\nRunNumberFile={}\n",
            self.run_type,
            self.directory.display(),
            self.file_format,
            self.watcher_sleep,
            self.run_number_file.display()
        )
    }

    /// Write the card to `path`.
    pub async fn write(&self, path: &Path) -> Result<()> {
        ensure_parent(path).await?;
        tokio::fs::write(path, self.render())
            .await
            .with_context(|| format!("Failed to write run card {}", path.display()))
    }
}

/// Write a register settings file setting every ASIC's Vped to `vped`.
pub async fn write_vped_settings(path: &Path, vped: u32) -> Result<()> {
    let contents: String = (0..ASICS)
        .map(|asic| format!("M:*/F|ASIC{}_Vped={}\n", asic, vped))
        .collect();
    ensure_parent(path).await?;
    tokio::fs::write(path, contents)
        .await
        .with_context(|| format!("Failed to write Vped settings {}", path.display()))
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    Ok(())
}

/// Read the next run number: the first line from its eleventh character on.
pub async fn read_run_number(path: &Path) -> Result<u64> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read run number file {}", path.display()))?;
    let line = text.lines().next().unwrap_or_default();
    line.get(10..)
        .map(str::trim)
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| anyhow!("Malformed run number line {:?} in {}", line, path.display()))
}

/// Calibration sequence kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CalibrationKind {
    /// Pedestal: one run at the default Vped.
    Pedestal,
    /// Transfer function: one run per Vped step.
    TransferFunction,
}

impl CalibrationKind {
    fn run_type(self) -> &'static str {
        match self {
            CalibrationKind::Pedestal => "ped",
            CalibrationKind::TransferFunction => "tf",
        }
    }

    fn label(self) -> &'static str {
        match self {
            CalibrationKind::Pedestal => "PED",
            CalibrationKind::TransferFunction => "TF",
        }
    }
}

/// Result of a calibration sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunOutcome {
    /// Runs that reached their natural end.
    pub completed: usize,
    /// Whether a run was interrupted, stopping the sequence.
    pub interrupted: bool,
}

/// A pedestal or transfer function sequence.
#[derive(Clone, Debug)]
pub struct CalibrationRun {
    /// Sequence kind.
    pub kind: CalibrationKind,
    /// Events per run.
    pub events: u64,
    /// Pulse rate in hertz.
    pub rate: u32,
    /// Vped per run.
    pub vped: Vec<u32>,
    /// Vped restored afterwards.
    pub default_vped: u32,
    /// Output directory written to the run card.
    pub directory: PathBuf,
    /// Data file format.
    pub file_format: String,
    /// Watcher poll period.
    pub watcher_sleep: u32,
    /// Where the run card, settings and run number files live.
    pub paths: DefaultPaths,
}

impl CalibrationRun {
    /// One run of 20000 events at 600 Hz.
    pub fn pedestal(paths: DefaultPaths) -> Self {
        Self {
            kind: CalibrationKind::Pedestal,
            events: 20_000,
            rate: 600,
            vped: vec![1050],
            ..Self::base(paths)
        }
    }

    /// 50 runs of 1000 events at 600 Hz, Vped 800 to 2760 in steps of 40.
    pub fn transfer_function(paths: DefaultPaths) -> Self {
        Self {
            kind: CalibrationKind::TransferFunction,
            events: 1000,
            rate: 600,
            vped: (0..50).map(|i| 800 + i * 40).collect(),
            ..Self::base(paths)
        }
    }

    fn base(paths: DefaultPaths) -> Self {
        Self {
            kind: CalibrationKind::Pedestal,
            events: 0,
            rate: 1,
            vped: Vec::new(),
            default_vped: 1050,
            directory: PathBuf::from("/d1/checM"),
            file_format: "tio".to_string(),
            watcher_sleep: 40_000,
            paths,
        }
    }

    /// Observation time of a single run.
    pub fn observation_time(&self) -> Duration {
        Duration::from_secs_f64(self.events as f64 / f64::from(self.rate.max(1)))
    }

    /// Run card for this sequence.
    pub fn run_card(&self) -> RunCard {
        RunCard {
            run_type: self.kind.run_type().to_string(),
            directory: self.directory.clone(),
            file_format: self.file_format.clone(),
            watcher_sleep: self.watcher_sleep,
            run_number_file: self.paths.run_number(),
        }
    }

    /// Execute the sequence. The camera must be in READY.
    pub async fn run(&self, orchestrator: &Orchestrator) -> Result<RunOutcome> {
        orchestrator.disable_gui_config().await;
        let outcome = self.run_sequence(orchestrator).await;
        orchestrator
            .enable_gui_config()
            .await
            .context("Failed to restore persisted configuration")?;
        outcome
    }

    async fn run_sequence(&self, orchestrator: &Orchestrator) -> Result<RunOutcome> {
        self.run_card()
            .write(&self.paths.config_file(ConfigFile::Run))
            .await?;
        match self.kind {
            CalibrationKind::Pedestal => orchestrator.setup_pedestal().await?,
            CalibrationKind::TransferFunction => orchestrator.setup_transfer_function().await?,
        }
        orchestrator.set_pulse_rate(self.rate).await?;
        orchestrator.set_data_sending(OnOffState::On).await?;
        orchestrator
            .enable_external_trigger()
            .await
            .context("Failed to enable external trigger")?;

        let mut outcome = RunOutcome {
            completed: 0,
            interrupted: false,
        };
        for vped in &self.vped {
            self.set_vped(orchestrator, *vped).await?;
            if self.begin_run(orchestrator).await? {
                outcome.completed += 1;
            } else {
                warn!("{} run interrupted", self.kind.label());
                outcome.interrupted = true;
                break;
            }
        }
        self.set_vped(orchestrator, self.default_vped).await?;
        Ok(outcome)
    }

    async fn set_vped(&self, orchestrator: &Orchestrator, vped: u32) -> Result<()> {
        info!("Setting vped to {}", vped);
        let path = self.paths.run_settings();
        write_vped_settings(&path, vped).await?;
        orchestrator
            .set_file_path(
                ConfigFile::Settings,
                FilePathRequest::path(path.to_string_lossy()),
            )
            .await?;
        match orchestrator.apply_settings_files().await {
            Err(ControlError::NotReady(_)) => {
                warn!("Not in READY, could not set vped to {}", vped);
                Ok(())
            }
            other => Ok(other?),
        }
    }

    /// One observation; returns whether it reached its natural end.
    async fn begin_run(&self, orchestrator: &Orchestrator) -> Result<bool> {
        let run_number_file = self.paths.run_number();
        match read_run_number(&run_number_file).await {
            Ok(number) => info!("[START] Run type: {}, Run number: {}", self.kind.label(), number),
            Err(e) => warn!("[START] Run type: {}, run number unavailable: {:#}", self.kind.label(), e),
        }

        let run_card = self.paths.config_file(ConfigFile::Run);
        orchestrator
            .set_file_path(ConfigFile::Run, FilePathRequest::path(run_card.to_string_lossy()))
            .await?;
        orchestrator
            .set_observation_time(self.observation_time())
            .await;

        let handle = orchestrator
            .start_observation()
            .await?
            .ok_or_else(|| anyhow!("Observation started without a supervisor"))?;
        handle.wait_for_end().await;
        Ok(handle.reached_natural_end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recipes() {
        let paths = DefaultPaths::rooted_at("/ci");
        let pedestal = CalibrationRun::pedestal(paths.clone());
        assert_eq!(pedestal.vped, vec![1050]);
        assert_eq!(pedestal.observation_time(), Duration::from_secs_f64(20_000.0 / 600.0));

        let tf = CalibrationRun::transfer_function(paths);
        assert_eq!(tf.vped.len(), 50);
        assert_eq!(tf.vped.first(), Some(&800));
        assert_eq!(tf.vped.last(), Some(&2760));
        assert_eq!(tf.run_card().run_type, "tf");
    }

    #[test]
    fn run_card_format() {
        let card = RunCard {
            run_type: "ped".into(),
            directory: "/d1/checM".into(),
            file_format: "tio".into(),
            watcher_sleep: 40_000,
            run_number_file: "/ci/files/runnumber.dat".into(),
        };
        assert_eq!(
            card.render(),
            "RunType=ped\nDirectory=/d1/checM\nFileFormat=tio\nWatcherSleep=40000\nRunNumberFile=/ci/files/runnumber.dat\n"
        );
    }

    #[tokio::test]
    async fn vped_and_run_number_files() {
        let dir = tempfile::tempdir().unwrap();
        let settings = dir.path().join("GUIRunSetting.cfg");
        write_vped_settings(&settings, 1090).await.unwrap();
        let text = tokio::fs::read_to_string(&settings).await.unwrap();
        assert_eq!(
            text,
            "M:*/F|ASIC0_Vped=1090\nM:*/F|ASIC1_Vped=1090\nM:*/F|ASIC2_Vped=1090\nM:*/F|ASIC3_Vped=1090\n"
        );

        let run_number = dir.path().join("runnumber.dat");
        tokio::fs::write(&run_number, "runnumber=1234\n").await.unwrap();
        assert_eq!(read_run_number(&run_number).await.unwrap(), 1234);

        tokio::fs::write(&run_number, "short\n").await.unwrap();
        assert!(read_run_number(&run_number).await.is_err());
    }
}
