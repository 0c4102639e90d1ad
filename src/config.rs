//! Configuration system using Figment
//!
//! Settings are loaded from:
//! 1. built-in defaults
//! 2. an optional TOML file
//! 3. environment variables prefixed with `CAMOP_` (nested keys use `__`)
//!
//! ```text
//! CAMOP_CONTROLLER__ADDRESS=192.168.0.10
//! CAMOP_CONTROLLER__TIMEOUT=5s
//! CAMOP_PULSE_GENERATOR__ENABLED=false
//! ```
//!
//! # Example
//!
//! ```toml
//! [controller]
//! address = "192.168.0.10"
//! timeout = "10s"
//!
//! [pulse_generator]
//! port = "/dev/pulsegen"
//! baud_rate = 115200
//!
//! [paths]
//! ci_source_dir = "/opt/CHECInterface/trunk"
//! ```

use crate::error::AppResult;
use crate::state::{ConfigFile, HvRange, Threshold, TriggerSetting};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Camera server subprocess.
    #[serde(default)]
    pub controller: ControllerSettings,
    /// Serial pulse generator.
    #[serde(default)]
    pub pulse_generator: PulseGeneratorSettings,
    /// Status polling loop.
    #[serde(default)]
    pub polling: PollingSettings,
    /// Observation supervisor.
    #[serde(default)]
    pub observation: ObservationSettings,
    /// Well-known files.
    #[serde(default)]
    pub paths: DefaultPaths,
}

impl Settings {
    /// Load settings from an optional TOML file plus `CAMOP_` environment overrides.
    pub fn load(file: Option<&Path>) -> AppResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(file) = file {
            figment = figment.merge(Toml::file(file));
        }
        Ok(figment.merge(Env::prefixed("CAMOP_").split("__")).extract()?)
    }
}

/// Camera server subprocess settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerSettings {
    /// Camera address passed to the camera server.
    #[serde(default = "default_address")]
    pub address: String,
    /// Per-read timeout.
    #[serde(default = "default_protocol_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// How long to wait for the startup banner to finish.
    #[serde(default = "default_banner_timeout", with = "humantime_serde")]
    pub banner_timeout: Duration,
    /// Prefix the camera server puts before every response.
    #[serde(default = "default_prompt")]
    pub prompt: String,
    /// Token every completion line must contain.
    #[serde(default = "default_done_token")]
    pub done_token: String,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            address: default_address(),
            timeout: default_protocol_timeout(),
            banner_timeout: default_banner_timeout(),
            prompt: default_prompt(),
            done_token: default_done_token(),
        }
    }
}

/// Pulse generator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PulseGeneratorSettings {
    /// Whether to open the serial link at start-up.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Serial device.
    #[serde(default = "default_pulse_port")]
    pub port: String,
    /// Baud rate.
    #[serde(default = "default_pulse_baud")]
    pub baud_rate: u32,
    /// Reply timeout per command.
    #[serde(default = "default_pulse_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for PulseGeneratorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_pulse_port(),
            baud_rate: default_pulse_baud(),
            timeout: default_pulse_timeout(),
        }
    }
}

/// Status polling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingSettings {
    /// Interval between refreshes.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            interval: default_poll_interval(),
        }
    }
}

/// Observation supervisor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationSettings {
    /// Cadence at which the supervisor re-checks its bounds.
    #[serde(default = "default_supervisor_interval", with = "humantime_serde")]
    pub check_interval: Duration,
}

impl Default for ObservationSettings {
    fn default() -> Self {
        Self {
            check_interval: default_supervisor_interval(),
        }
    }
}

/// Well-known files of a CHEC interface installation.
///
/// Every path is derived from `ci_source_dir` unless overridden.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultPaths {
    /// Root of the camera interface source tree.
    #[serde(default = "default_ci_source_dir")]
    pub ci_source_dir: PathBuf,
    /// Where the operator's UI configuration is persisted.
    #[serde(default)]
    pub gui_config: Option<PathBuf>,
}

impl Default for DefaultPaths {
    fn default() -> Self {
        Self {
            ci_source_dir: default_ci_source_dir(),
            gui_config: None,
        }
    }
}

impl DefaultPaths {
    /// Paths rooted at `ci_source_dir`.
    pub fn rooted_at(ci_source_dir: impl Into<PathBuf>) -> Self {
        Self {
            ci_source_dir: ci_source_dir.into(),
            gui_config: None,
        }
    }

    fn join(&self, relative: &str) -> PathBuf {
        self.ci_source_dir.join(relative)
    }

    /// Camera server executable.
    pub fn executable(&self) -> PathBuf {
        self.join("../build/control_cs")
    }

    /// Camera server log file.
    pub fn log(&self) -> PathBuf {
        self.join("log/camera_driver.log")
    }

    /// Default file of each kind.
    pub fn config_file(&self, kind: ConfigFile) -> PathBuf {
        match kind {
            ConfigFile::Config => self.join("config/checM.cfg"),
            ConfigFile::MonitorConfig => self.join("config/monitor.cfg"),
            ConfigFile::Settings => self.join("config/setting.cfg"),
            ConfigFile::Run => self.join("config/GUIRunConfig.cfg"),
            ConfigFile::HighVoltage => self.high_voltage(HvRange::Low),
            ConfigFile::Led => self.join("config/flasher_setting/unit1_led1.cfg"),
            ConfigFile::Trigger => self.trigger_external(),
        }
    }

    /// Register settings written by calibration runs.
    pub fn run_settings(&self) -> PathBuf {
        self.join("config/GUIRunSetting.cfg")
    }

    /// Global run number file.
    pub fn run_number(&self) -> PathBuf {
        self.join("files/runnumber.dat")
    }

    /// HV preset file.
    pub fn high_voltage(&self, range: HvRange) -> PathBuf {
        self.join(&format!("config/hv_setting/hvSetting_{}.cfg", range.preset()))
    }

    /// Trigger file selecting external triggering.
    pub fn trigger_external(&self) -> PathBuf {
        self.join("config/triggerthreshold_setting/gui_external.cfg")
    }

    /// Threshold file for an internal trigger preset.
    pub fn threshold_file(&self, hv: HvRange, threshold: Threshold) -> PathBuf {
        self.join(&format!(
            "config/triggerthreshold_setting/thresholdSetting_hvSet-{}_{}pe.cfg",
            hv.preset(),
            threshold.pe()
        ))
    }

    /// Persisted UI configuration file.
    pub fn gui_config(&self) -> PathBuf {
        self.gui_config
            .clone()
            .unwrap_or_else(|| self.join("config/gui.cfg"))
    }

    /// Internal trigger preset encoded in a threshold file name.
    ///
    /// Accepts `thresholdSetting_hvSet-<1|2|3>_<N>pe.cfg` in any directory.
    pub fn threshold_setting(path: &str) -> Option<TriggerSetting> {
        let name = Path::new(path).file_name()?.to_str()?;
        let rest = name.split("hvSet-").nth(1)?;
        let hv = HvRange::from_preset(rest.get(..1)?.parse().ok()?)?;
        let level = name.get(name.rfind('_')? + 1..name.rfind('.')?)?;
        let threshold = Threshold::from_pe(level.strip_suffix("pe")?.parse().ok()?)?;
        Some(TriggerSetting::Internal { hv, threshold })
    }
}

fn default_address() -> String {
    "0.0.0.0".to_string()
}

fn default_protocol_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_banner_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_prompt() -> String {
    "CS> ".to_string()
}

fn default_done_token() -> String {
    "done".to_string()
}

fn default_true() -> bool {
    true
}

fn default_pulse_port() -> String {
    "/dev/pulsegen".to_string()
}

fn default_pulse_baud() -> u32 {
    115_200
}

fn default_pulse_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_supervisor_interval() -> Duration {
    Duration::from_millis(10)
}

fn default_ci_source_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join("Software/CHECInterface/trunk")
}
