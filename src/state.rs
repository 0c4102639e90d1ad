//! Camera state machine vocabulary.
//!
//! Everything the camera server reports is reduced to one of the closed
//! enumerations below. Parsing is deliberately lenient (case-insensitive names,
//! numeric codes) because the strings come from an external process; anything
//! that does not parse maps to the type's `Unknown` sentinel at the protocol
//! layer rather than failing the caller.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Operational state of the camera.
///
/// `Disconnected` is local: it is reported when no camera server session is
/// attached. Every other state is read from the camera server.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum InstrumentState {
    /// No camera server session.
    Disconnected,
    /// Connected, state not reported.
    Unknown,
    /// Camera powered off.
    Off,
    /// Powered, health monitored, daytime state.
    Safe,
    /// Subsystems on, waiting for nominal temperature.
    Standby,
    /// Ready for data taking.
    Ready,
    /// Taking science data.
    Observing,
    /// Calibration involving other telescope subsystems.
    Calibration,
    /// Engineering mode.
    Maintenance,
    /// Severe internal error.
    Fault,
}

impl InstrumentState {
    /// All states in their natural order.
    pub const ALL: [InstrumentState; 10] = [
        InstrumentState::Disconnected,
        InstrumentState::Unknown,
        InstrumentState::Off,
        InstrumentState::Safe,
        InstrumentState::Standby,
        InstrumentState::Ready,
        InstrumentState::Observing,
        InstrumentState::Calibration,
        InstrumentState::Maintenance,
        InstrumentState::Fault,
    ];

    /// Upper-case name used in logs and by the camera server.
    pub fn name(self) -> &'static str {
        match self {
            InstrumentState::Disconnected => "DISCONNECTED",
            InstrumentState::Unknown => "UNKNOWN",
            InstrumentState::Off => "OFF",
            InstrumentState::Safe => "SAFE",
            InstrumentState::Standby => "STANDBY",
            InstrumentState::Ready => "READY",
            InstrumentState::Observing => "OBSERVING",
            InstrumentState::Calibration => "CALIBRATION",
            InstrumentState::Maintenance => "MAINTENANCE",
            InstrumentState::Fault => "FAULT",
        }
    }

    /// Camera server command that requests this state (`toready`, ...).
    pub fn transition_command(self) -> String {
        format!("to{}", self.name().to_lowercase())
    }

    /// Operator-facing description of the state.
    pub fn description(self) -> &'static str {
        match self {
            InstrumentState::Disconnected => {
                "No connection to the camera server. The last known configuration is shown."
            }
            InstrumentState::Unknown => {
                "The camera server is connected but did not report a state."
            }
            InstrumentState::Off => "This is the state of the camera when powered off.",
            InstrumentState::Safe => {
                "Initial state after a cold start and the state in which the camera spends \
                 the day. At the end of the night or during an emergency the camera must be \
                 in this state. Health and safety functions are monitored. A power-off \
                 requires the camera to be in SAFE."
            }
            InstrumentState::Standby => {
                "All subsystems are powered on and the camera has reached its nominal \
                 temperature. After a cold start this state is reached once the camera \
                 has cooled."
            }
            InstrumentState::Ready => {
                "The camera is ready for science data acquisition. This is the normal \
                 waiting state; data can only be requested from READY. Configuration \
                 presets are applied while in this state."
            }
            InstrumentState::Observing => {
                "The camera is taking science data. After each run the camera returns to \
                 READY. Problems during exposure may cause an automatic transition to FAULT."
            }
            InstrumentState::Calibration => {
                "Entered whenever a calibration procedure involving other telescope \
                 subsystems is requested. Actions available in READY or OBSERVING may \
                 also be performed here."
            }
            InstrumentState::Maintenance => {
                "Engineering mode. The telescope cannot acquire science data. This is the \
                 only state reachable from FAULT, and all recovery procedures run here."
            }
            InstrumentState::Fault => {
                "Entered automatically when a severe internal error is raised. Leaving it \
                 requires human intervention through MAINTENANCE."
            }
        }
    }
}

impl fmt::Display for InstrumentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for InstrumentState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase();
        InstrumentState::ALL
            .into_iter()
            .find(|state| state.name() == upper)
            .ok_or_else(|| s.to_string())
    }
}

/// One-step reachability between camera states.
///
/// When connected, the camera server is the authority (`transition` query).
/// [`TransitionTable::fallback`] is used when the camera is simulated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransitionTable {
    edges: BTreeMap<InstrumentState, Vec<InstrumentState>>,
}

impl TransitionTable {
    /// Static table used for the simulated camera.
    pub fn fallback() -> Self {
        use InstrumentState::*;
        let edges = BTreeMap::from([
            (Disconnected, vec![]),
            (Unknown, vec![Safe]),
            (Off, vec![Safe]),
            (Safe, vec![Standby, Off]),
            (Standby, vec![Ready, Maintenance, Safe, Standby]),
            (Ready, vec![Observing, Calibration, Maintenance, Safe, Ready]),
            (Observing, vec![Ready, Safe]),
            (Calibration, vec![Ready, Safe]),
            (Maintenance, vec![Ready, Safe]),
            (Fault, vec![Maintenance]),
        ]);
        Self { edges }
    }

    /// States reachable from `from` in one step.
    pub fn allowed(&self, from: InstrumentState) -> &[InstrumentState] {
        self.edges.get(&from).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether `from -> to` is a legal single step.
    pub fn is_allowed(&self, from: InstrumentState, to: InstrumentState) -> bool {
        self.allowed(from).contains(&to)
    }
}

impl Default for TransitionTable {
    fn default() -> Self {
        Self::fallback()
    }
}

/// Status of a switchable subsystem (HV, flasher, data sending).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OnOffState {
    /// Switched off.
    Off,
    /// Switched on.
    On,
    /// Could not be determined; treat as possibly on.
    #[default]
    Unknown,
}

impl OnOffState {
    /// Decode the camera server's numeric code (0, 1, -1).
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => OnOffState::Off,
            1 => OnOffState::On,
            _ => OnOffState::Unknown,
        }
    }
}

impl fmt::Display for OnOffState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OnOffState::Off => "OFF",
            OnOffState::On => "ON",
            OnOffState::Unknown => "MAYBEON",
        })
    }
}

/// Trigger source as reported by the camera itself.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CameraTrigger {
    /// Triggers come from the pulse generator.
    External,
    /// Triggers are generated by the camera's threshold logic.
    Internal,
    /// Not reported.
    #[default]
    Unknown,
}

impl CameraTrigger {
    /// Decode the camera server's numeric code (0 external, 1 internal).
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => CameraTrigger::External,
            1 => CameraTrigger::Internal,
            _ => CameraTrigger::Unknown,
        }
    }
}

/// High-voltage level derived from the HV settings file in use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HvLevel {
    /// HV file is not one of the well-known presets.
    #[default]
    Unknown,
    /// `hvSetting_1`.
    Low,
    /// `hvSetting_2`.
    Medium,
    /// `hvSetting_3`.
    High,
}

impl From<HvRange> for HvLevel {
    fn from(range: HvRange) -> Self {
        match range {
            HvRange::Low => HvLevel::Low,
            HvRange::Medium => HvLevel::Medium,
            HvRange::High => HvLevel::High,
        }
    }
}

/// One of the three high-voltage presets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HvRange {
    /// Preset 1.
    Low,
    /// Preset 2.
    Medium,
    /// Preset 3.
    High,
}

impl HvRange {
    /// Index used in the HV and threshold file names.
    pub fn preset(self) -> u8 {
        match self {
            HvRange::Low => 1,
            HvRange::Medium => 2,
            HvRange::High => 3,
        }
    }

    /// Inverse of [`HvRange::preset`].
    pub fn from_preset(preset: u8) -> Option<Self> {
        match preset {
            1 => Some(HvRange::Low),
            2 => Some(HvRange::Medium),
            3 => Some(HvRange::High),
            _ => None,
        }
    }

    fn label(self) -> &'static str {
        match self {
            HvRange::Low => "HVLOW",
            HvRange::Medium => "HVMED",
            HvRange::High => "HVHIGH",
        }
    }
}

impl FromStr for HvRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "l" | "low" => Ok(HvRange::Low),
            "m" | "med" | "medium" => Ok(HvRange::Medium),
            "h" | "high" => Ok(HvRange::High),
            _ => Err(s.to_string()),
        }
    }
}

/// Pulse generator rates offered for external triggering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExternalRate {
    /// 10 Hz.
    Hz10,
    /// 50 Hz.
    Hz50,
    /// 300 Hz.
    Hz300,
    /// 600 Hz.
    Hz600,
}

impl ExternalRate {
    /// Rate in hertz.
    pub fn hz(self) -> u32 {
        match self {
            ExternalRate::Hz10 => 10,
            ExternalRate::Hz50 => 50,
            ExternalRate::Hz300 => 300,
            ExternalRate::Hz600 => 600,
        }
    }

    /// Match a pulse generator rate against the offered presets.
    pub fn from_hz(hz: u32) -> Option<Self> {
        match hz {
            10 => Some(ExternalRate::Hz10),
            50 => Some(ExternalRate::Hz50),
            300 => Some(ExternalRate::Hz300),
            600 => Some(ExternalRate::Hz600),
            _ => None,
        }
    }
}

/// Photoelectron thresholds available for internal triggering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Threshold {
    /// 2 p.e.
    Pe2,
    /// 5 p.e.
    Pe5,
    /// 11 p.e.
    Pe11,
    /// 78 p.e.
    Pe78,
    /// 128 p.e.
    Pe128,
    /// 178 p.e.
    Pe178,
    /// 228 p.e.
    Pe228,
}

impl Threshold {
    /// Threshold in photoelectrons.
    pub fn pe(self) -> u16 {
        match self {
            Threshold::Pe2 => 2,
            Threshold::Pe5 => 5,
            Threshold::Pe11 => 11,
            Threshold::Pe78 => 78,
            Threshold::Pe128 => 128,
            Threshold::Pe178 => 178,
            Threshold::Pe228 => 228,
        }
    }

    /// Match a photoelectron count against the available thresholds.
    pub fn from_pe(pe: u16) -> Option<Self> {
        match pe {
            2 => Some(Threshold::Pe2),
            5 => Some(Threshold::Pe5),
            11 => Some(Threshold::Pe11),
            78 => Some(Threshold::Pe78),
            128 => Some(Threshold::Pe128),
            178 => Some(Threshold::Pe178),
            228 => Some(Threshold::Pe228),
            _ => None,
        }
    }
}

/// Operator-level trigger mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerSetting {
    /// Trigger file is not a known preset.
    #[default]
    Unknown,
    /// Pulse-generator triggering at a fixed rate.
    External(ExternalRate),
    /// Camera threshold triggering.
    Internal {
        /// HV preset the threshold was calibrated for.
        hv: HvRange,
        /// Threshold level.
        threshold: Threshold,
    },
}

impl fmt::Display for TriggerSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerSetting::Unknown => f.write_str("UNKNOWN"),
            TriggerSetting::External(rate) => write!(f, "EXTERNAL_{}Hz", rate.hz()),
            TriggerSetting::Internal { hv, threshold } => {
                write!(f, "INTERNAL_{}_{}pe", hv.label(), threshold.pe())
            }
        }
    }
}

impl FromStr for TriggerSetting {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase();
        if upper == "UNKNOWN" {
            return Ok(TriggerSetting::Unknown);
        }
        if let Some(rate) = upper
            .strip_prefix("EXTERNAL_")
            .and_then(|r| r.strip_suffix("HZ"))
        {
            return rate
                .parse()
                .ok()
                .and_then(ExternalRate::from_hz)
                .map(TriggerSetting::External)
                .ok_or_else(|| s.to_string());
        }
        let internal = upper.strip_prefix("INTERNAL_").ok_or_else(|| s.to_string())?;
        let (hv, level) = internal.split_once('_').ok_or_else(|| s.to_string())?;
        let hv = match hv {
            "HVLOW" => HvRange::Low,
            "HVMED" => HvRange::Medium,
            "HVHIGH" => HvRange::High,
            _ => return Err(s.to_string()),
        };
        let threshold = level
            .strip_suffix("PE")
            .and_then(|pe| pe.parse().ok())
            .and_then(Threshold::from_pe)
            .ok_or_else(|| s.to_string())?;
        Ok(TriggerSetting::Internal { hv, threshold })
    }
}

/// The seven configuration files the camera server reads on entering READY.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfigFile {
    /// Main camera configuration.
    Config,
    /// Monitor configuration.
    MonitorConfig,
    /// Register settings (Vped, trigger type, ...).
    Settings,
    /// Run card.
    Run,
    /// High-voltage settings.
    HighVoltage,
    /// LED flasher settings.
    Led,
    /// Trigger threshold settings.
    Trigger,
}

impl ConfigFile {
    /// All file kinds.
    pub const ALL: [ConfigFile; 7] = [
        ConfigFile::Config,
        ConfigFile::MonitorConfig,
        ConfigFile::Settings,
        ConfigFile::Run,
        ConfigFile::HighVoltage,
        ConfigFile::Led,
        ConfigFile::Trigger,
    ];

    /// Query returning the current path.
    pub fn get_command(self) -> &'static str {
        match self {
            ConfigFile::Config => "getconfig",
            ConfigFile::MonitorConfig => "getmon",
            ConfigFile::Settings => "getset",
            ConfigFile::Run => "getrun",
            ConfigFile::HighVoltage => "gethv",
            ConfigFile::Led => "getled",
            ConfigFile::Trigger => "gettrigger",
        }
    }

    /// Command keyword that sets the path.
    pub fn set_command(self) -> &'static str {
        match self {
            ConfigFile::Config => "configfile",
            ConfigFile::MonitorConfig => "monfile",
            ConfigFile::Settings => "setfile",
            ConfigFile::Run => "runfile",
            ConfigFile::HighVoltage => "hvfile",
            ConfigFile::Led => "ledfile",
            ConfigFile::Trigger => "trifile",
        }
    }

    /// Inverse of [`ConfigFile::set_command`].
    pub fn from_set_command(keyword: &str) -> Option<Self> {
        ConfigFile::ALL
            .into_iter()
            .find(|kind| kind.set_command() == keyword)
    }
}

impl fmt::Display for ConfigFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConfigFile::Config => "config",
            ConfigFile::MonitorConfig => "monitor-config",
            ConfigFile::Settings => "settings",
            ConfigFile::Run => "run",
            ConfigFile::HighVoltage => "high-voltage",
            ConfigFile::Led => "LED",
            ConfigFile::Trigger => "trigger",
        })
    }
}

/// Path argument of a file setter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FilePathRequest {
    /// Use this path.
    Path(String),
    /// Let the camera server fall back to its built-in default.
    Default,
}

impl FilePathRequest {
    /// Explicit path request.
    pub fn path(path: impl Into<String>) -> Self {
        FilePathRequest::Path(path.into())
    }
}
