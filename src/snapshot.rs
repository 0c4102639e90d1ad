//! Published camera status.

use crate::config::DefaultPaths;
use crate::state::{
    CameraTrigger, ConfigFile, ExternalRate, HvLevel, HvRange, InstrumentState, OnOffState,
    TriggerSetting,
};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// The seven configuration file paths reported by the camera server.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigPaths {
    /// Main camera configuration.
    pub config: String,
    /// Monitor configuration.
    pub monitor_config: String,
    /// Register settings.
    pub settings: String,
    /// Run card.
    pub run: String,
    /// High-voltage settings.
    pub high_voltage: String,
    /// LED flasher settings.
    pub led: String,
    /// Trigger settings.
    pub trigger: String,
}

impl ConfigPaths {
    /// Path of one file kind.
    pub fn get(&self, kind: ConfigFile) -> &str {
        match kind {
            ConfigFile::Config => &self.config,
            ConfigFile::MonitorConfig => &self.monitor_config,
            ConfigFile::Settings => &self.settings,
            ConfigFile::Run => &self.run,
            ConfigFile::HighVoltage => &self.high_voltage,
            ConfigFile::Led => &self.led,
            ConfigFile::Trigger => &self.trigger,
        }
    }

    /// Mutable slot of one file kind, for building a snapshot.
    pub fn slot_mut(&mut self, kind: ConfigFile) -> &mut String {
        match kind {
            ConfigFile::Config => &mut self.config,
            ConfigFile::MonitorConfig => &mut self.monitor_config,
            ConfigFile::Settings => &mut self.settings,
            ConfigFile::Run => &mut self.run,
            ConfigFile::HighVoltage => &mut self.high_voltage,
            ConfigFile::Led => &mut self.led,
            ConfigFile::Trigger => &mut self.trigger,
        }
    }
}

/// Immutable view of the camera as of one refresh.
///
/// Shared as `Arc<StatusSnapshot>`; a refresh always publishes a new value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Camera state.
    pub state: InstrumentState,
    /// States reachable in one step.
    pub transitions: Vec<InstrumentState>,
    /// High voltage.
    pub high_voltage: OnOffState,
    /// LED flasher.
    pub flasher: OnOffState,
    /// Data sending.
    pub data_sending: OnOffState,
    /// Configuration file paths.
    pub paths: ConfigPaths,
    /// HV level derived from `paths.high_voltage`.
    pub hv_level: HvLevel,
    /// Trigger mode derived from `paths.trigger`.
    pub trigger: TriggerSetting,
    /// Trigger source reported by the camera.
    pub camera_trigger: CameraTrigger,
    /// When the snapshot was built.
    pub captured_at: DateTime<Local>,
}

impl StatusSnapshot {
    /// Placeholder published before the first refresh.
    pub fn initial() -> Self {
        Self {
            state: InstrumentState::Disconnected,
            transitions: Vec::new(),
            high_voltage: OnOffState::Unknown,
            flasher: OnOffState::Unknown,
            data_sending: OnOffState::Unknown,
            paths: ConfigPaths::default(),
            hv_level: HvLevel::Unknown,
            trigger: TriggerSetting::Unknown,
            camera_trigger: CameraTrigger::Unknown,
            captured_at: Local::now(),
        }
    }

    /// Keep the last known configuration while the camera server is gone.
    pub fn carried_over(&self, defaults: &DefaultPaths, pulse_rate: Option<u32>) -> Self {
        Self {
            state: InstrumentState::Disconnected,
            transitions: Vec::new(),
            hv_level: hv_level_for(&self.paths.high_voltage, defaults),
            trigger: trigger_for(&self.paths.trigger, defaults, pulse_rate),
            captured_at: Local::now(),
            ..self.clone()
        }
    }

    /// Whether `to` is in the allowed transitions.
    pub fn allows(&self, to: InstrumentState) -> bool {
        self.transitions.contains(&to)
    }
}

/// HV level of a settings file, by comparison with the three presets.
pub fn hv_level_for(path: &str, defaults: &DefaultPaths) -> HvLevel {
    [HvRange::Low, HvRange::Medium, HvRange::High]
        .into_iter()
        .find(|range| Path::new(path) == defaults.high_voltage(*range))
        .map_or(HvLevel::Unknown, HvLevel::from)
}

/// Trigger mode of a trigger file.
///
/// The external trigger file maps to the pulse generator's current rate; a
/// threshold file decodes from its name.
pub fn trigger_for(path: &str, defaults: &DefaultPaths, pulse_rate: Option<u32>) -> TriggerSetting {
    if Path::new(path) == defaults.trigger_external() {
        return pulse_rate
            .and_then(ExternalRate::from_hz)
            .map_or(TriggerSetting::Unknown, TriggerSetting::External);
    }
    DefaultPaths::threshold_setting(path).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Threshold;

    #[test]
    fn derives_hv_level_from_preset_files() {
        let defaults = DefaultPaths::rooted_at("/ci");
        let medium = defaults.high_voltage(HvRange::Medium);
        assert_eq!(hv_level_for(&medium.to_string_lossy(), &defaults), HvLevel::Medium);
        assert_eq!(hv_level_for("/elsewhere/hvSetting_2.cfg", &defaults), HvLevel::Unknown);
        assert_eq!(hv_level_for("", &defaults), HvLevel::Unknown);
    }

    #[test]
    fn derives_trigger_from_file_and_rate() {
        let defaults = DefaultPaths::rooted_at("/ci");
        let external = defaults.trigger_external().to_string_lossy().into_owned();
        assert_eq!(
            trigger_for(&external, &defaults, Some(300)),
            TriggerSetting::External(ExternalRate::Hz300)
        );
        assert_eq!(trigger_for(&external, &defaults, Some(42)), TriggerSetting::Unknown);
        assert_eq!(trigger_for(&external, &defaults, None), TriggerSetting::Unknown);

        let threshold = defaults
            .threshold_file(HvRange::High, Threshold::Pe5)
            .to_string_lossy()
            .into_owned();
        assert_eq!(
            trigger_for(&threshold, &defaults, Some(300)),
            TriggerSetting::Internal {
                hv: HvRange::High,
                threshold: Threshold::Pe5
            }
        );
    }

    #[test]
    fn carry_over_forces_disconnected() {
        let defaults = DefaultPaths::rooted_at("/ci");
        let mut live = StatusSnapshot::initial();
        live.state = InstrumentState::Ready;
        live.transitions = vec![InstrumentState::Observing, InstrumentState::Safe];
        live.high_voltage = OnOffState::On;
        live.data_sending = OnOffState::Off;
        live.camera_trigger = CameraTrigger::Internal;
        *live.paths.slot_mut(ConfigFile::HighVoltage) =
            defaults.high_voltage(HvRange::Low).to_string_lossy().into_owned();

        let kept = live.carried_over(&defaults, None);
        assert_eq!(kept.state, InstrumentState::Disconnected);
        assert!(kept.transitions.is_empty());
        assert_eq!(kept.high_voltage, OnOffState::On);
        assert_eq!(kept.data_sending, OnOffState::Off);
        assert_eq!(kept.camera_trigger, CameraTrigger::Internal);
        assert_eq!(kept.paths, live.paths);
        assert_eq!(kept.hv_level, HvLevel::Low);
    }
}
