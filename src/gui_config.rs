//! Persisted operator configuration.
//!
//! One `key value` pair per line:
//!
//! ```text
//! config /ci/config/checM.cfg
//! monitorconfig /ci/config/monitor.cfg
//! trigger EXTERNAL_10Hz
//! triggerfile /ci/config/triggerthreshold_setting/gui_external.cfg
//! settings /ci/config/setting.cfg
//! run /ci/config/GUIRunConfig.cfg
//! hv /ci/config/hv_setting/hvSetting_1.cfg
//! led /ci/config/flasher_setting/unit1_led1.cfg
//! obstime 0:00:05
//! ```
//!
//! `trigger` is informational; the trigger file is what gets replayed.

use crate::snapshot::StatusSnapshot;
use crate::state::ConfigFile;
use log::{debug, warn};
use std::io;
use std::path::Path;

const WRITE_ORDER: [ConfigFile; 7] = [
    ConfigFile::Config,
    ConfigFile::MonitorConfig,
    ConfigFile::Trigger,
    ConfigFile::Settings,
    ConfigFile::Run,
    ConfigFile::HighVoltage,
    ConfigFile::Led,
];

fn key(kind: ConfigFile) -> &'static str {
    match kind {
        ConfigFile::Config => "config",
        ConfigFile::MonitorConfig => "monitorconfig",
        ConfigFile::Settings => "settings",
        ConfigFile::Run => "run",
        ConfigFile::HighVoltage => "hv",
        ConfigFile::Led => "led",
        ConfigFile::Trigger => "triggerfile",
    }
}

fn kind_for(key: &str) -> Option<ConfigFile> {
    ConfigFile::ALL.into_iter().find(|kind| self::key(*kind) == key)
}

/// Contents of the persisted configuration file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GuiConfig {
    /// File paths in file order.
    pub files: Vec<(ConfigFile, String)>,
    /// Trigger label at the time of writing.
    pub trigger: Option<String>,
    /// Observation time literal.
    pub observation_time: Option<String>,
}

impl GuiConfig {
    /// Capture the paths of `snapshot` and the current observation time.
    pub fn from_snapshot(snapshot: &StatusSnapshot, observation_time: String) -> Self {
        Self {
            files: WRITE_ORDER
                .into_iter()
                .map(|kind| (kind, snapshot.paths.get(kind).to_string()))
                .collect(),
            trigger: Some(snapshot.trigger.to_string()),
            observation_time: Some(observation_time),
        }
    }

    /// Path recorded for `kind`, if any.
    pub fn file(&self, kind: ConfigFile) -> Option<&str> {
        self.files
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, path)| path.as_str())
    }

    /// Parse file contents. Unknown keys are skipped.
    pub fn parse(text: &str) -> Self {
        let mut config = GuiConfig::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line.split_once(' ').unwrap_or((line, ""));
            let value = value.trim().to_string();
            match key {
                "trigger" => config.trigger = Some(value),
                "obstime" => config.observation_time = Some(value),
                _ => match kind_for(key) {
                    Some(kind) => config.files.push((kind, value)),
                    None => warn!("Ignoring unknown configuration key '{}'", key),
                },
            }
        }
        config
    }

    /// Render file contents.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (kind, path) in &self.files {
            if *kind == ConfigFile::Trigger {
                if let Some(trigger) = &self.trigger {
                    out.push_str(&format!("trigger {}\n", trigger));
                }
            }
            out.push_str(&format!("{} {}\n", key(*kind), path));
        }
        if let Some(obstime) = &self.observation_time {
            out.push_str(&format!("obstime {}\n", obstime));
        }
        out
    }

    /// Read `path`; a missing file is `Ok(None)`.
    pub async fn read(path: &Path) -> io::Result<Option<Self>> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => {
                debug!("Loaded configuration from {}", path.display());
                Ok(Some(Self::parse(&text)))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Overwrite `path`, creating its directory if needed.
    pub async fn write(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, self.render()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ExternalRate, TriggerSetting};

    fn snapshot() -> StatusSnapshot {
        let mut snapshot = StatusSnapshot::initial();
        for kind in ConfigFile::ALL {
            *snapshot.paths.slot_mut(kind) = format!("/ci/config/{}.cfg", key(kind));
        }
        snapshot.trigger = TriggerSetting::External(ExternalRate::Hz50);
        snapshot
    }

    #[test]
    fn renders_in_file_order() {
        let text = GuiConfig::from_snapshot(&snapshot(), "0:00:05".into()).render();
        let keys: Vec<&str> = text
            .lines()
            .filter_map(|l| l.split_whitespace().next())
            .collect();
        assert_eq!(
            keys,
            ["config", "monitorconfig", "trigger", "triggerfile", "settings", "run", "hv", "led", "obstime"]
        );
        assert!(text.contains("trigger EXTERNAL_50Hz\n"));
    }

    #[test]
    fn parse_tolerates_missing_values_and_unknown_keys() {
        let config = GuiConfig::parse("config\nfoo bar\nhv /a b/hv.cfg\n\nobstime 1:00:00\n");
        assert_eq!(config.file(ConfigFile::Config), Some(""));
        assert_eq!(config.file(ConfigFile::HighVoltage), Some("/a b/hv.cfg"));
        assert_eq!(config.file(ConfigFile::Led), None);
        assert_eq!(config.observation_time.as_deref(), Some("1:00:00"));
    }

    #[tokio::test]
    async fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config/gui.cfg");
        assert_eq!(GuiConfig::read(&path).await.unwrap(), None);

        let snapshot = snapshot();
        let written = GuiConfig::from_snapshot(&snapshot, "0:20:00".into());
        written.write(&path).await.unwrap();

        let read = GuiConfig::read(&path).await.unwrap().unwrap();
        assert_eq!(read, written);
        for kind in ConfigFile::ALL {
            assert_eq!(read.file(kind), Some(snapshot.paths.get(kind)));
        }
    }
}
