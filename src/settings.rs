//! Persisted user settings
//!
//! Simple key-value state outside the streaming core's contract: the
//! last-used destination, device selection, and codec preset. Stored as
//! TOML in the platform config directory; a missing or unreadable file
//! yields defaults.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::Error;

const SETTINGS_FILE: &str = "settings.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedSettings {
    pub last_destination: Option<String>,
    pub device_selection: Option<String>,
    pub preset: Option<String>,
    pub gain: Option<f32>,
}

impl PersistedSettings {
    fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "mic-link")
            .map(|dirs| dirs.config_dir().join(SETTINGS_FILE))
    }

    /// Load from the platform config directory; any failure yields
    /// defaults.
    pub fn load() -> Self {
        Self::default_path()
            .map(|path| Self::load_from(&path))
            .unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => toml::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!(error = %e, path = %path.display(), "ignoring unreadable settings");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Save to the platform config directory.
    pub fn save(&self) -> Result<(), Error> {
        let path = Self::default_path()
            .ok_or_else(|| Error::Config("no config directory available".into()))?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("settings serialization failed: {e}")))?;
        std::fs::write(path, raw)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_via_file() {
        let dir = std::env::temp_dir().join("mic-link-settings-test");
        let path = dir.join("settings.toml");
        let _ = std::fs::remove_file(&path);

        let settings = PersistedSettings {
            last_destination: Some("192.168.1.20:5555".into()),
            device_selection: Some("CABLE Input".into()),
            preset: Some("voice-clean".into()),
            gain: Some(2.0),
        };
        settings.save_to(&path).unwrap();
        assert_eq!(PersistedSettings::load_from(&path), settings);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let path = std::env::temp_dir().join("mic-link-no-such-settings.toml");
        assert_eq!(PersistedSettings::load_from(&path), PersistedSettings::default());
    }
}
