//! Runtime settings for the vault core.

use crate::crypto::KdfParams;
use crate::{Result, VaulticError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level settings, usually loaded from `vaultic.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaulticSettings {
    pub sync: SyncSettings,
    pub kdf: KdfParams,
}

/// Knobs for the backup / sync cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Hard cap on backup rounds triggered by reconciliation
    pub max_repush_rounds: u32,
    /// Per-request timeout for calls to the backup server
    pub request_timeout_secs: u64,
    /// Maximum change-log entries requested per owner on pull
    pub pull_page_limit: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_repush_rounds: 3,
            request_timeout_secs: 30,
            pull_page_limit: 1000,
        }
    }
}

impl SyncSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl VaulticSettings {
    /// Load settings from a TOML file. Missing keys fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let settings: Self =
            toml::from_str(&content).map_err(|e| VaulticError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Write settings as TOML.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| VaulticError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.sync.request_timeout_secs == 0 {
            return Err(VaulticError::Config(
                "sync.request_timeout_secs must be positive".to_string(),
            ));
        }
        if self.sync.pull_page_limit == 0 {
            return Err(VaulticError::Config(
                "sync.pull_page_limit must be positive".to_string(),
            ));
        }
        self.kdf.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let settings = VaulticSettings::default();
        assert_eq!(settings.sync.max_repush_rounds, 3);
        assert_eq!(settings.sync.request_timeout(), Duration::from_secs(30));
        assert_eq!(settings.sync.pull_page_limit, 1000);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[sync]\nmax_repush_rounds = 5").unwrap();

        let settings = VaulticSettings::load(file.path()).unwrap();
        assert_eq!(settings.sync.max_repush_rounds, 5);
        assert_eq!(settings.sync.request_timeout_secs, 30);
        assert_eq!(settings.kdf.mem_cost, 262_144);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vaultic.toml");

        let mut settings = VaulticSettings::default();
        settings.sync.pull_page_limit = 50;
        settings.save(&path).unwrap();

        assert_eq!(VaulticSettings::load(&path).unwrap(), settings);
    }

    #[test]
    fn rejects_invalid_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[sync]\nrequest_timeout_secs = 0").unwrap();
        assert!(matches!(
            VaulticSettings::load(file.path()),
            Err(VaulticError::Config(_))
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "sync = \"nope\"").unwrap();
        assert!(VaulticSettings::load(file.path()).is_err());
    }

    #[test]
    fn empty_pull_page_is_rejected() {
        let mut settings = VaulticSettings::default();
        settings.sync.pull_page_limit = 0;
        assert!(matches!(settings.validate(), Err(VaulticError::Config(_))));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[sync]\npull_page_limit = 0").unwrap();
        assert!(matches!(
            VaulticSettings::load(file.path()),
            Err(VaulticError::Config(_))
        ));
    }
}
