use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use infermesh_core::MeshConfig;
use infermesh_keystore::{default_key_path, expand_path};

use crate::{default_settings_path, Result, SettingsError};

/// Settings file contents: every component section, at top level
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(flatten)]
    pub mesh: MeshConfig,

    /// Where the settings were loaded from (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

impl Settings {
    /// Load settings from the default path, or create defaults
    pub fn load_or_default() -> Result<Self> {
        Self::load_from(&default_settings_path())
    }

    /// Load settings from a specific path, or create defaults.
    ///
    /// Loaded settings are validated; defaults always are valid.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut settings = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(SettingsError::ReadError)?;
            let settings: Settings =
                serde_json::from_str(&content).map_err(SettingsError::ParseError)?;
            settings.mesh.validate()?;
            info!("Loaded settings from {:?}", path);
            settings
        } else {
            Self::default()
        };
        settings.config_path = Some(path.to_path_buf());
        Ok(settings)
    }

    /// Save settings to the path they were loaded from, or the default path
    pub fn save(&self) -> Result<()> {
        let path = self.config_path.clone().unwrap_or_else(default_settings_path);
        self.save_to(&path)
    }

    /// Save settings to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(SettingsError::CreateDirError)?;
            }
        }

        let content = serde_json::to_string_pretty(self).map_err(SettingsError::ParseError)?;
        std::fs::write(path, content).map_err(SettingsError::WriteError)?;
        info!("Saved settings to {:?}", path);
        Ok(())
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Identity keyfile: `network.keyfile` when set, else the default
    pub fn keyfile(&self) -> PathBuf {
        match &self.mesh.network.keyfile {
            Some(path) => expand_path(Path::new(path)),
            None => default_key_path(),
        }
    }
}
