//! InferMesh Settings
//!
//! Settings file management for the InferMesh binaries.
//!
//! ## Usage
//!
//! ```no_run
//! use infermesh_settings::Settings;
//!
//! // Load or create default settings
//! let mut settings = Settings::load_or_default()?;
//!
//! // Modify settings
//! settings.mesh.negotiation.max_attempts = 5;
//!
//! // Save settings
//! settings.save()?;
//! # Ok::<(), infermesh_settings::SettingsError>(())
//! ```

mod config;

pub use config::Settings;

use std::path::PathBuf;

use infermesh_keystore::default_config_dir;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read settings: {0}")]
    ReadError(std::io::Error),

    #[error("Failed to write settings: {0}")]
    WriteError(std::io::Error),

    #[error("Failed to parse settings: {0}")]
    ParseError(serde_json::Error),

    #[error("Failed to create config directory: {0}")]
    CreateDirError(std::io::Error),

    #[error("Invalid settings: {0}")]
    Invalid(#[from] infermesh_core::CoreError),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

/// Get the default settings file path
pub fn default_settings_path() -> PathBuf {
    default_config_dir().join("settings.json")
}
