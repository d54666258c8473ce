//! Application configuration for Phasewatch.
//!
//! User config lives at `~/.phasewatch/phasewatch.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PhasewatchError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "phasewatch.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".phasewatch";

// ---------------------------------------------------------------------------
// Config structs (matching phasewatch.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Live dashboard settings.
    #[serde(default)]
    pub dashboard: DashboardSettings,

    /// Event export settings.
    #[serde(default)]
    pub export: ExportSettings,
}

/// `[dashboard]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardSettings {
    /// Interval between background frames.
    #[serde(default = "default_refresh_ms")]
    pub refresh_ms: u64,

    /// Upper bound on how long `stop()` waits for the render thread.
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,

    /// Rows reserved for the inline dashboard viewport.
    #[serde(default = "default_viewport_height")]
    pub viewport_height: u16,

    /// Pause after the final frame so it stays readable before teardown.
    #[serde(default = "default_final_linger_ms")]
    pub final_linger_ms: u64,
}

impl Default for DashboardSettings {
    fn default() -> Self {
        Self {
            refresh_ms: default_refresh_ms(),
            join_timeout_ms: default_join_timeout_ms(),
            viewport_height: default_viewport_height(),
            final_linger_ms: default_final_linger_ms(),
        }
    }
}

fn default_refresh_ms() -> u64 {
    500
}
fn default_join_timeout_ms() -> u64 {
    1000
}
fn default_viewport_height() -> u16 {
    24
}
fn default_final_linger_ms() -> u64 {
    100
}

/// `[export]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportSettings {
    /// Default JSON-lines file for event export (none = export disabled).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl AppConfig {
    /// Reject settings the dashboard cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.dashboard.refresh_ms == 0 {
            return Err(PhasewatchError::config(
                "dashboard.refresh_ms must be greater than zero",
            ));
        }
        if self.dashboard.viewport_height < 8 {
            return Err(PhasewatchError::config(format!(
                "dashboard.viewport_height must be at least 8 rows (got {})",
                self.dashboard.viewport_height
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.phasewatch/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| PhasewatchError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.phasewatch/phasewatch.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| PhasewatchError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        PhasewatchError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    config.validate()?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| PhasewatchError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| PhasewatchError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| PhasewatchError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("refresh_ms"));
        assert!(toml_str.contains("join_timeout_ms"));
    }

    #[test]
    fn partial_section_falls_back_to_defaults() {
        let toml_str = r#"
[dashboard]
refresh_ms = 250

[export]
path = "/tmp/phasewatch-events.jsonl"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.dashboard.refresh_ms, 250);
        assert_eq!(config.dashboard.join_timeout_ms, 1000);
        assert_eq!(config.dashboard.viewport_height, 24);
        assert_eq!(
            config.export.path.as_deref(),
            Some("/tmp/phasewatch-events.jsonl")
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_refresh_is_rejected() {
        let mut config = AppConfig::default();
        config.dashboard.refresh_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("refresh_ms"));
    }

    #[test]
    fn load_from_missing_file_is_io_error() {
        let result = load_config_from(Path::new("/nonexistent/phasewatch-test.toml"));
        assert!(matches!(result, Err(PhasewatchError::Io { .. })));
    }
}
