use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, WaypointError};

/// Top-level configuration for Waypoint.
///
/// Loaded from `~/.waypoint/config.toml` by default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WaypointConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub history: HistoryConfig,
}

impl WaypointConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: WaypointConfig = toml::from_str(&content)?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| WaypointError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Profile directory holding the history stores.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.waypoint/profile".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// History engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Visits older than this many days move to the archived store.
    pub archive_days: u32,
    /// Per-day segment counters older than this are swept.
    pub segment_retention_days: u32,
    /// Delay between a mutation and the batched commit.
    pub commit_interval_secs: u64,
    /// Capacity of the recent redirect chain cache.
    pub max_redirect_chains: usize,
    /// Maximum visits moved per archival sweep.
    pub archive_batch_size: usize,
    /// Interval between archival sweeps while the service runs.
    pub archive_interval_secs: u64,
    /// Favicons older than this are reported as expired.
    pub favicon_refetch_days: u32,
    /// Whether the full-text index store is opened.
    pub text_index_enabled: bool,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            archive_days: 90,
            segment_retention_days: 90,
            commit_interval_secs: 10,
            max_redirect_chains: 32,
            archive_batch_size: 300,
            archive_interval_secs: 30,
            favicon_refetch_days: 7,
            text_index_enabled: true,
        }
    }
}

impl HistoryConfig {
    pub fn archive_threshold(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.archive_days))
    }

    pub fn segment_retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.segment_retention_days))
    }

    pub fn favicon_refetch(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.favicon_refetch_days))
    }

    pub fn commit_interval(&self) -> Duration {
        Duration::from_secs(self.commit_interval_secs)
    }

    pub fn archive_interval(&self) -> Duration {
        Duration::from_secs(self.archive_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_config() {
        let config = WaypointConfig::default();
        assert_eq!(config.general.data_dir, "~/.waypoint/profile");
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.history.archive_days, 90);
        assert_eq!(config.history.segment_retention_days, 90);
        assert_eq!(config.history.commit_interval_secs, 10);
        assert_eq!(config.history.max_redirect_chains, 32);
        assert_eq!(config.history.favicon_refetch_days, 7);
        assert!(config.history.text_index_enabled);
    }

    #[test]
    fn test_load_valid_config() {
        let content = r#"
[general]
data_dir = "/custom/profile"
log_level = "debug"

[history]
archive_days = 30
commit_interval_secs = 2
text_index_enabled = false
"#;
        let file = create_temp_config(content);
        let config = WaypointConfig::load(file.path()).unwrap();
        assert_eq!(config.general.data_dir, "/custom/profile");
        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.history.archive_days, 30);
        assert_eq!(config.history.commit_interval(), Duration::from_secs(2));
        assert!(!config.history.text_index_enabled);
        // Unspecified fields keep defaults.
        assert_eq!(config.history.max_redirect_chains, 32);
    }

    #[test]
    fn test_load_partial_config_uses_defaults() {
        let content = r#"
[general]
log_level = "warn"
"#;
        let file = create_temp_config(content);
        let config = WaypointConfig::load(file.path()).unwrap();
        assert_eq!(config.general.log_level, "warn");
        assert_eq!(config.history.archive_days, 90);
    }

    #[test]
    fn test_load_invalid_toml() {
        let file = create_temp_config("[history\narchive_days = ");
        let err = WaypointConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, WaypointError::Config(_)));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = WaypointConfig::load_or_default(Path::new("/nonexistent/config.toml"));
        assert_eq!(config.general.data_dir, "~/.waypoint/profile");
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = WaypointConfig::default();
        config.history.archive_batch_size = 50;
        config.save(&path).unwrap();

        let reloaded = WaypointConfig::load(&path).unwrap();
        assert_eq!(reloaded.general.data_dir, config.general.data_dir);
        assert_eq!(reloaded.history.archive_batch_size, 50);
    }

    #[test]
    fn test_duration_helpers() {
        let history = HistoryConfig::default();
        assert_eq!(history.archive_threshold(), chrono::Duration::days(90));
        assert_eq!(history.favicon_refetch(), chrono::Duration::days(7));
        assert_eq!(history.archive_interval(), Duration::from_secs(30));
    }
}
