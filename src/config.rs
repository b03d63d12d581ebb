//! Journaly configuration management

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main Journaly configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JournalyConfig {
    /// Local storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Media download configuration
    #[serde(default)]
    pub media: MediaConfig,

    /// Sync configuration
    #[serde(default)]
    pub sync: SyncConfig,
}

impl JournalyConfig {
    /// Load and validate a TOML configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall the cache or the sync loops
    pub fn validate(&self) -> Result<()> {
        if self.media.max_concurrent_downloads == 0 {
            return Err(Error::Config(
                "media.max_concurrent_downloads must be at least 1".to_string(),
            ));
        }
        if self.media.download_timeout_secs == 0 {
            return Err(Error::Config(
                "media.download_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.sync.event_buffer == 0 {
            return Err(Error::Config(
                "sync.event_buffer must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Default configuration file location (~/.journaly/config.toml)
    pub fn default_path() -> PathBuf {
        base_dir().join("config.toml")
    }
}

/// Local storage configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding cached media files (flat layout)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
}

impl StorageConfig {
    /// Resolved cache directory, falling back to ~/.journaly/media
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| base_dir().join("media"))
    }
}

/// Media download configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Upper bound on simultaneous blob downloads across all URLs
    pub max_concurrent_downloads: usize,

    /// Per-request timeout for HTTP blob downloads
    pub download_timeout_secs: u64,

    /// User agent sent with HTTP blob requests
    pub user_agent: String,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 4,
            download_timeout_secs: 30,
            user_agent: format!("journaly/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Sync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Buffer size for in-process change batch channels
    pub event_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { event_buffer: 64 }
    }
}

fn base_dir() -> PathBuf {
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".journaly")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = JournalyConfig::default();
        assert_eq!(config.media.max_concurrent_downloads, 4);
        assert_eq!(config.media.download_timeout_secs, 30);
        assert_eq!(config.sync.event_buffer, 64);
        assert!(config.storage.cache_dir.is_none());
        assert!(config.storage.cache_dir().ends_with("media"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[storage]
cache_dir = "/tmp/journaly-media"

[media]
max_concurrent_downloads = 2
download_timeout_secs = 10
user_agent = "test-agent"
"#,
        )
        .unwrap();

        let config = JournalyConfig::load(&path).unwrap();
        assert_eq!(
            config.storage.cache_dir(),
            PathBuf::from("/tmp/journaly-media")
        );
        assert_eq!(config.media.max_concurrent_downloads, 2);
        assert_eq!(config.media.user_agent, "test-agent");
        // Missing section falls back to defaults
        assert_eq!(config.sync.event_buffer, 64);
    }

    #[test]
    fn test_load_rejects_zero_concurrency() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[media]\nmax_concurrent_downloads = 0\ndownload_timeout_secs = 5\nuser_agent = \"x\"\n",
        )
        .unwrap();

        let err = JournalyConfig::load(&path).unwrap_err();
        assert_eq!(err.kind(), "config");
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "not = [valid").unwrap();
        assert!(matches!(
            JournalyConfig::load(&path),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_config_toml_round_trip() {
        let config = JournalyConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: JournalyConfig = toml::from_str(&text).unwrap();
        assert_eq!(
            parsed.media.max_concurrent_downloads,
            config.media.max_concurrent_downloads
        );
    }
}
