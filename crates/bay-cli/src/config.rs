//! Configuration loading and management.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

/// Application configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the archive database.
    pub database_path: PathBuf,
    /// Number of fixed station slots.
    pub station_count: usize,
    /// Refresh tick period in milliseconds.
    pub tick_interval_ms: u64,
    /// Periodic device rediscovery in seconds.
    pub discovery_interval_secs: u64,
    /// Number of tasks executing power commands.
    pub power_workers: usize,
    /// Seconds after which an unchanged power state is sent again.
    pub power_reassert_secs: u64,
    /// Kasa cloud account.
    pub kasa_username: Option<String>,
    pub kasa_password: Option<String>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database_path", &self.database_path)
            .field("station_count", &self.station_count)
            .field("tick_interval_ms", &self.tick_interval_ms)
            .field("discovery_interval_secs", &self.discovery_interval_secs)
            .field("power_workers", &self.power_workers)
            .field("power_reassert_secs", &self.power_reassert_secs)
            .field("kasa_username", &self.kasa_username)
            .field(
                "kasa_password",
                &self.kasa_password.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs_data_path().unwrap_or_else(|| PathBuf::from("."));
        Self {
            database_path: data_dir.join("bay.db"),
            station_count: 16,
            tick_interval_ms: 2500,
            discovery_interval_secs: 300,
            power_workers: 2,
            power_reassert_secs: 60,
            kasa_username: None,
            kasa_password: None,
        }
    }
}

impl Config {
    /// Loads configuration, optionally from a specific file.
    #[expect(
        clippy::result_large_err,
        reason = "figment::Error is large but only returned at startup"
    )]
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(config_dir) = dirs_config_path() {
            figment = figment.merge(Toml::file(config_dir.join("config.toml")));
        }

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // BAY_* environment variables win
        figment = figment.merge(Env::prefixed("BAY_"));

        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the engine loop cannot run with.
    #[expect(
        clippy::result_large_err,
        reason = "reported through the same path as figment extraction errors"
    )]
    fn validate(&self) -> Result<(), figment::Error> {
        if self.tick_interval_ms == 0 {
            return Err(figment::Error::from(
                "tick_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.discovery_interval_secs == 0 {
            return Err(figment::Error::from(
                "discovery_interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub const fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs)
    }

    pub const fn power_reassert(&self) -> Duration {
        Duration::from_secs(self.power_reassert_secs)
    }
}

/// Returns the platform-specific config directory for bay.
fn dirs_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("bay"))
}

/// Returns the platform-specific data directory for bay.
///
/// On Linux: `~/.local/share/bay`
pub fn dirs_data_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("bay"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dirs_data_path_ends_with_bay() {
        let path = dirs_data_path().unwrap();
        assert_eq!(path.file_name().unwrap(), "bay");
    }

    #[test]
    fn test_default_config_uses_data_dir_for_db() {
        let config = Config::default();
        let data_dir = dirs_data_path().unwrap();
        assert_eq!(config.database_path, data_dir.join("bay.db"));
        assert_eq!(config.station_count, 16);
        assert_eq!(config.tick_interval(), Duration::from_millis(2500));
    }

    #[test]
    fn test_config_file_overrides_defaults() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("bay.toml");
        std::fs::write(&path, "station_count = 4\npower_workers = 1\n").unwrap();

        let config = Config::load_from(Some(&path)).unwrap();

        assert_eq!(config.station_count, 4);
        assert_eq!(config.power_workers, 1);
        assert_eq!(config.discovery_interval_secs, 300);
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = Config {
            kasa_username: Some("ops@example.com".to_string()),
            kasa_password: Some("hunter2".to_string()),
            ..Config::default()
        };
        let debug = format!("{config:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_zero_tick_interval_is_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("bay.toml");
        std::fs::write(&path, "tick_interval_ms = 0\n").unwrap();

        let err = Config::load_from(Some(&path)).unwrap_err();

        assert!(err.to_string().contains("tick_interval_ms"), "{err}");
    }

    #[test]
    fn test_zero_discovery_interval_is_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("bay.toml");
        std::fs::write(&path, "discovery_interval_secs = 0\n").unwrap();

        let err = Config::load_from(Some(&path)).unwrap_err();

        assert!(err.to_string().contains("discovery_interval_secs"), "{err}");
    }
}
