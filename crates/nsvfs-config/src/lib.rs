//! # nsvfs-config
//!
//! Configuration management for nsvfs.
//!
//! Loads configuration from:
//! 1. `~/.nsvfs/config.toml` (global)
//! 2. `.nsvfs/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)

pub mod logging;
pub mod testing;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tracing::debug;

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::load().unwrap_or_default()));

/// Get global config (read-only)
pub fn config() -> std::sync::RwLockReadGuard<'static, Config> {
    CONFIG.read().unwrap_or_else(PoisonError::into_inner)
}

/// Reload config from disk
pub fn reload() -> Result<(), ConfigError> {
    let new_config = Config::load()?;
    *CONFIG.write().unwrap_or_else(PoisonError::into_inner) = new_config;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

/// Linux `PATH_MAX`, counting the terminating NUL.
pub const DEFAULT_PATH_MAX: usize = 4096;
/// Linux `NAME_MAX`.
pub const DEFAULT_NAME_MAX: usize = 255;
/// Largest content length a regular file may reach (1 GiB).
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1 << 30;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub limits: LimitsConfig,
    pub permissions: PermissionConfig,
    pub snapshot: SnapshotConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        // 1. Global config (~/.nsvfs/config.toml)
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                config = Self::load_file(&global_path)?;
            }
        }

        // 2. Project config (.nsvfs/config.toml) overrides global
        let project_path = Path::new(".nsvfs/config.toml");
        if project_path.exists() {
            debug!("Loading project config from {:?}", project_path);
            let project_config = Self::load_file(project_path)?;
            config.merge(project_config);
        }

        // 3. Environment variable overrides
        config.apply_env_overrides();

        Ok(config)
    }

    /// Parse a single config file without merging or env overrides
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Global config path: ~/.nsvfs/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".nsvfs/config.toml"))
    }

    /// Merge a project config over this one. Only values that differ from
    /// the defaults replace ours.
    pub fn merge(&mut self, other: Config) {
        let defaults = Config::default();
        if other.limits.path_max != defaults.limits.path_max {
            self.limits.path_max = other.limits.path_max;
        }
        if other.limits.name_max != defaults.limits.name_max {
            self.limits.name_max = other.limits.name_max;
        }
        if other.limits.max_file_size != defaults.limits.max_file_size {
            self.limits.max_file_size = other.limits.max_file_size;
        }
        if other.permissions.umask != defaults.permissions.umask {
            self.permissions.umask = other.permissions.umask;
        }
        if other.snapshot.save_orphans != defaults.snapshot.save_orphans {
            self.snapshot.save_orphans = other.snapshot.save_orphans;
        }
        if other.snapshot.image_dir != defaults.snapshot.image_dir {
            self.snapshot.image_dir = other.snapshot.image_dir;
        }
        if other.logging.level != defaults.logging.level {
            self.logging.level = other.logging.level;
        }
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable source
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(n) = lookup("NSVFS_PATH_MAX").and_then(|v| v.parse().ok()) {
            self.limits.path_max = n;
        }
        if let Some(n) = lookup("NSVFS_NAME_MAX").and_then(|v| v.parse().ok()) {
            self.limits.name_max = n;
        }
        if let Some(n) = lookup("NSVFS_MAX_FILE_SIZE").and_then(|v| v.parse().ok()) {
            self.limits.max_file_size = n;
        }
        if let Some(level) = lookup("NSVFS_LOG") {
            self.logging.level = level;
        }
    }

    /// Generate default config TOML string
    pub fn default_toml() -> Result<String, ConfigError> {
        Config::default().to_toml()
    }

    /// Render this config as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Path and name length limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum path length in bytes, terminator included
    pub path_max: usize,
    /// Maximum length of a single path component
    pub name_max: usize,
    /// Maximum regular file length; writes and truncates past it fail
    pub max_file_size: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            path_max: DEFAULT_PATH_MAX,
            name_max: DEFAULT_NAME_MAX,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

/// Permission defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionConfig {
    /// Mask applied to the mode of newly created objects
    pub umask: u32,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self { umask: 0o022 }
    }
}

/// Checkpoint image configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Allow capturing images while unlinked-but-open objects exist.
    /// Backends that cannot reopen deleted files turn this off.
    pub save_orphans: bool,
    /// Default directory for saved images
    pub image_dir: PathBuf,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            save_orphans: true,
            image_dir: PathBuf::from("~/.nsvfs/images"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
