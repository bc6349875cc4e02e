//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - An isolated temporary root
//! - A checkpoint image directory
//! - A project config file
//!
//! # Usage
//!
//! ```ignore
//! use nsvfs_config::testing::TestEnvironment;
//!
//! let env = TestEnvironment::new().unwrap();
//! let image = env.image_path("after-unlink");
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

use crate::Config;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with unique paths
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Root of the environment
    pub root: PathBuf,
    /// Directory for checkpoint images
    pub image_dir: PathBuf,
    /// Project config directory (`.nsvfs`)
    pub config_dir: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().to_path_buf();

        let image_dir = root.join("images");
        let config_dir = root.join(".nsvfs");
        std::fs::create_dir_all(&image_dir)?;
        std::fs::create_dir_all(&config_dir)?;

        Ok(Self {
            _temp_dir: temp_dir,
            root,
            image_dir,
            config_dir,
            test_id,
        })
    }

    /// Path for a named checkpoint image inside this environment
    pub fn image_path(&self, name: &str) -> PathBuf {
        self.image_dir.join(format!("{}-{}.img", name, self.test_id))
    }

    /// Path of the project config file
    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    /// Write `config` as the project config file
    pub fn write_config(&self, config: &Config) -> anyhow::Result<PathBuf> {
        let path = self.config_path();
        std::fs::write(&path, config.to_toml()?)?;
        Ok(path)
    }

    /// Config pointing snapshot output at this environment
    pub fn config(&self) -> Config {
        let mut cfg = Config::default();
        cfg.snapshot.image_dir = self.image_dir.clone();
        cfg
    }

    /// Write an arbitrary file relative to the environment root
    pub fn create_file(&self, relative_path: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.root.join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_creates_directories() {
        let env = TestEnvironment::new().unwrap();
        assert!(env.image_dir.exists());
        assert!(env.config_dir.exists());
    }

    #[test]
    fn test_environment_has_unique_images() {
        let env1 = TestEnvironment::new().unwrap();
        let env2 = TestEnvironment::new().unwrap();
        assert_ne!(env1.image_path("x"), env2.image_path("x"));
    }

    #[test]
    fn test_write_config_roundtrip() {
        let env = TestEnvironment::new().unwrap();
        let mut cfg = env.config();
        cfg.limits.name_max = 32;
        let path = env.write_config(&cfg).unwrap();

        let loaded = Config::load_file(&path).unwrap();
        assert_eq!(loaded.limits.name_max, 32);
        assert_eq!(loaded.snapshot.image_dir, env.image_dir);
    }
}
