//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - Isolated store directories
//! - A matching `Config` pointing at them
//!
//! # Usage
//!
//! ```ignore
//! use blockmesh_config::testing::TestEnvironment;
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let env = TestEnvironment::new().unwrap();
//!     let a = env.store_root("a");
//!     let b = env.store_root("b");
//!     // a and b are distinct, empty, and removed when env drops
//! }
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

use crate::Config;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with unique store roots
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Parent of every store root handed out
    pub root: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().join(format!("blockmesh-test-{}", test_id));
        std::fs::create_dir_all(&root)?;

        Ok(Self {
            _temp_dir: temp_dir,
            root,
            test_id,
        })
    }

    /// Path for a named store. The directory itself is created by
    /// `BlockStore::open`, so it does not exist yet on first call.
    pub fn store_root(&self, name: &str) -> PathBuf {
        self.root.join("stores").join(name)
    }

    /// Config for the named store with the given capacity and no scan pacing.
    pub fn config_for(&self, name: &str, capacity: u64) -> Config {
        let mut cfg = Config::default();
        cfg.storage.root = self.store_root(name);
        cfg.storage.capacity = capacity;
        cfg.storage.scan_interval_ms = 0;
        cfg
    }

    /// Drop a file with raw content directly into a store directory,
    /// bypassing the store API (used to seed pre-existing data).
    pub fn seed_file(&self, store: &str, name: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        let dir = self.store_root(store);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(name);
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Write a config file under the environment and return its path.
    pub fn write_config(&self, relative_path: impl AsRef<Path>, toml: &str) -> anyhow::Result<PathBuf> {
        let path = self.root.join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, toml)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_creates_root() {
        let env = TestEnvironment::new().unwrap();
        assert!(env.root.exists());
    }

    #[test]
    fn test_environments_are_isolated() {
        let env1 = TestEnvironment::new().unwrap();
        let env2 = TestEnvironment::new().unwrap();
        assert_ne!(env1.store_root("a"), env2.store_root("a"));
        assert_ne!(env1.test_id, env2.test_id);
    }

    #[test]
    fn test_seed_file() {
        let env = TestEnvironment::new().unwrap();
        let path = env.seed_file("a", "usera$0123", b"hello").unwrap();
        assert!(path.starts_with(env.store_root("a")));
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    }

    #[test]
    fn test_config_for() {
        let env = TestEnvironment::new().unwrap();
        let cfg = env.config_for("b", 100);
        assert_eq!(cfg.storage.root, env.store_root("b"));
        assert_eq!(cfg.storage.capacity, 100);
        assert_eq!(cfg.storage.scan_interval_ms, 0);
    }
}
