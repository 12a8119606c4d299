//! # blockmesh-config
//!
//! Configuration management for blockmesh.
//!
//! Loads configuration from:
//! 1. `~/.blockmesh/config.toml` (global)
//! 2. `.blockmesh/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)

pub mod logging;
pub mod testing;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::debug;

pub use logging::{init_logging, LogLevel};

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::load().unwrap_or_default()));

/// Get a copy of the global config.
pub fn config() -> Config {
    match CONFIG.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

/// Reload config from disk
pub fn reload() -> Result<(), ConfigError> {
    let new_config = Config::load()?;
    new_config.validate()?;
    match CONFIG.write() {
        Ok(mut guard) => *guard = new_config,
        Err(poisoned) => *poisoned.into_inner() = new_config,
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Whether a block that already exists on disk may be replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverwritePolicy {
    #[default]
    Allow,
    Refuse,
}

impl std::str::FromStr for OverwritePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "allow" => Ok(Self::Allow),
            "refuse" => Ok(Self::Refuse),
            other => Err(ConfigError::Invalid {
                field: "storage.overwrite",
                reason: format!("expected \"allow\" or \"refuse\", got {:?}", other),
            }),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub ring: RingConfig,
    pub coded: CodedConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        // 1. Load global config (~/.blockmesh/config.toml)
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                config = Self::from_file(&global_path)?;
            }
        }

        // 2. Load project config (.blockmesh/config.toml) - overrides global
        let project_path = Path::new(".blockmesh/config.toml");
        if project_path.exists() {
            debug!("Loading project config from {:?}", project_path);
            config.merge(Self::from_file(project_path)?);
        }

        // 3. Apply environment variable overrides
        config.apply_env_overrides()?;

        Ok(config)
    }

    /// Parse a single TOML file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Global config path: ~/.blockmesh/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".blockmesh/config.toml"))
    }

    /// Merge a project config over this one. Fields the project file left at
    /// their default value keep the current value.
    pub fn merge(&mut self, other: Config) {
        let defaults = Config::default();

        if other.storage.root != defaults.storage.root {
            self.storage.root = other.storage.root;
        }
        if other.storage.capacity != defaults.storage.capacity {
            self.storage.capacity = other.storage.capacity;
        }
        if other.storage.overwrite != defaults.storage.overwrite {
            self.storage.overwrite = other.storage.overwrite;
        }
        if other.storage.scan_interval_ms != defaults.storage.scan_interval_ms {
            self.storage.scan_interval_ms = other.storage.scan_interval_ms;
        }
        if other.storage.scan_batch != defaults.storage.scan_batch {
            self.storage.scan_batch = other.storage.scan_batch;
        }
        if other.ring.relocation_concurrency != defaults.ring.relocation_concurrency {
            self.ring.relocation_concurrency = other.ring.relocation_concurrency;
        }
        if other.coded.num_replicas != defaults.coded.num_replicas {
            self.coded.num_replicas = other.coded.num_replicas;
        }
        if other.coded.delete_concurrency != defaults.coded.delete_concurrency {
            self.coded.delete_concurrency = other.coded.delete_concurrency;
        }
        if other.logging.level != defaults.logging.level {
            self.logging.level = other.logging.level;
        }
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable source.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup("BLOCKMESH_ROOT") {
            self.storage.root = PathBuf::from(root);
        }
        if let Some(capacity) = lookup("BLOCKMESH_CAPACITY") {
            self.storage.capacity = capacity.parse().map_err(|_| ConfigError::Invalid {
                field: "BLOCKMESH_CAPACITY",
                reason: format!("not a byte count: {:?}", capacity),
            })?;
        }
        if let Some(replicas) = lookup("BLOCKMESH_REPLICAS") {
            self.coded.num_replicas = replicas.parse().map_err(|_| ConfigError::Invalid {
                field: "BLOCKMESH_REPLICAS",
                reason: format!("not a replica count: {:?}", replicas),
            })?;
        }
        if let Some(overwrite) = lookup("BLOCKMESH_OVERWRITE") {
            self.storage.overwrite = overwrite.parse()?;
        }
        Ok(())
    }

    /// Reject values the storage layers cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(&'static str, bool); 5] = [
            ("storage.capacity", self.storage.capacity == 0),
            ("storage.scan_batch", self.storage.scan_batch == 0),
            ("ring.relocation_concurrency", self.ring.relocation_concurrency == 0),
            ("coded.num_replicas", self.coded.num_replicas == 0),
            ("coded.delete_concurrency", self.coded.delete_concurrency == 0),
        ];
        for (field, is_zero) in checks {
            if is_zero {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap_or_default()
    }
}

/// BlockStore configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the blocks of one store
    pub root: PathBuf,
    /// Capacity in bytes, shared by every uid on the store
    pub capacity: u64,
    /// Policy for keys that already exist
    pub overwrite: OverwritePolicy,
    /// Pause between paced scan batches and between scanner passes
    pub scan_interval_ms: u64,
    /// Keys yielded per scan batch before pausing
    pub scan_batch: usize,
}

impl StorageConfig {
    /// Root with a leading `~` expanded to the home directory.
    pub fn resolved_root(&self) -> PathBuf {
        expand_home(&self.root)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("~/.blockmesh/blocks"),
            capacity: 128 << 20,
            overwrite: OverwritePolicy::Allow,
            scan_interval_ms: 100,
            scan_batch: 64,
        }
    }
}

/// Consistent-hash ring configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    /// In-flight block migrations while a member joins
    pub relocation_concurrency: usize,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            relocation_concurrency: 8,
        }
    }
}

/// Chunking and replication configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodedConfig {
    /// Physical copies per logical block
    pub num_replicas: usize,
    /// In-flight removals when deleting a blob
    pub delete_concurrency: usize,
}

impl Default for CodedConfig {
    fn default() -> Self {
        Self {
            num_replicas: 2,
            delete_concurrency: 16,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: LogLevel,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
        }
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}
