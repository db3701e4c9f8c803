use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, XlinkError};

/// cityxlink configuration from config.toml
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct XlinkConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_store_path() -> String {
    "citydb.sqlite".to_string()
}

fn default_max_connections() -> u32 {
    20
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ResolverConfig {
    /// Number of resolver worker tasks
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Bounded queue capacity in front of the workers (submit blocks when full)
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Buffered mutations per resolver before an early flush
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Coordinate reference system written with re-encoded geometry and world files
    #[serde(default)]
    pub srid: i32,
    /// Directory that relative texture and world-file URIs are resolved against
    #[serde(default)]
    pub import_dir: Option<PathBuf>,
    /// Byte budget of the hot identifier cache in front of `gmlid_cache`
    #[serde(default = "default_cache_capacity_bytes")]
    pub cache_capacity_bytes: usize,
    /// Longest indirection chain followed before giving up
    #[serde(default = "default_max_indirection_depth")]
    pub max_indirection_depth: usize,
}

fn default_workers() -> usize {
    num_cpus::get().clamp(2, 8)
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_batch_size() -> usize {
    256
}

fn default_cache_capacity_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_max_indirection_depth() -> usize {
    32
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            batch_size: default_batch_size(),
            srid: 0,
            import_dir: None,
            cache_capacity_bytes: default_cache_capacity_bytes(),
            max_indirection_depth: default_max_indirection_depth(),
        }
    }
}

impl ResolverConfig {
    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 || self.workers > 64 {
            return Err(XlinkError::Config(format!(
                "resolver.workers must be within 1..=64, got {}",
                self.workers
            )));
        }
        if self.queue_capacity == 0 {
            return Err(XlinkError::Config(
                "resolver.queue_capacity must be positive".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(XlinkError::Config(
                "resolver.batch_size must be positive".to_string(),
            ));
        }
        if self.max_indirection_depth == 0 {
            return Err(XlinkError::Config(
                "resolver.max_indirection_depth must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Base directory for relative file references.
    pub fn import_dir(&self) -> PathBuf {
        self.import_dir.clone().unwrap_or_else(|| PathBuf::from("."))
    }
}

/// Default location: `<config dir>/cityxlink/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("cityxlink").join("config.toml"))
}

/// Load configuration.
///
/// An explicitly given path must exist and parse. Without one, the default
/// location is tried and any problem there falls back to defaults.
pub fn load_config(path: Option<&Path>) -> Result<XlinkConfig> {
    if let Some(path) = path {
        let content = std::fs::read_to_string(path).map_err(|e| {
            XlinkError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: XlinkConfig = toml::from_str(&content).map_err(|e| {
            XlinkError::Config(format!("cannot parse {}: {}", path.display(), e))
        })?;
        config.resolver.validate()?;
        return Ok(config);
    }

    let Some(config_path) = default_config_path() else {
        return Ok(XlinkConfig::default());
    };
    if !config_path.exists() {
        return Ok(XlinkConfig::default());
    }

    match std::fs::read_to_string(&config_path) {
        Ok(content) => Ok(toml::from_str(&content).unwrap_or_else(|e| {
            tracing::warn!("Failed to parse {}: {}", config_path.display(), e);
            XlinkConfig::default()
        })),
        Err(e) => {
            tracing::warn!("Failed to read {}: {}", config_path.display(), e);
            Ok(XlinkConfig::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_from_empty_file() {
        let config: XlinkConfig = toml::from_str("").unwrap();
        assert_eq!(config.store.path, "citydb.sqlite");
        assert_eq!(config.resolver.batch_size, 256);
        assert!(config.resolver.workers >= 2);
        assert!(config.resolver.validate().is_ok());
    }

    #[test]
    fn test_explicit_config_is_parsed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[store]
path = "x.db"

[resolver]
workers = 3
srid = 25832
import_dir = "/data/import"
"#,
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.store.path, "x.db");
        assert_eq!(config.resolver.workers, 3);
        assert_eq!(config.resolver.srid, 25832);
        assert_eq!(config.resolver.import_dir(), PathBuf::from("/data/import"));
    }

    #[test]
    fn test_explicit_config_errors_are_fatal() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.toml");
        assert!(matches!(
            load_config(Some(&missing)),
            Err(XlinkError::Config(_))
        ));

        let invalid = dir.path().join("invalid.toml");
        std::fs::write(&invalid, "[resolver]\nworkers = 0\n").unwrap();
        assert!(matches!(
            load_config(Some(&invalid)),
            Err(XlinkError::Config(_))
        ));
    }
}
