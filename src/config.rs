use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{
    LocationCacheConfig, DEFAULT_DESCRIPTOR_CAPACITY, DEFAULT_REPOSITORY_CAPACITY, DEFAULT_TTL,
};
use crate::catalog::resolve_catalog_path;
use crate::{Error, Result};

pub const ENV_MIRROR_PULLTHROUGH: &str = "RELAY_REGISTRY_MIRROR_PULLTHROUGH";
pub const ENV_BLOB_REPOSITORY_CACHE_TTL: &str = "RELAY_REGISTRY_BLOB_REPOSITORY_CACHE_TTL";
pub const ENV_ADDR: &str = "RELAY_REGISTRY_ADDR";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub pullthrough: PullthroughConfig,
    #[serde(default)]
    pub requests: RequestsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_addr")]
    pub addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "default_catalog_path")]
    pub path: PathBuf,
    /// Registry hosts that name this server. Never pulled through from.
    #[serde(default)]
    pub local_registries: Vec<String>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            path: default_catalog_path(),
            local_registries: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Bypass the location cache entirely.
    #[serde(default)]
    pub disabled: bool,
    #[serde(default = "default_ttl", with = "humantime_serde")]
    pub blob_repository_ttl: Duration,
    #[serde(default = "default_descriptor_capacity")]
    pub descriptor_capacity: usize,
    #[serde(default = "default_repository_capacity")]
    pub repository_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            blob_repository_ttl: default_ttl(),
            descriptor_capacity: default_descriptor_capacity(),
            repository_capacity: default_repository_capacity(),
        }
    }
}

impl CacheConfig {
    /// Settings for a live location cache, or `None` when disabled.
    pub fn location_cache(&self) -> Option<LocationCacheConfig> {
        if self.disabled {
            return None;
        }
        Some(LocationCacheConfig {
            descriptor_capacity: self.descriptor_capacity,
            repository_capacity: self.repository_capacity,
            ttl: self.blob_repository_ttl,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullthroughConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub mirror: bool,
}

impl Default for PullthroughConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mirror: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestsConfig {
    #[serde(default)]
    pub write: LimiterConfig,
}

/// Admission limits. `max_running == 0` disables the limiter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimiterConfig {
    #[serde(default)]
    pub max_running: usize,
    #[serde(default)]
    pub max_in_queue: usize,
    #[serde(default, with = "humantime_serde")]
    pub max_wait_in_queue: Duration,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
}

fn default_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 5000))
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("/var/lib/relay-registry")
}

fn default_catalog_path() -> PathBuf {
    PathBuf::from("catalog.yaml")
}

fn default_ttl() -> Duration {
    DEFAULT_TTL
}

fn default_descriptor_capacity() -> usize {
    DEFAULT_DESCRIPTOR_CAPACITY
}

fn default_repository_capacity() -> usize {
    DEFAULT_REPOSITORY_CAPACITY
}

fn default_true() -> bool {
    true
}

mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

/// Read, parse, override from the environment, and validate a config file.
/// A relative catalog path is resolved against the config file's directory.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;

    let is_yaml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
        .unwrap_or(false);

    let mut config: Config = if is_yaml {
        serde_yaml::from_str(&raw)
            .map_err(|e| Error::Config(format!("invalid YAML config {}: {}", path.display(), e)))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("invalid JSON config {}: {}", path.display(), e)))?
    };

    if let Some(dir) = path.parent() {
        config.catalog.path = resolve_catalog_path(dir, &config.catalog.path);
    }
    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    validate_config(&config)?;
    Ok(config)
}

/// Apply `RELAY_REGISTRY_*` overrides looked up through `lookup`.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = lookup(ENV_MIRROR_PULLTHROUGH) {
        config.pullthrough.mirror = parse_bool(ENV_MIRROR_PULLTHROUGH, &v)?;
    }
    if let Some(v) = lookup(ENV_BLOB_REPOSITORY_CACHE_TTL) {
        config.cache.blob_repository_ttl = humantime::parse_duration(v.trim()).map_err(|e| {
            Error::Config(format!("{}: invalid duration {:?}: {}", ENV_BLOB_REPOSITORY_CACHE_TTL, v, e))
        })?;
    }
    if let Some(v) = lookup(ENV_ADDR) {
        config.server.addr = v
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{}: invalid address {:?}: {}", ENV_ADDR, v, e)))?;
    }
    Ok(())
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::Config(format!("{}: invalid boolean {:?}", key, other))),
    }
}

pub fn validate_config(config: &Config) -> Result<()> {
    if config.pullthrough.mirror && !config.pullthrough.enabled {
        return Err(Error::Config(
            "pullthrough.mirror requires pullthrough.enabled".into(),
        ));
    }

    if !config.cache.disabled {
        if config.cache.blob_repository_ttl.is_zero() {
            return Err(Error::Config(
                "cache.blob_repository_ttl must be greater than zero; set cache.disabled to turn the cache off".into(),
            ));
        }
        if config.cache.descriptor_capacity == 0 || config.cache.repository_capacity == 0 {
            return Err(Error::Config(
                "cache capacities must be greater than zero".into(),
            ));
        }
    }

    let write = &config.requests.write;
    if write.max_running == 0 && (write.max_in_queue > 0 || !write.max_wait_in_queue.is_zero()) {
        return Err(Error::Config(
            "requests.write queue settings require max_running > 0".into(),
        ));
    }

    Ok(())
}
