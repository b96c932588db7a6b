//! YAML configuration with environment overrides.
//!
//! ```yaml
//! registry:
//!   host: registry.internal:5000
//!   username: reader
//!   password_env: REGISTRY_TOKEN
//!   retries: 3
//!   retry_delay: 500ms
//! cache:
//!   dir: /var/cache/layerlens
//!   ttl: 5m
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use layerlens_oci::registry::{RegistryOptions, DOCKER_HUB};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};

use crate::error::{Error, Result};

pub const ENV_REGISTRY: &str = "LAYERLENS_REGISTRY";
pub const ENV_USERNAME: &str = "LAYERLENS_USERNAME";
pub const ENV_PASSWORD: &str = "LAYERLENS_PASSWORD";
pub const ENV_CACHE_DIR: &str = "LAYERLENS_CACHE_DIR";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub registry: RegistryConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub host: String,
    pub username: Option<String>,
    #[serde(deserialize_with = "secret_opt")]
    pub password: Option<SecretString>,
    /// Name of an environment variable holding the password.
    pub password_env: Option<String>,
    pub retries: u32,
    #[serde(deserialize_with = "duration_str")]
    pub retry_delay: Duration,
    #[serde(deserialize_with = "duration_str")]
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        let transport = RegistryOptions::default();
        Self {
            host: DOCKER_HUB.to_string(),
            username: None,
            password: None,
            password_env: None,
            retries: transport.retries,
            retry_delay: transport.retry_delay,
            timeout: transport.timeout,
            user_agent: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub dir: PathBuf,
    /// How long resolved manifests, tags and listings stay cached in memory.
    #[serde(deserialize_with = "duration_str")]
    pub ttl: Duration,
    /// How long one caller may hold an indexing lock before it is stale.
    #[serde(deserialize_with = "duration_str")]
    pub lock_hold: Duration,
    /// How long to wait for another caller's lock.
    #[serde(deserialize_with = "duration_str")]
    pub lock_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            ttl: Duration::from_secs(5 * 60),
            lock_hold: Duration::from_secs(2 * 60),
            lock_timeout: Duration::from_secs(60),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(ENV_CACHE_DIR) {
        return PathBuf::from(dir);
    }

    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".cache/layerlens");
    }

    PathBuf::from("/tmp/layerlens-cache")
}

fn duration_str<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
    let raw = String::deserialize(d)?;
    humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
}

fn secret_opt<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<Option<SecretString>, D::Error> {
    Ok(Option::<String>::deserialize(d)?.map(SecretString::from))
}

impl Config {
    /// Read a YAML config file, then apply `LAYERLENS_*` overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        let mut config = Self::from_yaml(&raw)
            .map_err(|e| Error::Config(format!("invalid config {}: {}", path.display(), e)))?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus `LAYERLENS_*` overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup(ENV_REGISTRY).filter(|v| !v.is_empty()) {
            self.registry.host = host;
        }
        if let Some(user) = lookup(ENV_USERNAME).filter(|v| !v.is_empty()) {
            self.registry.username = Some(user);
        }
        if let Some(password) = lookup(ENV_PASSWORD).filter(|v| !v.is_empty()) {
            self.registry.password = Some(SecretString::from(password));
        }
        if let Some(dir) = lookup(ENV_CACHE_DIR).filter(|v| !v.is_empty()) {
            self.cache.dir = PathBuf::from(dir);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.registry.host.trim().is_empty() {
            return Err(Error::Config("registry.host must not be empty".to_string()));
        }
        if self.registry.host.contains('/') {
            return Err(Error::Config(format!(
                "registry.host must be a host[:port], got {:?}",
                self.registry.host
            )));
        }
        if self.registry.timeout.is_zero() {
            return Err(Error::Config("registry.timeout must be positive".to_string()));
        }
        if self.cache.lock_hold.is_zero() || self.cache.lock_timeout.is_zero() {
            return Err(Error::Config(
                "cache.lock_hold and cache.lock_timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Point the config at another registry host. Credentials belong to the
    /// host they were configured for and are dropped when the host changes.
    pub fn switch_registry(&mut self, host: &str) {
        if self.registry.host == host {
            return;
        }
        if self.registry.username.is_some()
            || self.registry.password.is_some()
            || self.registry.password_env.is_some()
        {
            tracing::debug!(
                from = %self.registry.host,
                to = host,
                "dropping credentials on registry switch"
            );
        }
        self.registry.host = host.to_string();
        self.registry.username = None;
        self.registry.password = None;
        self.registry.password_env = None;
    }

    /// The registry password: the configured one, else the variable named by
    /// `password_env`.
    pub fn password(&self) -> Option<SecretString> {
        if let Some(password) = &self.registry.password {
            return Some(SecretString::from(password.expose_secret().to_string()));
        }
        let var = self.registry.password_env.as_deref()?;
        std::env::var(var)
            .ok()
            .filter(|v| !v.is_empty())
            .map(SecretString::from)
    }

    pub fn registry_options(&self) -> RegistryOptions {
        let mut options = RegistryOptions {
            retries: self.registry.retries,
            retry_delay: self.registry.retry_delay,
            timeout: self.registry.timeout,
            ..RegistryOptions::default()
        };
        if let Some(agent) = &self.registry.user_agent {
            options.user_agent = agent.clone();
        }
        options
    }
}
