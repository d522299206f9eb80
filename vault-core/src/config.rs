use crate::error::{Result, VaultError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Storage budget granted to newly created principals, in bytes.
    pub default_quota_bytes: i64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            default_quota_bytes: 100 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Tokens added per second.
    pub rate: f64,
    /// Maximum bucket size.
    pub burst: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rate: 2.0,
            burst: 2.0,
        }
    }
}

impl Config {
    /// Load configuration from an optional file, overridable through
    /// VAULT_* environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = ::config::Config::builder()
            .set_default("storage.data_dir", "./vault-data")
            .map_err(|e| VaultError::Config(e.to_string()))?;

        if let Some(path) = path {
            builder = builder.add_source(::config::File::with_name(path));
        }

        let settings = builder
            .add_source(::config::Environment::with_prefix("VAULT").separator("__"))
            .build()
            .map_err(|e| VaultError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| VaultError::Config(e.to_string()))?;

        if config.rate_limit.rate <= 0.0 || config.rate_limit.burst < 1.0 {
            return Err(VaultError::Config(format!(
                "invalid rate limit: rate={} burst={}",
                config.rate_limit.rate, config.rate_limit.burst
            )));
        }

        Ok(config)
    }

    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            storage: StorageConfig { data_dir },
            quota: QuotaConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::with_data_dir(PathBuf::from("/tmp/vault"));
        assert_eq!(config.rate_limit.rate, 2.0);
        assert_eq!(config.rate_limit.burst, 2.0);
        assert_eq!(config.quota.default_quota_bytes, 100 * 1024 * 1024);
    }

    #[test]
    fn test_load_without_file() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.storage.data_dir, PathBuf::from("./vault-data"));
    }
}
