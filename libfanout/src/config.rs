//! Configuration management for Fanout

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::dispatch::DispatchConfig;
use crate::error::{ConfigError, Result};
use crate::rate_limit::{ClassLimit, RateLimits, MEDIA_CLASS, PUBLISH_CLASS};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub rate_limits: RateLimitsConfig,
    pub mastodon: Option<MastodonConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

/// Where the vault's process-wide secret comes from. An inline secret is
/// supported for tests; deployments should leave it unset and export
/// `FANOUT_VAULT_SECRET`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VaultConfig {
    pub secret: Option<String>,
}

impl VaultConfig {
    pub fn resolve_secret(&self) -> Result<String> {
        if let Some(secret) = &self.secret {
            return Ok(secret.clone());
        }
        std::env::var("FANOUT_VAULT_SECRET").map_err(|_| {
            ConfigError::MissingField(
                "vault.secret (or FANOUT_VAULT_SECRET in the environment)".to_string(),
            )
            .into()
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i64,
    #[serde(default = "default_backoff_base")]
    pub backoff_base: String,
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap: String,
    #[serde(default = "default_stale_after")]
    pub stale_after: String,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_poll_interval() -> String {
    "30s".to_string()
}
fn default_batch_size() -> usize {
    10
}
fn default_max_attempts() -> i64 {
    5
}
fn default_backoff_base() -> String {
    "1m".to_string()
}
fn default_backoff_cap() -> String {
    "30m".to_string()
}
fn default_stale_after() -> String {
    "10m".to_string()
}
fn default_concurrency() -> usize {
    4
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            backoff_base: default_backoff_base(),
            backoff_cap: default_backoff_cap(),
            stale_after: default_stale_after(),
            concurrency: default_concurrency(),
        }
    }
}

impl DispatcherConfig {
    pub fn to_dispatch_config(&self) -> Result<DispatchConfig> {
        Ok(DispatchConfig {
            poll_interval: parse_duration("dispatcher.poll_interval", &self.poll_interval)?,
            batch_size: self.batch_size,
            max_attempts: self.max_attempts,
            backoff_base: parse_duration("dispatcher.backoff_base", &self.backoff_base)?,
            backoff_cap: parse_duration("dispatcher.backoff_cap", &self.backoff_cap)?,
            stale_after: parse_duration("dispatcher.stale_after", &self.stale_after)?,
            concurrency: self.concurrency,
        })
    }
}

fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value).map_err(|e| {
        ConfigError::InvalidValue {
            field: field.to_string(),
            message: e.to_string(),
        }
        .into()
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitsConfig {
    #[serde(default = "default_publish_per_minute")]
    pub publish_per_minute: u32,
    #[serde(default = "default_media_per_minute")]
    pub media_per_minute: u32,
}

fn default_publish_per_minute() -> u32 {
    5
}
fn default_media_per_minute() -> u32 {
    10
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            publish_per_minute: default_publish_per_minute(),
            media_per_minute: default_media_per_minute(),
        }
    }
}

impl RateLimitsConfig {
    pub fn to_rate_limits(&self) -> RateLimits {
        let mut limits = HashMap::new();
        limits.insert(
            PUBLISH_CLASS.to_string(),
            ClassLimit {
                max_hits: self.publish_per_minute,
                window_secs: 60,
            },
        );
        limits.insert(
            MEDIA_CLASS.to_string(),
            ClassLimit {
                max_hits: self.media_per_minute,
                window_secs: 60,
            },
        );
        RateLimits::new(limits)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MastodonConfig {
    /// Instance base URL, e.g. "https://mastodon.social".
    pub base_url: String,
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path.
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config = toml::from_str(&content).map_err(ConfigError::ParseError)?;
        Ok(config)
    }

    /// A usable default configuration.
    pub fn default_config() -> Self {
        Self {
            database: DatabaseConfig {
                path: "~/.local/share/fanout/fanout.db".to_string(),
            },
            vault: VaultConfig::default(),
            dispatcher: DispatcherConfig::default(),
            rate_limits: RateLimitsConfig::default(),
            mastodon: None,
        }
    }
}

/// Resolve the configuration file path following the XDG Base Directory spec.
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("FANOUT_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("fanout").join("config.toml"))
}

/// Resolve the data directory path following the XDG Base Directory spec.
pub fn resolve_data_path() -> Result<PathBuf> {
    let data_dir =
        dirs::data_dir().ok_or_else(|| ConfigError::MissingField("data directory".to_string()))?;

    Ok(data_dir.join("fanout"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [database]
            path = "/tmp/fanout.db"
            "#,
        )
        .unwrap();

        assert_eq!(config.database.path, "/tmp/fanout.db");
        assert_eq!(config.dispatcher.poll_interval, "30s");
        assert_eq!(config.dispatcher.max_attempts, 5);
        assert_eq!(config.rate_limits.publish_per_minute, 5);
        assert_eq!(config.rate_limits.media_per_minute, 10);
        assert!(config.mastodon.is_none());
    }

    #[test]
    fn test_full_config_parses() {
        let config: Config = toml::from_str(
            r#"
            [database]
            path = "~/.local/share/fanout/fanout.db"

            [vault]
            secret = "test-only-secret"

            [dispatcher]
            poll_interval = "15s"
            batch_size = 25
            max_attempts = 3
            backoff_base = "30s"
            backoff_cap = "10m"
            stale_after = "5m"
            concurrency = 8

            [rate_limits]
            publish_per_minute = 2
            media_per_minute = 4

            [mastodon]
            base_url = "https://mastodon.social"
            "#,
        )
        .unwrap();

        let dispatch = config.dispatcher.to_dispatch_config().unwrap();
        assert_eq!(dispatch.poll_interval, Duration::from_secs(15));
        assert_eq!(dispatch.batch_size, 25);
        assert_eq!(dispatch.max_attempts, 3);
        assert_eq!(dispatch.backoff_base, Duration::from_secs(30));
        assert_eq!(dispatch.backoff_cap, Duration::from_secs(600));
        assert_eq!(dispatch.stale_after, Duration::from_secs(300));
        assert_eq!(dispatch.concurrency, 8);

        assert_eq!(config.vault.resolve_secret().unwrap(), "test-only-secret");
        assert_eq!(
            config.mastodon.unwrap().base_url,
            "https://mastodon.social"
        );
    }

    #[test]
    fn test_invalid_duration_rejected() {
        let config: Config = toml::from_str(
            r#"
            [database]
            path = "/tmp/fanout.db"

            [dispatcher]
            poll_interval = "sometimes"
            "#,
        )
        .unwrap();

        let err = config.dispatcher.to_dispatch_config().unwrap_err();
        assert!(matches!(
            err,
            crate::FanoutError::Config(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_rate_limits_conversion() {
        let limits = RateLimitsConfig::default().to_rate_limits();
        let publish = limits.get(PUBLISH_CLASS).unwrap();
        assert_eq!(publish.max_hits, 5);
        assert_eq!(publish.window_secs, 60);
        let media = limits.get(MEDIA_CLASS).unwrap();
        assert_eq!(media.max_hits, 10);
    }

    #[test]
    fn test_default_config_is_loadable() {
        let config = Config::default_config();
        let serialized = toml::to_string(&config).unwrap();
        let back: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(back.database.path, config.database.path);
    }

    #[test]
    #[serial_test::serial]
    fn test_vault_secret_from_environment() {
        std::env::set_var("FANOUT_VAULT_SECRET", "env-secret");
        assert_eq!(
            VaultConfig::default().resolve_secret().unwrap(),
            "env-secret"
        );

        std::env::remove_var("FANOUT_VAULT_SECRET");
        assert!(VaultConfig::default().resolve_secret().is_err());
    }

    #[test]
    #[serial_test::serial]
    fn test_inline_secret_wins_over_environment() {
        std::env::set_var("FANOUT_VAULT_SECRET", "env-secret");
        let config = VaultConfig {
            secret: Some("inline-secret".to_string()),
        };
        assert_eq!(config.resolve_secret().unwrap(), "inline-secret");
        std::env::remove_var("FANOUT_VAULT_SECRET");
    }

    #[test]
    #[serial_test::serial]
    fn test_config_path_environment_override() {
        std::env::set_var("FANOUT_CONFIG", "/tmp/custom/fanout.toml");
        let path = resolve_config_path().unwrap();
        assert_eq!(path, PathBuf::from("/tmp/custom/fanout.toml"));
        std::env::remove_var("FANOUT_CONFIG");
    }

    #[test]
    fn test_load_from_missing_path_is_config_error() {
        let err = Config::load_from_path(&PathBuf::from("/nonexistent/fanout.toml")).unwrap_err();
        assert!(matches!(
            err,
            crate::FanoutError::Config(ConfigError::ReadError(_))
        ));
        assert_eq!(err.exit_code(), 2);
    }
}
