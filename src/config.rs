// ABOUTME: Configuration parsing from TOML file with environment variable overrides
// ABOUTME: Validates required fields and provides sensible defaults for optional ones

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    /// Base directory for persisted credentials. Defaults to the platform
    /// data directory when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub basedir: Option<String>,
}

/// One automatable account on the chat platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Stable external reference (phone number or bot token hash)
    pub identity: String,
    /// Out-of-band secret for a fresh login
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Config-provided reusable session material; takes precedence over the
    /// credential store
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Dispatcher workers per session. Keep at 1 when update ordering
    /// matters, as it does for relay correlation.
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_login_attempts")]
    pub login_attempts: u32,
    #[serde(default = "default_login_backoff_ms")]
    pub login_backoff_ms: u64,
    #[serde(default = "default_watchdog_interval_secs")]
    pub watchdog_interval_secs: u64,
    /// How long an entry must stay at refcount zero before eviction
    #[serde(default = "default_eviction_grace_secs")]
    pub eviction_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Username of the trusted relay peer
    #[serde(default = "default_relay_peer")]
    pub peer: String,
    #[serde(default = "default_relay_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_relay_retries")]
    pub retries: usize,
    /// Fixed delay between ordinary retry attempts
    #[serde(default = "default_relay_retry_delay_secs")]
    pub retry_delay_secs: u64,
}

fn default_workers() -> usize {
    1
}

fn default_login_attempts() -> u32 {
    3
}

fn default_login_backoff_ms() -> u64 {
    3000
}

fn default_watchdog_interval_secs() -> u64 {
    10
}

fn default_eviction_grace_secs() -> u64 {
    120
}

fn default_relay_peer() -> String {
    "relay_auth_bot".to_string()
}

fn default_relay_timeout_secs() -> u64 {
    20
}

fn default_relay_retries() -> usize {
    3
}

fn default_relay_retry_delay_secs() -> u64 {
    3
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            login_attempts: default_login_attempts(),
            login_backoff_ms: default_login_backoff_ms(),
            watchdog_interval_secs: default_watchdog_interval_secs(),
            eviction_grace_secs: default_eviction_grace_secs(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            peer: default_relay_peer(),
            timeout_secs: default_relay_timeout_secs(),
            retries: default_relay_retries(),
            retry_delay_secs: default_relay_retry_delay_secs(),
        }
    }
}

impl PoolConfig {
    pub fn login_backoff(&self) -> Duration {
        Duration::from_millis(self.login_backoff_ms)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs.max(1))
    }

    pub fn eviction_grace(&self) -> Duration {
        Duration::from_secs(self.eviction_grace_secs)
    }
}

impl RelayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            toml::from_str::<Config>(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            Config::default()
        };

        if let Ok(val) = std::env::var("TELEPOOL_BASEDIR") {
            config.basedir = Some(val);
        }
        if let Ok(val) = std::env::var("TELEPOOL_RELAY_PEER") {
            config.relay.peer = val;
        }

        Ok(config)
    }

    /// Resolved base directory for persisted credential state.
    pub fn basedir(&self) -> std::path::PathBuf {
        if let Some(dir) = &self.basedir {
            return dir.into();
        }
        directories::ProjectDirs::from("", "", "telepool")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| "./telepool".into())
    }

    pub fn account(&self, identity: &str) -> Option<&AccountConfig> {
        self.accounts.iter().find(|a| a.identity == identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.pool.workers, 1);
        assert_eq!(config.pool.login_attempts, 3);
        assert_eq!(config.pool.watchdog_interval_secs, 10);
        assert_eq!(config.pool.eviction_grace_secs, 120);
        assert_eq!(config.relay.timeout_secs, 20);
        assert_eq!(config.relay.retries, 3);
        assert_eq!(config.relay.retry_delay_secs, 3);
    }

    #[test]
    fn test_parse_accounts_and_overridden_pool() {
        let toml = r#"
            basedir = "/tmp/telepool-test"

            [[accounts]]
            identity = "+15551234"
            token = "abc123"

            [[accounts]]
            identity = "+15559999"
            session = "persisted-string"

            [pool]
            eviction_grace_secs = 30

            [relay]
            peer = "my_relay_bot"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.accounts.len(), 2);
        assert_eq!(config.accounts[0].identity, "+15551234");
        assert_eq!(
            config.accounts[1].session.as_deref(),
            Some("persisted-string")
        );
        assert_eq!(config.pool.eviction_grace_secs, 30);
        assert_eq!(config.pool.workers, 1);
        assert_eq!(config.relay.peer, "my_relay_bot");
        assert_eq!(
            config.basedir(),
            std::path::PathBuf::from("/tmp/telepool-test")
        );
    }

    #[test]
    fn test_account_lookup() {
        let config: Config = toml::from_str(
            r#"
            [[accounts]]
            identity = "a"
        "#,
        )
        .unwrap();
        assert!(config.account("a").is_some());
        assert!(config.account("b").is_none());
    }

    #[test]
    fn test_duration_helpers() {
        let pool = PoolConfig::default();
        assert_eq!(pool.login_backoff(), Duration::from_millis(3000));
        assert_eq!(pool.watchdog_interval(), Duration::from_secs(10));
        let relay = RelayConfig::default();
        assert_eq!(relay.timeout(), Duration::from_secs(20));
    }
}
