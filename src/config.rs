//! Production configuration system
//!
//! Provides centralized configuration management with:
//! - Environment variable support
//! - Config file loading (optional)
//! - Runtime defaults
//! - Validation and type safety

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Poll scheduling and circuit breaker
    pub polling: PollingConfig,

    /// Per-source enablement
    pub sources: SourcesConfig,

    /// Remote endpoint configuration
    pub remote: RemoteConfig,

    /// History retention and downsampling
    pub history: HistoryConfig,

    /// Accounts to poll
    pub accounts: AccountsConfig,

    /// Paths configuration
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Seconds between poll cycles.
    pub interval_secs: u64,
    /// Consecutive fully-failed cycles before the circuit opens.
    pub failure_ceiling: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcesConfig {
    pub remote_enabled: bool,
    pub local_enabled: bool,
    /// How far back a local log scan looks, in hours.
    pub local_lookback_hours: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub usage_url: String,
    pub token_url: String,
    pub client_id: String,
    pub beta_header: String,
    pub required_scopes: Vec<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Points older than this are dropped.
    pub retention_days: i64,
    /// Points younger than this keep full resolution.
    pub recent_window_days: i64,
    /// Minimum seconds between downsample passes per account.
    pub downsample_interval_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountsConfig {
    pub primary: String,
    #[serde(default)]
    pub secondary: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root of the local Claude installation (session logs live under
    /// `projects/`, credentials under `.credentials.json`).
    pub claude_home: PathBuf,
    /// Where per-account history files are written.
    pub history_directory: PathBuf,
    /// Destination for file log output.
    pub log_directory: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let claude_home = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".claude");
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("claude-sentinel");

        Self {
            logging: LoggingConfig {
                level: "ERROR".to_string(),
                format: "pretty".to_string(),
                output: "console".to_string(),
            },
            polling: PollingConfig {
                interval_secs: 60,
                failure_ceiling: 3,
            },
            sources: SourcesConfig {
                remote_enabled: true,
                local_enabled: true,
                local_lookback_hours: 5,
            },
            remote: RemoteConfig {
                usage_url: "https://api.anthropic.com/api/oauth/usage".to_string(),
                token_url: "https://console.anthropic.com/v1/oauth/token".to_string(),
                client_id: "9d1c250a-e61b-44d9-88ed-5944d1962f5e".to_string(),
                beta_header: "oauth-2025-04-20".to_string(),
                required_scopes: vec!["user:inference".to_string()],
                timeout_secs: 15,
            },
            history: HistoryConfig {
                retention_days: 90,
                recent_window_days: 7,
                downsample_interval_secs: 3600,
            },
            accounts: AccountsConfig {
                primary: "default".to_string(),
                secondary: Vec::new(),
            },
            paths: PathsConfig {
                claude_home,
                history_directory: data_dir.join("history"),
                log_directory: PathBuf::from("logs"),
            },
        }
    }
}

impl Config {
    /// Load configuration from environment, file, and defaults
    pub fn load() -> Result<Self> {
        let mut config = Config::default();

        // Try to load from config file if it exists
        let config_paths = [
            PathBuf::from("claude-sentinel.toml"),
            PathBuf::from(".claude-sentinel.toml"),
            dirs::config_dir()
                .map(|d| d.join("claude-sentinel").join("config.toml"))
                .unwrap_or_default(),
        ];

        for path in &config_paths {
            if path.exists() {
                info!(config_file = %path.display(), "Loading configuration from file");
                config = Self::load_from_file(path)?;
                break;
            }
        }

        // Override with environment variables
        config.apply_env_overrides()?;

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from TOML file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        // Logging overrides
        if let Ok(val) = env::var("LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = env::var("LOG_FORMAT") {
            self.logging.format = val;
        }
        if let Ok(val) = env::var("LOG_OUTPUT") {
            self.logging.output = val;
        }

        // Polling overrides
        if let Ok(val) = env::var("SENTINEL_POLL_INTERVAL_SECS") {
            self.polling.interval_secs =
                val.parse().context("Invalid SENTINEL_POLL_INTERVAL_SECS")?;
        }
        if let Ok(val) = env::var("SENTINEL_FAILURE_CEILING") {
            self.polling.failure_ceiling =
                val.parse().context("Invalid SENTINEL_FAILURE_CEILING")?;
        }

        // Source overrides
        if let Ok(val) = env::var("SENTINEL_REMOTE_ENABLED") {
            self.sources.remote_enabled = val.parse().context("Invalid SENTINEL_REMOTE_ENABLED")?;
        }
        if let Ok(val) = env::var("SENTINEL_LOCAL_ENABLED") {
            self.sources.local_enabled = val.parse().context("Invalid SENTINEL_LOCAL_ENABLED")?;
        }

        // Remote endpoint overrides
        if let Ok(val) = env::var("SENTINEL_USAGE_URL") {
            self.remote.usage_url = val;
        }
        if let Ok(val) = env::var("SENTINEL_TOKEN_URL") {
            self.remote.token_url = val;
        }

        // Path overrides
        if let Ok(val) = env::var("CLAUDE_HOME") {
            self.paths.claude_home = PathBuf::from(val);
        }
        if let Ok(val) = env::var("SENTINEL_HISTORY_DIR") {
            self.paths.history_directory = PathBuf::from(val);
        }
        if let Ok(val) = env::var("SENTINEL_LOG_DIR") {
            self.paths.log_directory = PathBuf::from(val);
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.polling.interval_secs == 0 {
            return Err(anyhow::anyhow!("Poll interval must be greater than 0"));
        }

        if self.polling.failure_ceiling == 0 {
            return Err(anyhow::anyhow!("Failure ceiling must be greater than 0"));
        }

        if !self.sources.remote_enabled && !self.sources.local_enabled {
            return Err(anyhow::anyhow!(
                "At least one data source must be enabled"
            ));
        }

        if self.history.retention_days <= self.history.recent_window_days {
            return Err(anyhow::anyhow!(
                "Retention ({} days) must exceed the recent window ({} days)",
                self.history.retention_days,
                self.history.recent_window_days
            ));
        }

        if self.history.recent_window_days <= 0 {
            return Err(anyhow::anyhow!("Recent window must be greater than 0 days"));
        }

        if self.accounts.primary.is_empty() {
            return Err(anyhow::anyhow!("Primary account id must not be empty"));
        }

        Ok(())
    }

    /// Save current configuration to file
    #[allow(dead_code)]
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        info!(path = %path.display(), "Configuration saved to file");

        Ok(())
    }
}

/// Global configuration instance
static CONFIG: OnceLock<Config> = OnceLock::new();

/// Get the global configuration instance
pub fn get_config() -> &'static Config {
    CONFIG.get_or_init(|| Config::load().expect("Failed to load configuration"))
}
