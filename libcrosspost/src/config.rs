//! Configuration management for Crosspost
//!
//! Settings come from a TOML file and can be overridden by environment
//! variables, which is how credentials are usually supplied in deployment.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, Result};
use crate::types::PlatformKind;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub x: XConfig,
    #[serde(default)]
    pub note: NoteConfig,
    #[serde(default)]
    pub wordpress: WordpressConfig,
    /// Post budgets keyed by platform name
    #[serde(default)]
    pub quota: HashMap<String, QuotaConfig>,
    #[serde(default)]
    pub spool: SpoolConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "~/.local/share/crosspost/posts.db".to_string(),
        }
    }
}

/// Dispatch cycle tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Maximum posts attempted per cycle
    pub batch_limit: usize,
    pub max_retries: u32,
    /// Pause between two publishes within one cycle
    pub pacing_delay_ms: u64,
    pub publish_timeout_secs: u64,
    /// How long a claim stays valid before another cycle may recover it
    pub lease_secs: u64,
    /// Base delay before a failed post becomes due again (doubles per retry)
    pub retry_delay_secs: u64,
    /// Base delay after an HTTP 429 (doubles per retry)
    pub rate_limit_backoff_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_limit: 10,
            max_retries: 3,
            pacing_delay_ms: 2000,
            publish_timeout_secs: 30,
            lease_secs: 300,
            retry_delay_secs: 60,
            rate_limit_backoff_secs: 900,
        }
    }
}

impl DispatchConfig {
    pub fn pacing_delay(&self) -> Duration {
        Duration::from_millis(self.pacing_delay_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Bearer token required on the dispatch endpoint when set
    #[serde(skip_serializing)]
    pub cron_secret: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8787".to_string(),
            cron_secret: None,
        }
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct XConfig {
    pub api_base: Option<String>,
    #[serde(skip_serializing)]
    pub bearer_token: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    #[serde(skip_serializing)]
    pub api_secret: Option<String>,
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    #[serde(skip_serializing)]
    pub access_token_secret: Option<String>,
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NoteConfig {
    pub base_url: Option<String>,
    #[serde(skip_serializing)]
    pub email: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WordpressConfig {
    pub site_url: Option<String>,
    #[serde(skip_serializing)]
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub app_password: Option<String>,
    /// Status given to created posts ("publish", "draft", "private")
    pub post_status: Option<String>,
}

fn redact(value: &Option<String>) -> &'static str {
    if value.is_some() {
        "<set>"
    } else {
        "<unset>"
    }
}

impl std::fmt::Debug for XConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XConfig")
            .field("api_base", &self.api_base)
            .field("bearer_token", &redact(&self.bearer_token))
            .field("api_key", &redact(&self.api_key))
            .field("api_secret", &redact(&self.api_secret))
            .field("access_token", &redact(&self.access_token))
            .field("access_token_secret", &redact(&self.access_token_secret))
            .finish()
    }
}

impl std::fmt::Debug for NoteConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoteConfig")
            .field("base_url", &self.base_url)
            .field("email", &redact(&self.email))
            .field("password", &redact(&self.password))
            .finish()
    }
}

impl std::fmt::Debug for WordpressConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WordpressConfig")
            .field("site_url", &self.site_url)
            .field("username", &redact(&self.username))
            .field("app_password", &redact(&self.app_password))
            .field("post_status", &self.post_status)
            .finish()
    }
}

/// A fixed-window post budget for one platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaConfig {
    pub posts: u32,
    #[serde(default = "default_quota_window")]
    pub window_secs: i64,
}

fn default_quota_window() -> i64 {
    24 * 3600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpoolConfig {
    pub path: String,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            path: "~/.local/share/crosspost/spool.jsonl".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the default location
    ///
    /// A missing default file is not an error: deployments that configure
    /// everything through the environment run on built-in defaults. A path
    /// given through `CROSSPOST_CONFIG` must exist.
    pub fn load() -> Result<Self> {
        let explicit = std::env::var("CROSSPOST_CONFIG").is_ok();
        let config_path = resolve_config_path()?;

        let mut config = if explicit || config_path.exists() {
            Self::load_from_path(&config_path)?
        } else {
            tracing::debug!(
                "No config file at {}, using defaults",
                config_path.display()
            );
            Self::default()
        };

        config.apply_env();
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(ConfigError::ParseError)?;
        Ok(config)
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup; empty values are ignored
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(path) = get("CROSSPOST_DB_PATH") {
            self.database.path = path;
        }
        if let Some(secret) = get("CRON_SECRET") {
            self.server.cron_secret = Some(secret);
        }
        if let Some(bind) = get("CROSSPOST_BIND") {
            self.server.bind = bind;
        }

        override_with(&mut self.x.bearer_token, get("X_BEARER_TOKEN"));
        override_with(&mut self.x.api_key, get("X_API_KEY"));
        override_with(&mut self.x.api_secret, get("X_API_SECRET"));
        override_with(&mut self.x.access_token, get("X_ACCESS_TOKEN"));
        override_with(&mut self.x.access_token_secret, get("X_ACCESS_TOKEN_SECRET"));

        override_with(&mut self.note.email, get("NOTE_EMAIL"));
        override_with(&mut self.note.password, get("NOTE_PASSWORD"));

        override_with(&mut self.wordpress.site_url, get("WORDPRESS_URL"));
        override_with(&mut self.wordpress.username, get("WORDPRESS_USERNAME"));
        override_with(&mut self.wordpress.app_password, get("WORDPRESS_APP_PASSWORD"));
    }

    /// Quota for a platform, if one is configured
    pub fn quota_for(&self, platform: PlatformKind) -> Option<QuotaConfig> {
        self.quota.get(platform.as_str()).copied()
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.database.path.trim().is_empty() {
            return Err(ConfigError::MissingField("database.path".to_string()).into());
        }
        if self.dispatch.batch_limit == 0 {
            return Err(ConfigError::MissingField(
                "dispatch.batch_limit must be at least 1".to_string(),
            )
            .into());
        }
        if self.dispatch.max_retries == 0 {
            return Err(ConfigError::MissingField(
                "dispatch.max_retries must be at least 1".to_string(),
            )
            .into());
        }
        // A lease must outlast the pacing sleep and the publish it guards
        let guarded = self.dispatch.pacing_delay() + self.dispatch.publish_timeout();
        if Duration::from_secs(self.dispatch.lease_secs) <= guarded {
            return Err(ConfigError::MissingField(format!(
                "dispatch.lease_secs must exceed publish_timeout_secs plus the pacing delay ({}s)",
                guarded.as_secs_f64()
            ))
            .into());
        }
        for (name, quota) in &self.quota {
            name.parse::<PlatformKind>().map_err(|_| {
                ConfigError::MissingField(format!("quota.{} names an unknown platform", name))
            })?;
            if quota.window_secs <= 0 {
                return Err(ConfigError::MissingField(format!(
                    "quota.{}.window_secs must be positive",
                    name
                ))
                .into());
            }
        }
        Ok(())
    }
}

fn override_with(slot: &mut Option<String>, value: Option<String>) {
    if value.is_some() {
        *slot = value;
    }
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("CROSSPOST_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("crosspost").join("config.toml"))
}
