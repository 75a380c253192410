//! Platform publishers
//!
//! A [`Publisher`] turns one stored post into one platform-side post. The
//! dispatcher only talks to this trait; which publishers exist is decided
//! once, from configuration, by [`PublisherSet::from_config`].
//!
//! ```no_run
//! use libcrosspost::platforms::PublisherSet;
//! use libcrosspost::Config;
//!
//! # fn example() -> libcrosspost::Result<()> {
//! let config = Config::load()?;
//! let publishers = PublisherSet::from_config(&config)?;
//! for platform in publishers.configured() {
//!     println!("{} is ready", platform);
//! }
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::error::{ConfigError, CrosspostError, PlatformError, Result};
use crate::types::{PlatformKind, Published, ScheduledPost};

pub mod note;
pub mod oauth1;
pub mod wordpress;
pub mod x;

// Public so the integration tests can drive the dispatcher with it
pub mod mock;

/// Result of a single publish call
pub type PublishResult = std::result::Result<Published, PlatformError>;

/// Per-request HTTP timeout used by the platform clients
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

#[async_trait]
pub trait Publisher: Send + Sync {
    fn platform(&self) -> PlatformKind;

    /// Maximum post length in characters, if the platform has one
    fn character_limit(&self) -> Option<usize> {
        self.platform().character_limit()
    }

    /// Reject content that the platform would refuse, without a network call
    fn validate_content(&self, content: &str) -> std::result::Result<(), PlatformError> {
        if content.trim().is_empty() {
            return Err(PlatformError::Validation(
                "Content cannot be empty".to_string(),
            ));
        }

        if let Some(limit) = self.character_limit() {
            let count = content.chars().count();
            if count > limit {
                return Err(PlatformError::Validation(format!(
                    "Content exceeds {} character limit for {} ({} characters)",
                    limit,
                    self.platform(),
                    count
                )));
            }
        }

        Ok(())
    }

    /// Publish a post. Expected failures are returned, never panicked on.
    async fn publish(&self, post: &ScheduledPost) -> PublishResult;
}

/// The publishers available to a dispatcher, keyed by platform
#[derive(Default, Clone)]
pub struct PublisherSet {
    publishers: HashMap<PlatformKind, Arc<dyn Publisher>>,
    missing: BTreeMap<PlatformKind, Vec<String>>,
    misconfigured: BTreeMap<PlatformKind, String>,
}

impl PublisherSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every publisher whose credentials are present.
    ///
    /// Platforms with missing credentials or invalid settings are remembered
    /// so the dispatcher can explain why their posts are skipped. One broken
    /// platform never stops the others from being built.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut set = Self::new();

        set.add_configured(PlatformKind::X, || {
            x::XPublisher::from_config(&config.x).map(|p| Arc::new(p) as Arc<dyn Publisher>)
        });
        set.add_configured(PlatformKind::Note, || {
            note::NotePublisher::from_config(&config.note).map(|p| Arc::new(p) as Arc<dyn Publisher>)
        });
        set.add_configured(PlatformKind::Wordpress, || {
            wordpress::WordpressPublisher::from_config(&config.wordpress)
                .map(|p| Arc::new(p) as Arc<dyn Publisher>)
        });

        tracing::debug!(
            configured = ?set.configured(),
            unconfigured = ?set.missing.keys().collect::<Vec<_>>(),
            misconfigured = ?set.misconfigured.keys().collect::<Vec<_>>(),
            "Built publishers"
        );
        Ok(set)
    }

    fn add_configured<F>(&mut self, platform: PlatformKind, build: F)
    where
        F: FnOnce() -> Result<Arc<dyn Publisher>>,
    {
        match build() {
            Ok(publisher) => self.insert(publisher),
            Err(CrosspostError::Config(ConfigError::MissingCredential { variables, .. })) => {
                self.missing.insert(platform, variables);
            }
            Err(e) => {
                tracing::warn!(platform = %platform, error = %e, "Platform is misconfigured");
                self.misconfigured.insert(platform, e.to_string());
            }
        }
    }

    /// Add a publisher, replacing any previous one for the same platform
    pub fn insert(&mut self, publisher: Arc<dyn Publisher>) {
        let platform = publisher.platform();
        self.missing.remove(&platform);
        self.misconfigured.remove(&platform);
        self.publishers.insert(platform, publisher);
    }

    pub fn with(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.insert(publisher);
        self
    }

    pub fn get(&self, platform: PlatformKind) -> Option<&Arc<dyn Publisher>> {
        self.publishers.get(&platform)
    }

    /// Platforms that can be dispatched to, in a stable order
    pub fn configured(&self) -> Vec<PlatformKind> {
        let mut platforms: Vec<_> = self.publishers.keys().copied().collect();
        platforms.sort();
        platforms
    }

    /// Why a platform has no publisher: its invalid setting, or the
    /// credentials it still needs
    pub fn unavailable_reason(&self, platform: PlatformKind) -> String {
        match self.misconfigured.get(&platform) {
            Some(error) => format!("{} is misconfigured: {}", platform, error),
            None => self.missing_credential(platform).to_string(),
        }
    }

    /// The configuration error naming the credentials a platform needs
    pub fn missing_credential(&self, platform: PlatformKind) -> ConfigError {
        let variables = self
            .missing
            .get(&platform)
            .cloned()
            .unwrap_or_else(|| required_variables(platform));
        ConfigError::MissingCredential {
            platform: platform.to_string(),
            variables,
        }
    }
}

/// Environment variables that configure a platform
pub fn required_variables(platform: PlatformKind) -> Vec<String> {
    match platform {
        PlatformKind::X => vec![
            "X_BEARER_TOKEN".to_string(),
            "X_API_KEY + X_API_SECRET + X_ACCESS_TOKEN + X_ACCESS_TOKEN_SECRET".to_string(),
        ],
        PlatformKind::Note => vec!["NOTE_EMAIL + NOTE_PASSWORD".to_string()],
        PlatformKind::Wordpress => {
            vec!["WORDPRESS_URL + WORDPRESS_USERNAME + WORDPRESS_APP_PASSWORD".to_string()]
        }
    }
}

/// Names of the unset entries among `(variable, value)` pairs
pub(crate) fn unset_variables(pairs: &[(&str, &Option<String>)]) -> Vec<String> {
    pairs
        .iter()
        .filter(|(_, value)| value.as_deref().map_or(true, |v| v.trim().is_empty()))
        .map(|(name, _)| name.to_string())
        .collect()
}

/// Shared reqwest client settings for the platform APIs
pub(crate) fn http_client_builder() -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .connect_timeout(Duration::from_secs(10))
        .user_agent(concat!("crosspost/", env!("CARGO_PKG_VERSION")))
}

pub(crate) fn build_client(builder: reqwest::ClientBuilder) -> Result<reqwest::Client> {
    builder.build().map_err(|e| {
        CrosspostError::Platform(PlatformError::Network(format!(
            "failed to build HTTP client: {}",
            e
        )))
    })
}

/// Turn a non-success response into a classified error
pub(crate) async fn error_from_response(platform: &str, response: reqwest::Response) -> PlatformError {
    let status = response.status().as_u16();
    let retry_hint = response
        .headers()
        .get("retry-after")
        .or_else(|| response.headers().get("x-rate-limit-reset"))
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = response.text().await.unwrap_or_default();

    match (PlatformError::from_status(platform, status, &body), retry_hint) {
        (PlatformError::RateLimit(message), Some(hint)) => {
            PlatformError::RateLimit(format!("{} (retry hint: {})", message, hint))
        }
        (error, _) => error,
    }
}

pub(crate) fn trim_base_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}
