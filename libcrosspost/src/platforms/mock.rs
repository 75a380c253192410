//! Configurable in-process publisher
//!
//! Simulates successes, scripted failures and latency without any network
//! access, and counts calls so tests can assert that nothing was published.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::sleep;

use crate::error::PlatformError;
use crate::platforms::{PublishResult, Publisher};
use crate::types::{PlatformKind, Published, ScheduledPost};

/// Configuration for mock publisher behavior
#[derive(Debug, Clone)]
pub struct MockConfig {
    pub platform: PlatformKind,

    /// Outcomes returned by successive calls; once drained every call
    /// falls back to `default_error` or success
    pub script: Arc<Mutex<VecDeque<Option<PlatformError>>>>,

    /// Error returned when the script is empty
    pub default_error: Option<PlatformError>,

    /// Delay before completing a publish (simulates network latency)
    pub delay: Duration,

    /// Overrides the platform's own character limit when set
    pub character_limit: Option<usize>,

    /// Platform post ID returned on success instead of a generated one
    pub post_id: Option<String>,

    pub publish_call_count: Arc<Mutex<usize>>,

    /// Content of every successful publish, in order
    pub published_content: Arc<Mutex<Vec<String>>>,
}

impl MockConfig {
    pub fn new(platform: PlatformKind) -> Self {
        Self {
            platform,
            script: Arc::new(Mutex::new(VecDeque::new())),
            default_error: None,
            delay: Duration::from_millis(0),
            character_limit: platform.character_limit(),
            post_id: None,
            publish_call_count: Arc::new(Mutex::new(0)),
            published_content: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

/// Mock publisher for testing
#[derive(Debug, Clone)]
pub struct MockPublisher {
    config: MockConfig,
}

impl MockPublisher {
    pub fn new(config: MockConfig) -> Self {
        Self { config }
    }

    /// Always succeeds
    pub fn success(platform: PlatformKind) -> Self {
        Self::new(MockConfig::new(platform))
    }

    /// Fails every call with `error`
    pub fn failing(platform: PlatformKind, error: PlatformError) -> Self {
        Self::new(MockConfig {
            default_error: Some(error),
            ..MockConfig::new(platform)
        })
    }

    /// Returns the scripted outcomes in order (`None` is a success), then succeeds
    pub fn scripted(platform: PlatformKind, outcomes: Vec<Option<PlatformError>>) -> Self {
        Self::new(MockConfig {
            script: Arc::new(Mutex::new(outcomes.into_iter().collect())),
            ..MockConfig::new(platform)
        })
    }

    /// Always succeeds, answering with the given platform post ID
    pub fn with_post_id(platform: PlatformKind, post_id: impl Into<String>) -> Self {
        Self::new(MockConfig {
            post_id: Some(post_id.into()),
            ..MockConfig::new(platform)
        })
    }

    pub fn with_delay(platform: PlatformKind, delay: Duration) -> Self {
        Self::new(MockConfig {
            delay,
            ..MockConfig::new(platform)
        })
    }

    pub fn publish_call_count(&self) -> usize {
        *lock(&self.config.publish_call_count)
    }

    pub fn published_content(&self) -> Vec<String> {
        lock(&self.config.published_content).clone()
    }
}

// A panicking test thread must not hide the counters from the others
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Publisher for MockPublisher {
    fn platform(&self) -> PlatformKind {
        self.config.platform
    }

    fn character_limit(&self) -> Option<usize> {
        self.config.character_limit
    }

    async fn publish(&self, post: &ScheduledPost) -> PublishResult {
        let call = {
            let mut count = lock(&self.config.publish_call_count);
            *count += 1;
            *count
        };

        if !self.config.delay.is_zero() {
            sleep(self.config.delay).await;
        }

        let scripted = lock(&self.config.script).pop_front();
        let outcome = match scripted {
            Some(outcome) => outcome,
            None => self.config.default_error.clone(),
        };

        if let Some(error) = outcome {
            return Err(error);
        }

        lock(&self.config.published_content).push(post.content.clone());

        let platform_post_id = self
            .config
            .post_id
            .clone()
            .unwrap_or_else(|| format!("mock-{}-{}", self.config.platform, call));
        Ok(Published {
            url: Some(format!(
                "https://mock.invalid/{}/{}",
                self.config.platform, platform_post_id
            )),
            platform_post_id,
        })
    }
}
