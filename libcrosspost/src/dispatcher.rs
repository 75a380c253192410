//! Dispatch cycle
//!
//! One call to [`Dispatcher::run_cycle`] does a bounded amount of work and
//! returns: recover stale leases, then claim, publish and record due posts
//! one at a time, pacing between platform calls. Nothing is kept in memory
//! between cycles; all state lives in the store.

use serde::Serialize;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Config, DispatchConfig};
use crate::error::{ErrorKind, PlatformError, Result};
use crate::platforms::{Publisher, PublisherSet};
use crate::quota::QuotaPolicy;
use crate::types::{PlatformKind, ScheduledPost};
use crate::Database;

/// Longest backoff, however many retries have happened
const MAX_BACKOFF_SECS: i64 = 24 * 3600;

/// Quota windows are kept at least this long after they start
const QUOTA_RETENTION_SECS: i64 = 7 * 24 * 3600;

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub batch_limit: usize,
    pub max_retries: u32,
    pub pacing_delay: Duration,
    pub publish_timeout: Duration,
    pub lease_secs: i64,
    pub retry_delay_secs: i64,
    pub rate_limit_backoff_secs: i64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from(&DispatchConfig::default())
    }
}

impl From<&DispatchConfig> for DispatchSettings {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            batch_limit: config.batch_limit.max(1),
            max_retries: config.max_retries.max(1),
            pacing_delay: config.pacing_delay(),
            publish_timeout: config.publish_timeout(),
            lease_secs: i64::try_from(config.lease_secs).unwrap_or(i64::MAX),
            retry_delay_secs: i64::try_from(config.retry_delay_secs).unwrap_or(MAX_BACKOFF_SECS),
            rate_limit_backoff_secs: i64::try_from(config.rate_limit_backoff_secs)
                .unwrap_or(MAX_BACKOFF_SECS),
        }
    }
}

impl DispatchSettings {
    /// Delay before attempt `retry_count + 1`, doubling per failure
    pub fn backoff_secs(&self, error: &PlatformError, retry_count: u32) -> i64 {
        let base = match error {
            PlatformError::RateLimit(_) => self.rate_limit_backoff_secs,
            _ => self.retry_delay_secs,
        };
        let exponent = retry_count.saturating_sub(1).min(16);
        base.saturating_mul(1_i64 << exponent).min(MAX_BACKOFF_SECS)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Posted,
    /// Failed this time, back in the queue
    Retrying,
    Failed,
    /// Not attempted because the platform's quota window is used up
    Deferred,
    /// Not attempted because the platform is unconfigured or misconfigured
    Skipped,
    /// Attempted, but the lease expired before the outcome could be recorded
    LeaseLost,
}

/// What happened to one post (or, for skipped platforms, one group of posts)
#[derive(Debug, Clone, Serialize)]
pub struct PostResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_id: Option<String>,
    pub platform: PlatformKind,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform_post_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<i64>,
}

impl PostResult {
    fn for_post(post: &ScheduledPost, outcome: Outcome) -> Self {
        Self {
            post_id: Some(post.id.clone()),
            platform: post.platform,
            outcome,
            platform_post_id: None,
            url: None,
            error: None,
            error_kind: None,
            retry_count: None,
            retry_after: None,
        }
    }
}

/// Summary of one dispatch cycle
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    /// Posts for which a publish outcome was recorded
    pub processed: usize,
    pub posted: usize,
    pub failed: usize,
    pub retried: usize,
    /// Due posts left untouched (unconfigured platform or exhausted quota)
    pub skipped: usize,
    /// Expired leases returned to the queue before dispatching
    pub recovered: usize,
    pub results: Vec<PostResult>,
    pub errors: Vec<String>,
}

impl CycleReport {
    pub fn is_empty(&self) -> bool {
        self.processed == 0 && self.skipped == 0 && self.recovered == 0
    }
}

pub struct Dispatcher {
    db: Database,
    publishers: PublisherSet,
    quota: QuotaPolicy,
    settings: DispatchSettings,
    instance: String,
}

impl Dispatcher {
    pub fn new(db: Database, publishers: PublisherSet, settings: DispatchSettings) -> Self {
        Self {
            db,
            publishers,
            quota: QuotaPolicy::default(),
            settings,
            instance: format!("dispatch-{}", Uuid::new_v4()),
        }
    }

    /// Build publishers, quota and settings from configuration
    pub fn from_config(db: Database, config: &Config) -> Result<Self> {
        let publishers = PublisherSet::from_config(config)?;
        Ok(Self::new(db, publishers, DispatchSettings::from(&config.dispatch))
            .with_quota(QuotaPolicy::from_config(config)))
    }

    pub fn with_quota(mut self, quota: QuotaPolicy) -> Self {
        self.quota = quota;
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    pub fn publishers(&self) -> &PublisherSet {
        &self.publishers
    }

    /// Run one bounded dispatch cycle that starts at `now` (unix seconds).
    ///
    /// Claims, leases and outcomes are stamped with `now` plus the time the
    /// cycle has been running, so a lease always starts when its post is
    /// claimed. Store failures abort the cycle with an error; platform
    /// failures are recorded on the post and reported.
    pub async fn run_cycle(&self, now: i64) -> Result<CycleReport> {
        let started = Instant::now();
        let clock = || {
            let elapsed = i64::try_from(started.elapsed().as_secs()).unwrap_or(i64::MAX);
            now.saturating_add(elapsed)
        };
        let owner = format!("{}/{}", self.instance, Uuid::new_v4());
        let mut report = CycleReport::default();

        let recovered = self
            .db
            .recover_expired_leases(now, self.settings.max_retries)
            .await?;
        report.recovered = recovered.len();

        let pruned = self
            .quota
            .cleanup_old_windows(&self.db, now.saturating_sub(self.quota_retention_secs()))
            .await?;
        if pruned > 0 {
            debug!(pruned, "Pruned old quota windows");
        }

        let mut eligible = self.publishers.configured();
        self.report_unconfigured(now, &eligible, &mut report).await?;

        let mut published_any = false;
        while report.processed < self.settings.batch_limit && !eligible.is_empty() {
            let claimed_at = clock();
            let lease_until = claimed_at.saturating_add(self.settings.lease_secs);
            // Posts attempted since the cycle started are left for the next one
            let Some(post) = self
                .db
                .claim_next_due(claimed_at, now, &eligible, &owner, lease_until)
                .await?
            else {
                break;
            };

            let Some(publisher) = self.publishers.get(post.platform).cloned() else {
                // Only configured platforms are claimed
                warn!(post_id = %post.id, platform = %post.platform, "No publisher for claimed post");
                self.db.release_claim(&post.id, &owner, claimed_at).await?;
                eligible.retain(|p| *p != post.platform);
                continue;
            };

            if let Err(error) = publisher.validate_content(&post.content) {
                self.record_failure(&post, &owner, error, claimed_at, &mut report)
                    .await?;
                report.processed += 1;
                continue;
            }

            if !self.quota.try_reserve(&self.db, post.platform, claimed_at).await? {
                self.db.release_claim(&post.id, &owner, claimed_at).await?;
                eligible.retain(|p| *p != post.platform);
                report.skipped += 1;
                let mut result = PostResult::for_post(&post, Outcome::Deferred);
                result.error = Some(format!("{} quota exhausted for the current window", post.platform));
                report.results.push(result);
                continue;
            }

            if published_any && !self.settings.pacing_delay.is_zero() {
                sleep(self.settings.pacing_delay).await;
            }
            published_any = true;

            let outcome = self.publish_with_timeout(publisher.as_ref(), &post).await;
            let finished_at = clock();
            report.processed += 1;

            match outcome {
                Ok(published) => {
                    let recorded = self
                        .db
                        .mark_posted(&post.id, &owner, &published, finished_at)
                        .await?;
                    let mut result = if recorded {
                        info!(
                            post_id = %post.id,
                            platform = %post.platform,
                            platform_post_id = %published.platform_post_id,
                            "Posted"
                        );
                        report.posted += 1;
                        PostResult::for_post(&post, Outcome::Posted)
                    } else {
                        lost_lease(&post, &mut report)
                    };
                    result.platform_post_id = Some(published.platform_post_id);
                    result.url = published.url;
                    report.results.push(result);
                }
                Err(error) => {
                    self.record_failure(&post, &owner, error, finished_at, &mut report)
                        .await?;
                }
            }
        }

        if report.is_empty() {
            debug!("Dispatch cycle found nothing to do");
        } else {
            info!(
                processed = report.processed,
                posted = report.posted,
                retried = report.retried,
                failed = report.failed,
                skipped = report.skipped,
                recovered = report.recovered,
                "Dispatch cycle finished"
            );
        }

        Ok(report)
    }

    fn quota_retention_secs(&self) -> i64 {
        self.quota
            .longest_window_secs()
            .unwrap_or(0)
            .saturating_mul(2)
            .max(QUOTA_RETENTION_SECS)
    }

    async fn publish_with_timeout(
        &self,
        publisher: &dyn Publisher,
        post: &ScheduledPost,
    ) -> std::result::Result<crate::types::Published, PlatformError> {
        let limit = self.settings.publish_timeout;
        match timeout(limit, publisher.publish(post)).await {
            Ok(result) => result,
            Err(_) => Err(PlatformError::Network(format!(
                "publish to {} timed out after {}s",
                post.platform,
                limit.as_secs_f64()
            ))),
        }
    }

    /// Count an attempt as failed: retry later or give up
    async fn record_failure(
        &self,
        post: &ScheduledPost,
        owner: &str,
        error: PlatformError,
        now: i64,
        report: &mut CycleReport,
    ) -> Result<()> {
        let retry_count = post.retry_count.saturating_add(1);
        let kind = error.kind();
        let message = error.to_string();
        let give_up = !error.is_retryable() || retry_count >= self.settings.max_retries;

        let mut result = if give_up {
            let recorded = self
                .db
                .mark_failed(&post.id, owner, kind, &message, now)
                .await?;
            if recorded {
                warn!(
                    post_id = %post.id,
                    platform = %post.platform,
                    retry_count,
                    error = %message,
                    "Post failed permanently"
                );
                report.failed += 1;
                PostResult::for_post(post, Outcome::Failed)
            } else {
                lost_lease(post, report)
            }
        } else {
            let retry_after = now.saturating_add(self.settings.backoff_secs(&error, retry_count));
            let recorded = self
                .db
                .mark_retry(&post.id, owner, kind, &message, retry_after, now)
                .await?;
            if recorded {
                warn!(
                    post_id = %post.id,
                    platform = %post.platform,
                    retry_count,
                    retry_after,
                    error = %message,
                    "Post failed, will retry"
                );
                report.retried += 1;
                let mut result = PostResult::for_post(post, Outcome::Retrying);
                result.retry_after = Some(retry_after);
                result
            } else {
                lost_lease(post, report)
            }
        };

        result.error = Some(message);
        result.error_kind = Some(kind);
        result.retry_count = Some(retry_count);
        report.results.push(result);
        Ok(())
    }

    /// One skipped entry per unconfigured or misconfigured platform that has due posts
    async fn report_unconfigured(
        &self,
        now: i64,
        configured: &[PlatformKind],
        report: &mut CycleReport,
    ) -> Result<()> {
        for (platform, due) in self.db.count_due_by_platform(now).await? {
            if configured.contains(&platform) {
                continue;
            }

            let message = self.publishers.unavailable_reason(platform);
            warn!(platform = %platform, due, "{}", message);

            let due = usize::try_from(due).unwrap_or(0);
            report.skipped += due;
            report.errors.push(message.clone());
            report.results.push(PostResult {
                post_id: None,
                platform,
                outcome: Outcome::Skipped,
                platform_post_id: None,
                url: None,
                error: Some(message),
                error_kind: None,
                retry_count: None,
                retry_after: None,
            });
        }
        Ok(())
    }
}

/// The attempt finished after another cycle recovered the post's lease.
/// The row now belongs to that recovery, so nothing is recorded here.
fn lost_lease(post: &ScheduledPost, report: &mut CycleReport) -> PostResult {
    let message = format!(
        "lease on post {} expired before its outcome was recorded",
        post.id
    );
    warn!(post_id = %post.id, "{}", message);
    report.errors.push(message);
    PostResult::for_post(post, Outcome::LeaseLost)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platforms::mock::MockPublisher;
    use crate::types::{NewPost, PostStatus};
    use std::sync::Arc;
    use tempfile::TempDir;

    const NOW: i64 = 1_750_000_000;

    async fn setup_test_db() -> (TempDir, Database) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Database::new(&db_path.to_string_lossy()).await.unwrap();
        (temp_dir, db)
    }

    fn fast_settings() -> DispatchSettings {
        DispatchSettings {
            pacing_delay: Duration::ZERO,
            ..Default::default()
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let settings = DispatchSettings::default();
        let network = PlatformError::Network("reset".into());
        assert_eq!(settings.backoff_secs(&network, 1), 60);
        assert_eq!(settings.backoff_secs(&network, 2), 120);
        assert_eq!(settings.backoff_secs(&network, 3), 240);
        assert_eq!(settings.backoff_secs(&network, 40), MAX_BACKOFF_SECS);

        let limited = PlatformError::RateLimit("429".into());
        assert_eq!(settings.backoff_secs(&limited, 1), 900);
    }

    #[test]
    fn test_settings_from_config() {
        let config = DispatchConfig {
            batch_limit: 0,
            lease_secs: 60,
            ..Default::default()
        };
        let settings = DispatchSettings::from(&config);
        assert_eq!(settings.batch_limit, 1);
        assert_eq!(settings.lease_secs, 60);
        assert_eq!(settings.publish_timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_empty_cycle_is_noop() {
        let (_temp, db) = setup_test_db().await;
        let dispatcher = Dispatcher::new(
            db,
            PublisherSet::new().with(Arc::new(MockPublisher::success(PlatformKind::X))),
            fast_settings(),
        );

        let report = dispatcher.run_cycle(NOW).await.unwrap();
        assert_eq!(report.processed, 0);
        assert!(report.is_empty());
        assert!(report.results.is_empty());
        assert!(report.errors.is_empty());
    }

    #[tokio::test]
    async fn test_publish_timeout_counts_as_network_failure() {
        let (_temp, db) = setup_test_db().await;
        let id = db
            .create(NewPost::new("slow", PlatformKind::Note).scheduled_for(NOW - 1), NOW - 10)
            .await
            .unwrap()
            .id;

        let publisher = MockPublisher::with_delay(PlatformKind::Note, Duration::from_secs(5));
        let settings = DispatchSettings {
            publish_timeout: Duration::from_millis(50),
            ..fast_settings()
        };
        let dispatcher = Dispatcher::new(
            db.clone(),
            PublisherSet::new().with(Arc::new(publisher)),
            settings,
        );

        let report = dispatcher.run_cycle(NOW).await.unwrap();
        assert_eq!(report.retried, 1);
        assert_eq!(report.results[0].error_kind, Some(ErrorKind::Network));

        let post = db.get(&id).await.unwrap().unwrap();
        assert_eq!(post.status, PostStatus::Pending);
        assert_eq!(post.retry_count, 1);
        assert!(post.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_batch_limit_bounds_cycle() {
        let (_temp, db) = setup_test_db().await;
        for i in 0..5 {
            db.create(
                NewPost::new(format!("post {}", i), PlatformKind::X).scheduled_for(NOW - 100 + i),
                NOW - 200,
            )
            .await
            .unwrap();
        }

        let publisher = Arc::new(MockPublisher::success(PlatformKind::X));
        let dispatcher = Dispatcher::new(
            db.clone(),
            PublisherSet::new().with(publisher.clone()),
            DispatchSettings {
                batch_limit: 3,
                ..fast_settings()
            },
        );

        let report = dispatcher.run_cycle(NOW).await.unwrap();
        assert_eq!(report.processed, 3);
        assert_eq!(publisher.publish_call_count(), 3);
        assert_eq!(
            publisher.published_content(),
            vec!["post 0", "post 1", "post 2"]
        );
        assert_eq!(db.stats().await.unwrap().pending, 2);
    }
}
