//! End-to-end dispatch cycle tests against a real SQLite store
//!
//! These tests verify:
//! - Each due post is published exactly once and never reselected
//! - Failures are counted, backed off and eventually given up on
//! - Content over a platform limit never reaches the network
//! - Concurrent cycles never publish the same post twice
//! - Quota exhaustion, lease recovery and unconfigured platforms
//! - Leases start when a post is claimed, however long the cycle runs

use anyhow::Result;
use libcrosspost::config::QuotaConfig;
use libcrosspost::db::Database;
use libcrosspost::dispatcher::{DispatchSettings, Dispatcher, Outcome};
use libcrosspost::error::{ErrorKind, PlatformError};
use libcrosspost::platforms::mock::MockPublisher;
use libcrosspost::platforms::PublisherSet;
use libcrosspost::quota::QuotaPolicy;
use libcrosspost::types::{NewPost, PlatformKind, PostStatus};
use libcrosspost::Config;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::sleep;

const NOW: i64 = 1_750_000_000;

/// Helper to create a test database
async fn create_test_db() -> Result<(TempDir, Database)> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("test.db");
    let db = Database::new(&db_path.to_string_lossy()).await?;
    Ok((temp_dir, db))
}

fn settings() -> DispatchSettings {
    DispatchSettings {
        pacing_delay: Duration::ZERO,
        retry_delay_secs: 5,
        ..Default::default()
    }
}

fn dispatcher_with(db: &Database, publisher: &Arc<MockPublisher>) -> Dispatcher {
    Dispatcher::new(
        db.clone(),
        PublisherSet::new().with(publisher.clone()),
        settings(),
    )
}

async fn schedule(db: &Database, content: &str, platform: PlatformKind, at: i64) -> Result<String> {
    let post = db
        .create(NewPost::new(content, platform).scheduled_for(at), at - 60)
        .await?;
    Ok(post.id)
}

#[tokio::test]
async fn test_due_posts_published_once() -> Result<()> {
    let (_temp_dir, db) = create_test_db().await?;
    let first = schedule(&db, "first", PlatformKind::X, NOW - 30).await?;
    let second = schedule(&db, "second", PlatformKind::X, NOW - 10).await?;
    let future = schedule(&db, "later", PlatformKind::X, NOW + 3600).await?;
    db.create(NewPost::new("draft", PlatformKind::X), NOW).await?;

    let publisher = Arc::new(MockPublisher::success(PlatformKind::X));
    let dispatcher = dispatcher_with(&db, &publisher);

    let report = dispatcher.run_cycle(NOW).await?;
    assert_eq!(report.processed, 2);
    assert_eq!(report.posted, 2);
    assert_eq!(publisher.published_content(), vec!["first", "second"]);

    for id in [&first, &second] {
        let post = db.get(id).await?.unwrap();
        assert_eq!(post.status, PostStatus::Posted);
        assert!(post.platform_post_id.is_some());
        assert_eq!(post.posted_at, Some(NOW));
        assert_eq!(post.lease_owner, None);
    }
    assert_eq!(db.get(&future).await?.unwrap().status, PostStatus::Pending);

    // Posted rows are never selected again
    let report = dispatcher.run_cycle(NOW + 60).await?;
    assert_eq!(report.processed, 0);
    assert_eq!(publisher.publish_call_count(), 2);

    Ok(())
}

#[tokio::test]
async fn test_failure_is_retried_after_backoff() -> Result<()> {
    let (_temp_dir, db) = create_test_db().await?;
    let id = schedule(&db, "flaky", PlatformKind::Note, NOW - 1).await?;

    let publisher = Arc::new(MockPublisher::scripted(
        PlatformKind::Note,
        vec![Some(PlatformError::Network("connection reset".into()))],
    ));
    let dispatcher = dispatcher_with(&db, &publisher);

    let report = dispatcher.run_cycle(NOW).await?;
    assert_eq!(report.retried, 1);
    assert_eq!(report.results[0].outcome, Outcome::Retrying);

    let post = db.get(&id).await?.unwrap();
    assert_eq!(post.status, PostStatus::Pending);
    assert_eq!(post.retry_count, 1);
    assert_eq!(post.last_error_kind, Some(ErrorKind::Network));
    assert_eq!(post.last_attempt_at, Some(NOW));
    assert_eq!(post.retry_after, Some(NOW + 5));

    // Still backing off
    let report = dispatcher.run_cycle(NOW + 2).await?;
    assert_eq!(report.processed, 0);
    assert_eq!(publisher.publish_call_count(), 1);

    let report = dispatcher.run_cycle(NOW + 10).await?;
    assert_eq!(report.posted, 1);
    let post = db.get(&id).await?.unwrap();
    assert_eq!(post.status, PostStatus::Posted);
    assert_eq!(post.last_error, None);

    Ok(())
}

#[tokio::test]
async fn test_retry_cap_marks_failed() -> Result<()> {
    let (_temp_dir, db) = create_test_db().await?;
    let id = schedule(&db, "doomed", PlatformKind::Wordpress, NOW - 1).await?;

    let publisher = Arc::new(MockPublisher::failing(
        PlatformKind::Wordpress,
        PlatformError::Network("HTTP 503".into()),
    ));
    let dispatcher = dispatcher_with(&db, &publisher);

    // max_retries defaults to 3; backoff is 5s, 10s
    dispatcher.run_cycle(NOW).await?;
    dispatcher.run_cycle(NOW + 6).await?;
    let report = dispatcher.run_cycle(NOW + 20).await?;

    assert_eq!(report.failed, 1);
    assert_eq!(publisher.publish_call_count(), 3);

    let post = db.get(&id).await?.unwrap();
    assert_eq!(post.status, PostStatus::Failed);
    assert_eq!(post.retry_count, 3);
    assert!(post.last_error.unwrap().contains("503"));

    let report = dispatcher.run_cycle(NOW + 3600).await?;
    assert_eq!(report.processed, 0);
    assert_eq!(publisher.publish_call_count(), 3);

    Ok(())
}

#[tokio::test]
async fn test_over_limit_content_fails_without_publishing() -> Result<()> {
    let (_temp_dir, db) = create_test_db().await?;

    // Bypass creation-time validation to simulate a row written by another tool
    let post = NewPost::new("a".repeat(281), PlatformKind::X)
        .scheduled_for(NOW - 1)
        .into_post(NOW - 10);
    db.insert(&post).await?;

    let publisher = Arc::new(MockPublisher::success(PlatformKind::X));
    let dispatcher = dispatcher_with(&db, &publisher);

    let report = dispatcher.run_cycle(NOW).await?;
    assert_eq!(report.failed, 1);
    assert_eq!(publisher.publish_call_count(), 0);

    let stored = db.get(&post.id).await?.unwrap();
    assert_eq!(stored.status, PostStatus::Failed);
    assert_eq!(stored.retry_count, 1);
    assert_eq!(stored.last_error_kind, Some(ErrorKind::Validation));
    assert!(stored.last_error.unwrap().contains("280"));

    Ok(())
}

#[tokio::test]
async fn test_rate_limit_uses_longer_backoff() -> Result<()> {
    let (_temp_dir, db) = create_test_db().await?;
    let id = schedule(&db, "busy", PlatformKind::X, NOW - 1).await?;

    let publisher = Arc::new(MockPublisher::failing(
        PlatformKind::X,
        PlatformError::RateLimit("HTTP 429".into()),
    ));
    let dispatcher = dispatcher_with(&db, &publisher);

    dispatcher.run_cycle(NOW).await?;
    let post = db.get(&id).await?.unwrap();
    assert_eq!(post.last_error_kind, Some(ErrorKind::RateLimit));
    assert_eq!(post.retry_after, Some(NOW + 900));

    Ok(())
}

#[tokio::test]
async fn test_concurrent_cycles_never_double_publish() -> Result<()> {
    let (_temp_dir, db) = create_test_db().await?;
    for i in 0..8 {
        schedule(&db, &format!("post {}", i), PlatformKind::X, NOW - 100 + i).await?;
    }

    let a = Arc::new(MockPublisher::with_delay(PlatformKind::X, Duration::from_millis(5)));
    let b = Arc::new(MockPublisher::with_delay(PlatformKind::X, Duration::from_millis(5)));
    let first = dispatcher_with(&db, &a);
    let second = dispatcher_with(&db, &b);

    let (left, right) = tokio::join!(first.run_cycle(NOW), second.run_cycle(NOW));
    let (left, right) = (left?, right?);

    assert_eq!(left.posted + right.posted, 8);
    assert_eq!(a.publish_call_count() + b.publish_call_count(), 8);

    let mut published = a.published_content();
    published.extend(b.published_content());
    published.sort();
    published.dedup();
    assert_eq!(published.len(), 8);

    assert_eq!(db.stats().await?.posted, 8);
    Ok(())
}

#[tokio::test]
async fn test_exhausted_quota_defers_posts() -> Result<()> {
    let (_temp_dir, db) = create_test_db().await?;
    for i in 0..3 {
        schedule(&db, &format!("post {}", i), PlatformKind::X, NOW - 10 + i).await?;
    }

    let publisher = Arc::new(MockPublisher::success(PlatformKind::X));
    let quota = QuotaPolicy::new(HashMap::from([(
        PlatformKind::X,
        QuotaConfig {
            posts: 1,
            window_secs: 86_400,
        },
    )]));
    let dispatcher = dispatcher_with(&db, &publisher).with_quota(quota);

    let report = dispatcher.run_cycle(NOW).await?;
    assert_eq!(report.posted, 1);
    assert_eq!(report.skipped, 1);
    assert!(report
        .results
        .iter()
        .any(|r| r.outcome == Outcome::Deferred));
    assert_eq!(publisher.publish_call_count(), 1);

    // Deferred posts are untouched, not counted as failures
    let stats = db.stats().await?;
    assert_eq!(stats.pending, 2);
    assert_eq!(stats.processing, 0);
    for post in db.select_due(NOW, 10).await? {
        assert_eq!(post.retry_count, 0);
    }

    Ok(())
}

#[tokio::test]
async fn test_expired_lease_counts_as_attempt() -> Result<()> {
    let (_temp_dir, db) = create_test_db().await?;
    let id = schedule(&db, "orphan", PlatformKind::Note, NOW - 600).await?;

    // A cycle that claimed the post and then died
    let claimed = db
        .claim_next_due(NOW - 500, NOW - 500, &[PlatformKind::Note], "crashed", NOW - 200)
        .await?;
    assert!(claimed.is_some());

    let publisher = Arc::new(MockPublisher::success(PlatformKind::Note));
    let dispatcher = dispatcher_with(&db, &publisher);

    let report = dispatcher.run_cycle(NOW).await?;
    assert_eq!(report.recovered, 1);
    // Recovered posts wait for the next cycle
    assert_eq!(publisher.publish_call_count(), 0);

    let post = db.get(&id).await?.unwrap();
    assert_eq!(post.status, PostStatus::Pending);
    assert_eq!(post.retry_count, 1);
    assert_eq!(post.last_error_kind, Some(ErrorKind::LeaseExpired));

    let report = dispatcher.run_cycle(NOW + 1).await?;
    assert_eq!(report.posted, 1);
    Ok(())
}

#[tokio::test]
async fn test_unconfigured_platform_is_skipped() -> Result<()> {
    let (_temp_dir, db) = create_test_db().await?;
    let note = schedule(&db, "for note", PlatformKind::Note, NOW - 5).await?;
    schedule(&db, "for x", PlatformKind::X, NOW - 5).await?;

    let publisher = Arc::new(MockPublisher::success(PlatformKind::X));
    let dispatcher = dispatcher_with(&db, &publisher);

    let report = dispatcher.run_cycle(NOW).await?;
    assert_eq!(report.posted, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].contains("NOTE_EMAIL"), "{}", report.errors[0]);

    let skipped = report
        .results
        .iter()
        .find(|r| r.outcome == Outcome::Skipped)
        .unwrap();
    assert_eq!(skipped.platform, PlatformKind::Note);
    assert_eq!(skipped.post_id, None);

    // The note post is left exactly as it was
    let post = db.get(&note).await?.unwrap();
    assert_eq!(post.status, PostStatus::Pending);
    assert_eq!(post.retry_count, 0);
    assert_eq!(post.last_attempt_at, None);

    Ok(())
}

#[tokio::test]
async fn test_hello_post_records_platform_id() -> Result<()> {
    let (_temp_dir, db) = create_test_db().await?;
    let id = schedule(&db, "hello", PlatformKind::X, NOW - 1).await?;

    let publisher = Arc::new(MockPublisher::with_post_id(PlatformKind::X, "123"));
    let dispatcher = dispatcher_with(&db, &publisher);

    let report = dispatcher.run_cycle(NOW).await?;
    assert_eq!(report.processed, 1);
    assert_eq!(report.posted, 1);
    assert_eq!(report.results[0].platform_post_id.as_deref(), Some("123"));

    let post = db.get(&id).await?.unwrap();
    assert_eq!(post.status, PostStatus::Posted);
    assert_eq!(post.platform_post_id.as_deref(), Some("123"));

    Ok(())
}

#[tokio::test]
async fn test_post_on_last_retry_fails_after_one_cycle() -> Result<()> {
    let (_temp_dir, db) = create_test_db().await?;

    let mut post = NewPost::new("third time", PlatformKind::Note)
        .scheduled_for(NOW - 1)
        .into_post(NOW - 600);
    post.retry_count = 2;
    db.insert(&post).await?;

    let publisher = Arc::new(MockPublisher::failing(
        PlatformKind::Note,
        PlatformError::Authentication("HTTP 401".into()),
    ));
    let dispatcher = dispatcher_with(&db, &publisher);

    let report = dispatcher.run_cycle(NOW).await?;
    assert_eq!(report.failed, 1);
    assert_eq!(report.retried, 0);
    assert_eq!(report.results[0].outcome, Outcome::Failed);

    let stored = db.get(&post.id).await?.unwrap();
    assert_eq!(stored.status, PostStatus::Failed);
    assert_eq!(stored.retry_count, 3);
    assert_eq!(stored.last_error_kind, Some(ErrorKind::Authentication));

    Ok(())
}

#[tokio::test]
async fn test_long_cycle_keeps_leases_for_late_claims() -> Result<()> {
    let (_temp_dir, db) = create_test_db().await?;
    let start = chrono::Utc::now().timestamp();
    for i in 0..3 {
        schedule(&db, &format!("slow {}", i), PlatformKind::X, start - 60 + i).await?;
    }

    // The cycle needs 4.5s while each lease lasts 3s
    let publisher = Arc::new(MockPublisher::with_delay(
        PlatformKind::X,
        Duration::from_millis(1500),
    ));
    let settings = DispatchSettings {
        lease_secs: 3,
        ..settings()
    };
    let long = Dispatcher::new(
        db.clone(),
        PublisherSet::new().with(publisher.clone()),
        settings.clone(),
    );
    let overlapping = Dispatcher::new(
        db.clone(),
        PublisherSet::new().with(publisher.clone()),
        settings,
    );

    let (long_report, overlap_report) = tokio::join!(long.run_cycle(start), async {
        sleep(Duration::from_secs(4)).await;
        overlapping.run_cycle(chrono::Utc::now().timestamp()).await
    });
    let (long_report, overlap_report) = (long_report?, overlap_report?);

    assert_eq!(long_report.posted, 3);
    assert!(long_report.errors.is_empty(), "{:?}", long_report.errors);
    assert_eq!(overlap_report.recovered, 0);
    assert_eq!(overlap_report.processed, 0);

    // A later cycle has nothing left to publish
    let report = overlapping
        .run_cycle(chrono::Utc::now().timestamp() + 1)
        .await?;
    assert_eq!(report.processed, 0);
    assert_eq!(publisher.publish_call_count(), 3);

    for post in db.list(&Default::default()).await? {
        assert_eq!(post.status, PostStatus::Posted);
        assert_eq!(post.retry_count, 0);
    }
    Ok(())
}

#[tokio::test]
async fn test_lost_lease_is_reported_not_posted() -> Result<()> {
    let (_temp_dir, db) = create_test_db().await?;
    let start = chrono::Utc::now().timestamp();
    let id = schedule(&db, "too slow", PlatformKind::Note, start - 60).await?;

    let publisher = Arc::new(MockPublisher::with_delay(
        PlatformKind::Note,
        Duration::from_millis(2500),
    ));
    let settings = DispatchSettings {
        lease_secs: 1,
        ..settings()
    };
    let slow = Dispatcher::new(
        db.clone(),
        PublisherSet::new().with(publisher.clone()),
        settings.clone(),
    );
    let recovering = Dispatcher::new(
        db.clone(),
        PublisherSet::new().with(publisher.clone()),
        settings,
    );

    let (slow_report, recovery_report) = tokio::join!(slow.run_cycle(start), async {
        sleep(Duration::from_millis(2200)).await;
        recovering.run_cycle(chrono::Utc::now().timestamp()).await
    });
    let (slow_report, recovery_report) = (slow_report?, recovery_report?);

    assert_eq!(recovery_report.recovered, 1);
    assert_eq!(slow_report.processed, 1);
    assert_eq!(slow_report.posted, 0);
    assert_eq!(slow_report.results[0].outcome, Outcome::LeaseLost);
    assert!(slow_report.errors[0].contains("lease"), "{:?}", slow_report.errors);
    assert_eq!(publisher.publish_call_count(), 1);

    // The recovery owns the row now
    let post = db.get(&id).await?.unwrap();
    assert_eq!(post.status, PostStatus::Pending);
    assert_eq!(post.retry_count, 1);
    assert_eq!(post.last_error_kind, Some(ErrorKind::LeaseExpired));
    assert_eq!(post.platform_post_id, None);

    Ok(())
}

#[tokio::test]
async fn test_misconfigured_platform_does_not_stop_others() -> Result<()> {
    let (_temp_dir, db) = create_test_db().await?;
    let blog = schedule(&db, "for the blog", PlatformKind::Wordpress, NOW - 5).await?;
    schedule(&db, "for x", PlatformKind::X, NOW - 5).await?;

    let mut config = Config::default();
    config.wordpress.site_url = Some("blog.example.com".to_string());
    config.wordpress.username = Some("admin".to_string());
    config.wordpress.app_password = Some("abcd efgh".to_string());

    let publisher = Arc::new(MockPublisher::success(PlatformKind::X));
    let publishers = PublisherSet::from_config(&config)?.with(publisher.clone());
    let dispatcher = Dispatcher::new(db.clone(), publishers, settings());

    let report = dispatcher.run_cycle(NOW).await?;
    assert_eq!(report.posted, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(publisher.published_content(), vec!["for x"]);

    let skipped = report
        .results
        .iter()
        .find(|r| r.outcome == Outcome::Skipped)
        .unwrap();
    assert_eq!(skipped.platform, PlatformKind::Wordpress);
    let message = skipped.error.as_deref().unwrap_or_default();
    assert!(message.contains("WORDPRESS_URL"), "{}", message);

    assert_eq!(db.get(&blog).await?.unwrap().status, PostStatus::Pending);
    Ok(())
}
