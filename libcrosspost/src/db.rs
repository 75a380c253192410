//! Post store backed by SQLite
//!
//! Every state change a dispatch cycle makes is a single conditional
//! statement, so overlapping cycles in different processes see a consistent
//! queue without holding transactions open across network calls.

use serde::Serialize;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::path::Path;
use std::time::Duration;

use crate::error::{CrosspostError, DbError, ErrorKind, Result};
use crate::types::{NewPost, PlatformKind, PostStatus, Published, ScheduledPost, Source};

const POST_COLUMNS: &str = "id, content, platform, status, scheduled_for, source, retry_count, \
     last_error, last_error_kind, last_attempt_at, retry_after, platform_post_id, post_url, \
     posted_at, lease_owner, lease_expires_at, metadata, created_at, updated_at";

/// Filter for listing posts
#[derive(Debug, Clone, Default)]
pub struct PostFilter {
    pub status: Option<PostStatus>,
    pub platform: Option<PlatformKind>,
    pub limit: Option<usize>,
}

/// Optional bookkeeping changes applied together with a status change.
///
/// `None` leaves a column untouched; `Some(None)` clears it.
#[derive(Debug, Clone, Default)]
pub struct StatusPatch {
    pub retry_count: Option<u32>,
    pub last_error: Option<Option<String>>,
    pub last_error_kind: Option<Option<ErrorKind>>,
    pub retry_after: Option<Option<i64>>,
    pub scheduled_for: Option<Option<i64>>,
}

/// Post counts per status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub draft: i64,
    pub pending: i64,
    pub processing: i64,
    pub posted: i64,
    pub failed: i64,
}

impl QueueStats {
    pub fn total(&self) -> i64 {
        self.draft + self.pending + self.processing + self.posted + self.failed
    }
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the database file and run migrations
    pub async fn new(db_path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(DbError::SqlxError)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        tracing::debug!("Opened post store at {}", expanded_path);
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a fully-formed post, returning its ID
    pub async fn insert(&self, post: &ScheduledPost) -> Result<String> {
        let metadata = serde_json::to_string(&post.metadata)
            .map_err(|e| DbError::Corrupt(format!("metadata is not serializable: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO posts (id, content, platform, status, scheduled_for, source, retry_count,
                last_error, last_error_kind, last_attempt_at, retry_after, platform_post_id,
                post_url, posted_at, lease_owner, lease_expires_at, metadata, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&post.id)
        .bind(&post.content)
        .bind(post.platform.as_str())
        .bind(post.status.as_str())
        .bind(post.scheduled_for)
        .bind(post.source.as_str())
        .bind(i64::from(post.retry_count))
        .bind(&post.last_error)
        .bind(post.last_error_kind.map(|k| k.as_str()))
        .bind(post.last_attempt_at)
        .bind(post.retry_after)
        .bind(&post.platform_post_id)
        .bind(&post.post_url)
        .bind(post.posted_at)
        .bind(&post.lease_owner)
        .bind(post.lease_expires_at)
        .bind(metadata)
        .bind(post.created_at)
        .bind(post.updated_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(post.id.clone())
    }

    /// Validate a creation request and store it
    pub async fn create(&self, request: NewPost, now: i64) -> Result<ScheduledPost> {
        request.validate()?;
        let post = request.into_post(now);
        self.insert(&post).await?;
        tracing::info!(
            post_id = %post.id,
            platform = %post.platform,
            status = %post.status,
            "Created post"
        );
        Ok(post)
    }

    pub async fn get(&self, id: &str) -> Result<Option<ScheduledPost>> {
        let row = sqlx::query(&format!("SELECT {} FROM posts WHERE id = ?", POST_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        row.as_ref().map(post_from_row).transpose()
    }

    /// Read-only view of what is due, oldest schedule first
    pub async fn select_due(&self, now: i64, limit: usize) -> Result<Vec<ScheduledPost>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM posts
            WHERE status = 'pending'
              AND scheduled_for IS NOT NULL AND scheduled_for <= ?
              AND (retry_after IS NULL OR retry_after <= ?)
            ORDER BY scheduled_for ASC, created_at ASC
            LIMIT ?
            "#,
            POST_COLUMNS
        ))
        .bind(now)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(post_from_row).collect()
    }

    /// Atomically move the oldest due post to `processing`.
    ///
    /// Selection and transition happen in one statement, and the outer
    /// `status = 'pending'` guard means a row can be handed to only one
    /// caller. Posts whose last attempt happened at or after
    /// `attempted_before` are skipped so a cycle never retries its own
    /// failures.
    pub async fn claim_next_due(
        &self,
        now: i64,
        attempted_before: i64,
        platforms: &[PlatformKind],
        owner: &str,
        lease_until: i64,
    ) -> Result<Option<ScheduledPost>> {
        if platforms.is_empty() {
            return Ok(None);
        }

        let mut query = QueryBuilder::<Sqlite>::new(
            "UPDATE posts SET status = 'processing', lease_owner = ",
        );
        query
            .push_bind(owner)
            .push(", lease_expires_at = ")
            .push_bind(lease_until)
            .push(", updated_at = ")
            .push_bind(now)
            .push(
                " WHERE id = (SELECT id FROM posts WHERE status = 'pending' \
                 AND scheduled_for IS NOT NULL AND scheduled_for <= ",
            )
            .push_bind(now)
            .push(" AND (retry_after IS NULL OR retry_after <= ")
            .push_bind(now)
            .push(") AND (last_attempt_at IS NULL OR last_attempt_at < ")
            .push_bind(attempted_before)
            .push(") AND platform IN (");

        let mut separated = query.separated(", ");
        for platform in platforms {
            separated.push_bind(platform.as_str());
        }
        separated.push_unseparated(")");

        query.push(" ORDER BY scheduled_for ASC, created_at ASC LIMIT 1) AND status = 'pending' RETURNING ");
        query.push(POST_COLUMNS);

        let row = query
            .build()
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        row.as_ref().map(post_from_row).transpose()
    }

    /// Set a status together with optional bookkeeping changes.
    ///
    /// Any status other than `processing` drops the lease.
    pub async fn update_status(
        &self,
        id: &str,
        status: PostStatus,
        patch: &StatusPatch,
        now: i64,
    ) -> Result<bool> {
        let mut query = QueryBuilder::<Sqlite>::new("UPDATE posts SET status = ");
        query.push_bind(status.as_str());
        query.push(", updated_at = ").push_bind(now);

        if status != PostStatus::Processing {
            query.push(", lease_owner = NULL, lease_expires_at = NULL");
        }
        if let Some(retry_count) = patch.retry_count {
            query.push(", retry_count = ").push_bind(i64::from(retry_count));
        }
        if let Some(last_error) = &patch.last_error {
            query.push(", last_error = ").push_bind(last_error.clone());
        }
        if let Some(kind) = patch.last_error_kind {
            query
                .push(", last_error_kind = ")
                .push_bind(kind.map(|k| k.as_str()));
        }
        if let Some(retry_after) = patch.retry_after {
            query.push(", retry_after = ").push_bind(retry_after);
        }
        if let Some(scheduled_for) = patch.scheduled_for {
            query.push(", scheduled_for = ").push_bind(scheduled_for);
        }

        query.push(" WHERE id = ").push_bind(id);

        let result = query
            .build()
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Record a successful publish. Returns false if the lease was lost.
    pub async fn mark_posted(
        &self,
        id: &str,
        owner: &str,
        published: &Published,
        now: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE posts
            SET status = 'posted', platform_post_id = ?, post_url = ?, posted_at = ?,
                last_attempt_at = ?, last_error = NULL, last_error_kind = NULL,
                retry_after = NULL, lease_owner = NULL, lease_expires_at = NULL, updated_at = ?
            WHERE id = ? AND status = 'processing' AND lease_owner = ?
            "#,
        )
        .bind(&published.platform_post_id)
        .bind(&published.url)
        .bind(now)
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Return a failed attempt to the queue with `retry_count + 1`
    pub async fn mark_retry(
        &self,
        id: &str,
        owner: &str,
        kind: ErrorKind,
        message: &str,
        retry_after: i64,
        now: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE posts
            SET status = 'pending', retry_count = retry_count + 1, last_error = ?,
                last_error_kind = ?, last_attempt_at = ?, retry_after = ?,
                lease_owner = NULL, lease_expires_at = NULL, updated_at = ?
            WHERE id = ? AND status = 'processing' AND lease_owner = ?
            "#,
        )
        .bind(message)
        .bind(kind.as_str())
        .bind(now)
        .bind(retry_after)
        .bind(now)
        .bind(id)
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Give up on a post; the attempt still counts towards `retry_count`
    pub async fn mark_failed(
        &self,
        id: &str,
        owner: &str,
        kind: ErrorKind,
        message: &str,
        now: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE posts
            SET status = 'failed', retry_count = retry_count + 1, last_error = ?,
                last_error_kind = ?, last_attempt_at = ?, retry_after = NULL,
                lease_owner = NULL, lease_expires_at = NULL, updated_at = ?
            WHERE id = ? AND status = 'processing' AND lease_owner = ?
            "#,
        )
        .bind(message)
        .bind(kind.as_str())
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Hand a claimed post back untouched (no attempt was made)
    pub async fn release_claim(&self, id: &str, owner: &str, now: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE posts
            SET status = 'pending', lease_owner = NULL, lease_expires_at = NULL, updated_at = ?
            WHERE id = ? AND status = 'processing' AND lease_owner = ?
            "#,
        )
        .bind(now)
        .bind(id)
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Treat every expired `processing` lease as a failed attempt.
    ///
    /// The publish outcome of such a post is unknown, so it is counted like
    /// any other failure: back to `pending`, or `failed` once the retry cap
    /// is reached. Returns the recovered post IDs.
    pub async fn recover_expired_leases(&self, now: i64, max_retries: u32) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            UPDATE posts
            SET status = CASE WHEN retry_count + 1 >= ? THEN 'failed' ELSE 'pending' END,
                retry_count = retry_count + 1,
                last_error = 'lease expired before the publish outcome was recorded',
                last_error_kind = 'lease_expired',
                last_attempt_at = ?,
                lease_owner = NULL, lease_expires_at = NULL, updated_at = ?
            WHERE status = 'processing' AND (lease_expires_at IS NULL OR lease_expires_at <= ?)
            RETURNING id
            "#,
        )
        .bind(i64::from(max_retries))
        .bind(now)
        .bind(now)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        let ids: Vec<String> = rows.iter().map(|r| r.get("id")).collect();
        if !ids.is_empty() {
            tracing::warn!(count = ids.len(), "Recovered expired dispatch leases");
        }
        Ok(ids)
    }

    /// Delete a post unless a dispatcher is publishing it right now
    pub async fn delete(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM posts WHERE id = ? AND status != 'processing'")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        if result.rows_affected() == 1 {
            return Ok(());
        }
        match self.get(id).await? {
            Some(post) => Err(CrosspostError::Conflict(format!(
                "post {} is {} and cannot be deleted right now",
                id, post.status
            ))),
            None => Err(CrosspostError::NotFound(format!("post {}", id))),
        }
    }

    /// Put a failed post back in the queue with a fresh retry budget
    pub async fn requeue_failed(
        &self,
        id: &str,
        scheduled_for: i64,
        now: i64,
    ) -> Result<ScheduledPost> {
        let result = sqlx::query(
            r#"
            UPDATE posts
            SET status = 'pending', retry_count = 0, last_error = NULL,
                last_error_kind = NULL, retry_after = NULL, scheduled_for = ?,
                lease_owner = NULL, lease_expires_at = NULL, updated_at = ?
            WHERE id = ? AND status = 'failed'
            "#,
        )
        .bind(scheduled_for)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        let post = self
            .get(id)
            .await?
            .ok_or_else(|| CrosspostError::NotFound(format!("post {}", id)))?;

        if result.rows_affected() == 0 {
            return Err(CrosspostError::InvalidInput(format!(
                "post {} is {}; only failed posts can be retried",
                id, post.status
            )));
        }

        Ok(post)
    }

    /// List posts, newest first
    pub async fn list(&self, filter: &PostFilter) -> Result<Vec<ScheduledPost>> {
        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM posts WHERE 1 = 1",
            POST_COLUMNS
        ));

        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(platform) = filter.platform {
            query.push(" AND platform = ").push_bind(platform.as_str());
        }

        query.push(" ORDER BY created_at DESC, id ASC LIMIT ");
        query.push_bind(filter.limit.unwrap_or(50) as i64);

        let rows = query
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter().map(post_from_row).collect()
    }

    /// Set or clear the schedule of a draft or pending post.
    ///
    /// A schedule makes the post `pending`; clearing it makes it a `draft`.
    pub async fn reschedule(
        &self,
        id: &str,
        scheduled_for: Option<i64>,
        now: i64,
    ) -> Result<ScheduledPost> {
        let status = if scheduled_for.is_some() {
            PostStatus::Pending
        } else {
            PostStatus::Draft
        };

        let result = sqlx::query(
            r#"
            UPDATE posts SET status = ?, scheduled_for = ?, retry_after = NULL, updated_at = ?
            WHERE id = ? AND status IN ('draft', 'pending')
            "#,
        )
        .bind(status.as_str())
        .bind(scheduled_for)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        let post = self
            .get(id)
            .await?
            .ok_or_else(|| CrosspostError::NotFound(format!("post {}", id)))?;

        if result.rows_affected() == 0 {
            return Err(CrosspostError::InvalidInput(format!(
                "post {} is {} and cannot be rescheduled",
                id, post.status
            )));
        }

        Ok(post)
    }

    /// Due post counts grouped by platform
    pub async fn count_due_by_platform(&self, now: i64) -> Result<Vec<(PlatformKind, i64)>> {
        let rows = sqlx::query(
            r#"
            SELECT platform, COUNT(*) AS due
            FROM posts
            WHERE status = 'pending'
              AND scheduled_for IS NOT NULL AND scheduled_for <= ?
              AND (retry_after IS NULL OR retry_after <= ?)
            GROUP BY platform
            ORDER BY platform
            "#,
        )
        .bind(now)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter()
            .map(|row| -> Result<(PlatformKind, i64)> {
                let platform: String = row.get("platform");
                let platform = platform
                    .parse::<PlatformKind>()
                    .map_err(|_| DbError::Corrupt(format!("unknown platform '{}'", platform)))?;
                Ok((platform, row.get::<i64, _>("due")))
            })
            .collect()
    }

    /// Latest schedule among a platform's pending posts
    pub async fn latest_scheduled_for(&self, platform: PlatformKind) -> Result<Option<i64>> {
        let latest: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(scheduled_for) FROM posts WHERE platform = ? AND status = 'pending'",
        )
        .bind(platform.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(latest)
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM posts GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        let mut stats = QueueStats::default();
        for row in &rows {
            let count: i64 = row.get("n");
            match row.get::<String, _>("status").as_str() {
                "draft" => stats.draft = count,
                "pending" => stats.pending = count,
                "processing" => stats.processing = count,
                "posted" => stats.posted = count,
                "failed" => stats.failed = count,
                other => tracing::warn!("Ignoring unknown status '{}' in stats", other),
            }
        }
        Ok(stats)
    }
}

fn post_from_row(row: &SqliteRow) -> Result<ScheduledPost> {
    let corrupt = |field: &str, value: &str| {
        CrosspostError::from(DbError::Corrupt(format!("invalid {} '{}'", field, value)))
    };

    let platform: String = row.get("platform");
    let status: String = row.get("status");
    let source: String = row.get("source");
    let retry_count: i64 = row.get("retry_count");
    let last_error_kind: Option<String> = row.get("last_error_kind");
    let metadata: String = row.get("metadata");

    let last_error_kind = match last_error_kind {
        Some(kind) => Some(ErrorKind::parse(&kind).ok_or_else(|| corrupt("error kind", &kind))?),
        None => None,
    };

    Ok(ScheduledPost {
        id: row.get("id"),
        content: row.get("content"),
        platform: platform
            .parse::<PlatformKind>()
            .map_err(|_| corrupt("platform", &platform))?,
        status: status.parse::<PostStatus>().map_err(|_| corrupt("status", &status))?,
        scheduled_for: row.get("scheduled_for"),
        source: source
            .parse::<Source>()
            .map_err(|_| corrupt("source", &source))?,
        retry_count: u32::try_from(retry_count)
            .map_err(|_| corrupt("retry count", &retry_count.to_string()))?,
        last_error: row.get("last_error"),
        last_error_kind,
        last_attempt_at: row.get("last_attempt_at"),
        retry_after: row.get("retry_after"),
        platform_post_id: row.get("platform_post_id"),
        post_url: row.get("post_url"),
        posted_at: row.get("posted_at"),
        lease_owner: row.get("lease_owner"),
        lease_expires_at: row.get("lease_expires_at"),
        metadata: serde_json::from_str(&metadata).map_err(|_| corrupt("metadata", &metadata))?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
