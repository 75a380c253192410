//! Per-platform post budgets
//!
//! Each platform may have a fixed-window budget (for example 17 posts a day
//! on the X free tier). A slot is reserved with one conditional upsert, so
//! two dispatch cycles racing for the last slot cannot both get it.

use std::collections::HashMap;

use crate::config::{Config, QuotaConfig};
use crate::error::{DbError, Result};
use crate::types::PlatformKind;
use crate::Database;

/// Quota limits for the configured platforms
#[derive(Debug, Clone, Default)]
pub struct QuotaPolicy {
    limits: HashMap<PlatformKind, QuotaConfig>,
}

/// Usage of one platform's current window
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct QuotaUsage {
    pub platform: PlatformKind,
    pub used: u32,
    pub limit: u32,
    pub window_start: i64,
    pub window_secs: i64,
}

impl QuotaPolicy {
    pub fn new(limits: HashMap<PlatformKind, QuotaConfig>) -> Self {
        Self { limits }
    }

    /// Build from `[quota.<platform>]` sections; unknown names are ignored
    pub fn from_config(config: &Config) -> Self {
        let limits = config
            .quota
            .iter()
            .filter_map(|(name, quota)| match name.parse::<PlatformKind>() {
                Ok(platform) => Some((platform, *quota)),
                Err(_) => {
                    tracing::warn!("Ignoring quota for unknown platform '{}'", name);
                    None
                }
            })
            .collect();
        Self { limits }
    }

    pub fn limit_for(&self, platform: PlatformKind) -> Option<QuotaConfig> {
        self.limits.get(&platform).copied()
    }

    pub fn longest_window_secs(&self) -> Option<i64> {
        self.limits.values().map(|quota| quota.window_secs).max()
    }

    /// Reserve one post slot in the current window.
    ///
    /// Returns `Ok(false)` when the window is exhausted. Platforms without a
    /// configured quota always succeed without touching the store.
    pub async fn try_reserve(&self, db: &Database, platform: PlatformKind, now: i64) -> Result<bool> {
        let Some(quota) = self.limit_for(platform) else {
            return Ok(true);
        };
        if quota.posts == 0 {
            return Ok(false);
        }

        let window_start = window_start(now, quota.window_secs);
        let row = sqlx::query_as::<_, (i64,)>(
            r#"
            INSERT INTO quota_windows (platform, window_start, post_count)
            VALUES (?, ?, 1)
            ON CONFLICT(platform, window_start)
            DO UPDATE SET post_count = post_count + 1
            WHERE post_count < ?
            RETURNING post_count
            "#,
        )
        .bind(platform.as_str())
        .bind(window_start)
        .bind(i64::from(quota.posts))
        .fetch_optional(db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        match row {
            Some((count,)) => {
                tracing::debug!(
                    platform = %platform,
                    used = count,
                    limit = quota.posts,
                    "Reserved quota slot"
                );
                Ok(true)
            }
            None => {
                tracing::info!(
                    platform = %platform,
                    limit = quota.posts,
                    "Quota exhausted for current window"
                );
                Ok(false)
            }
        }
    }

    /// Current usage for every platform with a quota
    pub async fn usage(&self, db: &Database, now: i64) -> Result<Vec<QuotaUsage>> {
        let mut usage = Vec::new();
        let mut platforms: Vec<_> = self.limits.keys().copied().collect();
        platforms.sort();

        for platform in platforms {
            let quota = self.limits[&platform];
            let window_start = window_start(now, quota.window_secs);
            let row = sqlx::query_as::<_, (i64,)>(
                "SELECT post_count FROM quota_windows WHERE platform = ? AND window_start = ?",
            )
            .bind(platform.as_str())
            .bind(window_start)
            .fetch_optional(db.pool())
            .await
            .map_err(DbError::SqlxError)?;

            usage.push(QuotaUsage {
                platform,
                used: row.map(|r| r.0.max(0) as u32).unwrap_or(0),
                limit: quota.posts,
                window_start,
                window_secs: quota.window_secs,
            });
        }
        Ok(usage)
    }

    /// Drop windows that started before `cutoff`
    pub async fn cleanup_old_windows(&self, db: &Database, cutoff: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM quota_windows WHERE window_start < ?")
            .bind(cutoff)
            .execute(db.pool())
            .await
            .map_err(DbError::SqlxError)?;
        Ok(result.rows_affected())
    }
}

fn window_start(timestamp: i64, window_secs: i64) -> i64 {
    let window = window_secs.max(1);
    timestamp.div_euclid(window) * window
}
