//! Core types for Crosspost

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{CrosspostError, ErrorKind, Result};

/// Platforms a post can be dispatched to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    X,
    Note,
    Wordpress,
}

impl PlatformKind {
    pub const ALL: [PlatformKind; 3] = [PlatformKind::X, PlatformKind::Note, PlatformKind::Wordpress];

    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformKind::X => "x",
            PlatformKind::Note => "note",
            PlatformKind::Wordpress => "wordpress",
        }
    }

    /// Hard character limit enforced before any network call
    pub fn character_limit(&self) -> Option<usize> {
        match self {
            PlatformKind::X => Some(280),
            PlatformKind::Note | PlatformKind::Wordpress => None,
        }
    }
}

impl FromStr for PlatformKind {
    type Err = CrosspostError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "x" | "twitter" => Ok(PlatformKind::X),
            "note" => Ok(PlatformKind::Note),
            "wordpress" | "wp" => Ok(PlatformKind::Wordpress),
            other => Err(CrosspostError::InvalidInput(format!(
                "Unknown platform '{}'. Valid options: x, note, wordpress",
                other
            ))),
        }
    }
}

impl std::fmt::Display for PlatformKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostStatus {
    Draft,
    Pending,
    Processing,
    Posted,
    Failed,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Draft => "draft",
            PostStatus::Pending => "pending",
            PostStatus::Processing => "processing",
            PostStatus::Posted => "posted",
            PostStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PostStatus::Posted | PostStatus::Failed)
    }
}

impl FromStr for PostStatus {
    type Err = CrosspostError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "draft" => Ok(PostStatus::Draft),
            "pending" => Ok(PostStatus::Pending),
            "processing" => Ok(PostStatus::Processing),
            "posted" => Ok(PostStatus::Posted),
            "failed" => Ok(PostStatus::Failed),
            other => Err(CrosspostError::InvalidInput(format!(
                "Unknown status '{}'. Valid options: draft, pending, processing, posted, failed",
                other
            ))),
        }
    }
}

impl std::fmt::Display for PostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a post came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Gpts,
    #[default]
    Manual,
    Offline,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Gpts => "gpts",
            Source::Manual => "manual",
            Source::Offline => "offline",
        }
    }
}

impl FromStr for Source {
    type Err = CrosspostError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "gpts" => Ok(Source::Gpts),
            "manual" => Ok(Source::Manual),
            "offline" => Ok(Source::Offline),
            other => Err(CrosspostError::InvalidInput(format!(
                "Unknown source '{}'. Valid options: gpts, manual, offline",
                other
            ))),
        }
    }
}

/// A post in the store, with its dispatch bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledPost {
    pub id: String,
    pub content: String,
    pub platform: PlatformKind,
    pub status: PostStatus,
    pub scheduled_for: Option<i64>,
    pub source: Source,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub last_error_kind: Option<ErrorKind>,
    pub last_attempt_at: Option<i64>,
    pub retry_after: Option<i64>,
    pub platform_post_id: Option<String>,
    pub post_url: Option<String>,
    pub posted_at: Option<i64>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<i64>,
    /// Platform options such as a WordPress title; never bookkeeping
    pub metadata: Map<String, Value>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ScheduledPost {
    /// Look up a string option from the metadata bag
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

/// Request to create a post
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPost {
    pub content: String,
    pub platform: PlatformKind,
    #[serde(default)]
    pub scheduled_for: Option<i64>,
    #[serde(default)]
    pub source: Source,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl NewPost {
    pub fn new(content: impl Into<String>, platform: PlatformKind) -> Self {
        Self {
            content: content.into(),
            platform,
            scheduled_for: None,
            source: Source::Manual,
            metadata: Map::new(),
        }
    }

    pub fn scheduled_for(mut self, timestamp: i64) -> Self {
        self.scheduled_for = Some(timestamp);
        self
    }

    pub fn source(mut self, source: Source) -> Self {
        self.source = source;
        self
    }

    /// Reject content that could never be published
    pub fn validate(&self) -> Result<()> {
        if self.content.trim().is_empty() {
            return Err(CrosspostError::InvalidInput(
                "Content cannot be empty".to_string(),
            ));
        }

        if let Some(limit) = self.platform.character_limit() {
            let count = self.content.chars().count();
            if count > limit {
                return Err(CrosspostError::InvalidInput(format!(
                    "Content exceeds the {} character limit for {} ({} characters)",
                    limit, self.platform, count
                )));
            }
        }

        Ok(())
    }

    /// Build the stored row; unscheduled posts start as drafts
    pub fn into_post(self, now: i64) -> ScheduledPost {
        let status = if self.scheduled_for.is_some() {
            PostStatus::Pending
        } else {
            PostStatus::Draft
        };

        ScheduledPost {
            id: Uuid::new_v4().to_string(),
            content: self.content,
            platform: self.platform,
            status,
            scheduled_for: self.scheduled_for,
            source: self.source,
            retry_count: 0,
            last_error: None,
            last_error_kind: None,
            last_attempt_at: None,
            retry_after: None,
            platform_post_id: None,
            post_url: None,
            posted_at: None,
            lease_owner: None,
            lease_expires_at: None,
            metadata: self.metadata,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Successful publish result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Published {
    pub platform_post_id: String,
    pub url: Option<String>,
}
