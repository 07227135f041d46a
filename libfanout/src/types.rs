//! Core types for Fanout

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unit of content scoped to one workspace.
///
/// `published_at` is set if and only if the post is `Published`, and
/// `external_id` is only ever set on a published post. Mutation goes through
/// the lifecycle module; the store persists transitions conditionally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub workspace_id: String,
    pub content: String,
    /// Provider tag selecting the adapter (e.g. "mastodon"). A post without
    /// a platform cannot be published.
    pub platform: Option<String>,
    pub target_account_ids: Vec<String>,
    pub media_ids: Vec<String>,
    pub status: PostStatus,
    pub scheduled_at: Option<i64>,
    pub published_at: Option<i64>,
    pub external_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Post {
    /// Create a new draft post.
    pub fn new(workspace_id: String, content: String) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            workspace_id,
            content,
            platform: None,
            target_account_ids: Vec::new(),
            media_ids: Vec::new(),
            status: PostStatus::Draft,
            scheduled_at: None,
            published_at: None,
            external_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PostStatus {
    Draft,
    Scheduled,
    Published,
    Failed,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Draft => "draft",
            PostStatus::Scheduled => "scheduled",
            PostStatus::Published => "published",
            PostStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(PostStatus::Draft),
            "scheduled" => Some(PostStatus::Scheduled),
            "published" => Some(PostStatus::Published),
            "failed" => Some(PostStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for PostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A durable intent to trigger one publish attempt.
///
/// `next_run_at` is always the authoritative due time: for one-shot jobs it
/// equals `run_at` (then the backoff time on retries), for cron jobs it is
/// the computed next occurrence. At most one job per post may be `Running`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerJob {
    pub id: String,
    pub workspace_id: String,
    pub post_id: String,
    pub run_at: Option<i64>,
    pub cron: Option<String>,
    pub status: JobStatus,
    pub attempt_count: i64,
    pub last_error: Option<String>,
    pub next_run_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl SchedulerJob {
    /// Create a one-shot job due at `run_at`.
    pub fn one_shot(workspace_id: String, post_id: String, run_at: i64) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            workspace_id,
            post_id,
            run_at: Some(run_at),
            cron: None,
            status: JobStatus::Queued,
            attempt_count: 0,
            last_error: None,
            next_run_at: run_at,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a recurring job; `next_run_at` is the first occurrence.
    pub fn recurring(
        workspace_id: String,
        post_id: String,
        cron: String,
        next_run_at: i64,
    ) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            workspace_id,
            post_id,
            run_at: None,
            cron: Some(cron),
            status: JobStatus::Queued,
            attempt_count: 0,
            last_error: None,
            next_run_at,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "done" => Some(JobStatus::Done),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A workspace's credential binding to one external provider identity.
///
/// Token fields hold ciphertext produced by the vault; plaintext tokens never
/// appear outside the vault boundary. `(workspace_id, provider, external_id)`
/// is unique, so re-linking the same identity updates in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocialAccount {
    pub id: String,
    pub workspace_id: String,
    pub provider: String,
    pub external_id: String,
    pub encrypted_access_token: String,
    pub encrypted_refresh_token: Option<String>,
    pub token_expires_at: Option<i64>,
    /// Opaque provider metadata (display name, avatar, scopes) as JSON.
    pub meta: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl SocialAccount {
    pub fn new(workspace_id: String, provider: String, external_id: String) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            workspace_id,
            provider,
            external_id,
            encrypted_access_token: String::new(),
            encrypted_refresh_token: None,
            token_expires_at: None,
            meta: None,
            created_at: now,
            updated_at: now,
        }
    }
}
