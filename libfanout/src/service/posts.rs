//! Post authoring operations
//!
//! The library side of the HTTP layer's post verbs: create, reschedule,
//! publish now, unschedule, delete, and read projections. Validation
//! failures are rejected here synchronously and never reach the scheduler.

use std::sync::Arc;

use crate::error::{FanoutError, Result};
use crate::executor::{PublishExecutor, PublishOutcome};
use crate::lifecycle;
use crate::schedule;
use crate::service::events::{Event, EventBus};
use crate::store::Store;
use crate::types::{JobStatus, Post, PostStatus, SchedulerJob};

/// Input for creating a post.
#[derive(Debug, Clone, Default)]
pub struct CreatePostRequest {
    pub workspace_id: String,
    pub content: String,
    pub platform: Option<String>,
    pub target_account_ids: Vec<String>,
    pub media_ids: Vec<String>,
    /// One-shot schedule instant. Mutually exclusive with `cron`.
    pub scheduled_at: Option<i64>,
    /// Recurrence expression. Mutually exclusive with `scheduled_at`.
    pub cron: Option<String>,
}

#[derive(Clone)]
pub struct PostService {
    store: Store,
    executor: Arc<PublishExecutor>,
    events: EventBus,
}

impl PostService {
    pub fn new(store: Store, executor: Arc<PublishExecutor>, events: EventBus) -> Self {
        Self {
            store,
            executor,
            events,
        }
    }

    /// Create a post, scheduling it (and creating its job) when the request
    /// carries a schedule.
    pub async fn create_post(&self, request: CreatePostRequest) -> Result<Post> {
        if request.content.trim().is_empty() {
            return Err(FanoutError::InvalidInput(
                "content cannot be empty".to_string(),
            ));
        }
        if request.scheduled_at.is_some() && request.cron.is_some() {
            return Err(FanoutError::InvalidInput(
                "scheduled_at and cron are mutually exclusive".to_string(),
            ));
        }

        let now = chrono::Utc::now().timestamp();
        let mut post = Post::new(request.workspace_id.clone(), request.content);
        post.platform = request.platform;
        post.target_account_ids = request.target_account_ids;
        post.media_ids = request.media_ids;

        let job = match (&request.scheduled_at, &request.cron) {
            (Some(at), None) => {
                schedule::validate_scheduled_at(*at, now)?;
                lifecycle::schedule(&mut post, *at, now)?;
                Some(SchedulerJob::one_shot(
                    request.workspace_id.clone(),
                    post.id.clone(),
                    *at,
                ))
            }
            (None, Some(expr)) => {
                let normalized = schedule::normalize_cron(expr)?;
                let first = schedule::next_occurrence(&normalized, now)?.ok_or_else(|| {
                    FanoutError::InvalidInput(format!("cron expression '{}' never fires", expr))
                })?;
                lifecycle::schedule(&mut post, first, now)?;
                Some(SchedulerJob::recurring(
                    request.workspace_id.clone(),
                    post.id.clone(),
                    normalized,
                    first,
                ))
            }
            (None, None) => None,
            (Some(_), Some(_)) => unreachable!(),
        };

        match &job {
            Some(job) => self.store.create_post_with_job(&post, job).await?,
            None => self.store.create_post(&post).await?,
        }

        self.events.emit(Event::PostCreated {
            post_id: post.id.clone(),
            workspace_id: post.workspace_id.clone(),
        });
        if let Some(job) = &job {
            self.events.emit(Event::PostScheduled {
                post_id: post.id.clone(),
                job_id: job.id.clone(),
                next_run_at: job.next_run_at,
            });
        }

        Ok(post)
    }

    /// Edit content and targeting. Published posts are immutable.
    pub async fn update_content(&self, post_id: &str, content: String) -> Result<Post> {
        if content.trim().is_empty() {
            return Err(FanoutError::InvalidInput(
                "content cannot be empty".to_string(),
            ));
        }

        let mut post = self.require_post(post_id).await?;
        if post.status == PostStatus::Published {
            return Err(FanoutError::AlreadyPublished);
        }

        post.content = content;
        post.updated_at = chrono::Utc::now().timestamp();
        if !self.store.update_post_content(&post).await? {
            return Err(FanoutError::AlreadyPublished);
        }

        Ok(post)
    }

    /// Attach a new one-shot schedule to a draft, scheduled, or failed post.
    /// Any queued job for the post is replaced; a running job blocks the
    /// change until its outcome is observed.
    pub async fn reschedule(&self, post_id: &str, scheduled_at: i64) -> Result<Post> {
        let now = chrono::Utc::now().timestamp();
        schedule::validate_scheduled_at(scheduled_at, now)?;

        let mut post = self.require_post(post_id).await?;
        if post.status == PostStatus::Published {
            return Err(FanoutError::AlreadyPublished);
        }

        self.remove_pending_jobs(&post).await?;

        let expected = post.status;
        if post.status == PostStatus::Scheduled {
            // Moving an existing schedule is not a state transition.
            post.scheduled_at = Some(scheduled_at);
            post.updated_at = now;
        } else {
            lifecycle::schedule(&mut post, scheduled_at, now)?;
        }
        self.store.transition_post(&post, expected).await?;

        let job = SchedulerJob::one_shot(post.workspace_id.clone(), post.id.clone(), scheduled_at);
        self.store.create_job(&job).await?;

        self.events.emit(Event::PostScheduled {
            post_id: post.id.clone(),
            job_id: job.id,
            next_run_at: scheduled_at,
        });

        Ok(post)
    }

    /// Publish immediately, bypassing the scheduler. Pending queued jobs are
    /// removed first so the scheduler does not race the direct call.
    pub async fn publish_now(&self, post_id: &str) -> Result<PublishOutcome> {
        let post = self.require_post(post_id).await?;

        if self.store.has_running_job_for_post(&post.id).await? {
            return Err(FanoutError::PublishInFlight);
        }
        self.remove_pending_jobs(&post).await?;

        self.executor.execute(&post.id).await
    }

    /// Cancel a pending schedule. Only queued jobs can be cancelled; a
    /// running attempt must complete and have its outcome observed.
    pub async fn unschedule(&self, post_id: &str) -> Result<Post> {
        let mut post = self.require_post(post_id).await?;

        let jobs = self.store.jobs_for_post(&post.id).await?;
        if jobs.iter().any(|j| j.status == JobStatus::Running) {
            return Err(FanoutError::JobRunning);
        }

        let mut removed_job_id = None;
        for job in jobs.iter().filter(|j| j.status == JobStatus::Queued) {
            if self.store.delete_queued_job(&job.id).await? {
                removed_job_id = Some(job.id.clone());
            }
        }

        if post.status == PostStatus::Scheduled {
            let expected = post.status;
            lifecycle::unschedule(&mut post, chrono::Utc::now().timestamp())?;
            self.store.transition_post(&post, expected).await?;
        }

        if let Some(job_id) = removed_job_id {
            self.events.emit(Event::PostUnscheduled {
                post_id: post.id.clone(),
                job_id,
            });
        }

        Ok(post)
    }

    /// Delete a post and its jobs (jobs first). Blocked while an attempt is
    /// running so its outcome is never left dangling.
    pub async fn delete_post(&self, post_id: &str) -> Result<()> {
        let post = self.require_post(post_id).await?;
        if self.store.has_running_job_for_post(&post.id).await? {
            return Err(FanoutError::JobRunning);
        }
        self.store.delete_post(&post.id).await
    }

    pub async fn get_post(&self, post_id: &str) -> Result<Post> {
        self.require_post(post_id).await
    }

    pub async fn list_posts(&self, workspace_id: &str, limit: usize) -> Result<Vec<Post>> {
        self.store.list_posts(workspace_id, limit).await
    }

    pub async fn jobs(&self, post_id: &str) -> Result<Vec<SchedulerJob>> {
        self.store.jobs_for_post(post_id).await
    }

    async fn require_post(&self, post_id: &str) -> Result<Post> {
        self.store
            .get_post(post_id)
            .await?
            .ok_or_else(|| FanoutError::NotFound(post_id.to_string()))
    }

    async fn remove_pending_jobs(&self, post: &Post) -> Result<()> {
        let jobs = self.store.jobs_for_post(&post.id).await?;
        for job in jobs.iter().filter(|j| j.status == JobStatus::Queued) {
            self.store.delete_queued_job(&job.id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::mock::MockProvider;
    use crate::providers::ProviderRegistry;
    use crate::rate_limit::{RateLimiter, RateLimits};
    use crate::types::SocialAccount;
    use crate::vault::{CredentialVault, NoRefresher};
    use std::collections::HashMap;

    struct Fixture {
        store: Store,
        vault: CredentialVault,
        posts: PostService,
    }

    async fn fixture() -> Fixture {
        let store = Store::open_in_memory().await.unwrap();
        let vault = CredentialVault::new(store.clone(), "test-secret", Arc::new(NoRefresher));
        let limiter = Arc::new(RateLimiter::new(
            store.clone(),
            RateLimits::new(HashMap::new()),
        ));

        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(MockProvider::success("mock")));

        let events = EventBus::new(64);
        let executor = Arc::new(PublishExecutor::new(
            store.clone(),
            vault.clone(),
            limiter,
            Arc::new(registry),
            events.clone(),
        ));
        let posts = PostService::new(store.clone(), executor, events);

        Fixture {
            store,
            vault,
            posts,
        }
    }

    async fn link_account(fx: &Fixture) {
        let mut account = SocialAccount::new(
            "ws-1".to_string(),
            "mock".to_string(),
            "@user@mock.example".to_string(),
        );
        account.encrypted_access_token = fx.vault.seal("token").unwrap();
        fx.store.upsert_account(&account).await.unwrap();
    }

    fn draft_request(content: &str) -> CreatePostRequest {
        CreatePostRequest {
            workspace_id: "ws-1".to_string(),
            content: content.to_string(),
            platform: Some("mock".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_draft_without_schedule() {
        let fx = fixture().await;
        let post = fx.posts.create_post(draft_request("hello")).await.unwrap();

        assert_eq!(post.status, PostStatus::Draft);
        assert!(fx.posts.jobs(&post.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_scheduled_post_creates_job() {
        let fx = fixture().await;
        let at = chrono::Utc::now().timestamp() + 3600;
        let request = CreatePostRequest {
            scheduled_at: Some(at),
            ..draft_request("later")
        };

        let post = fx.posts.create_post(request).await.unwrap();
        assert_eq!(post.status, PostStatus::Scheduled);
        assert_eq!(post.scheduled_at, Some(at));

        let jobs = fx.posts.jobs(&post.id).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].next_run_at, at);
        assert_eq!(jobs[0].status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_create_cron_post_creates_recurring_job() {
        let fx = fixture().await;
        let request = CreatePostRequest {
            cron: Some("0 9 * * *".to_string()),
            ..draft_request("daily")
        };

        let post = fx.posts.create_post(request).await.unwrap();
        assert_eq!(post.status, PostStatus::Scheduled);

        let jobs = fx.posts.jobs(&post.id).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].cron.as_deref(), Some("0 0 9 * * *"));
        assert!(jobs[0].next_run_at > chrono::Utc::now().timestamp());
    }

    #[tokio::test]
    async fn test_create_rejects_empty_content() {
        let fx = fixture().await;
        let err = fx.posts.create_post(draft_request("   ")).await.unwrap_err();
        assert!(matches!(err, FanoutError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_create_rejects_past_schedule() {
        let fx = fixture().await;
        let request = CreatePostRequest {
            scheduled_at: Some(chrono::Utc::now().timestamp() - 60),
            ..draft_request("too late")
        };
        let err = fx.posts.create_post(request).await.unwrap_err();
        assert!(matches!(err, FanoutError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_create_rejects_schedule_and_cron_together() {
        let fx = fixture().await;
        let request = CreatePostRequest {
            scheduled_at: Some(chrono::Utc::now().timestamp() + 60),
            cron: Some("0 9 * * *".to_string()),
            ..draft_request("both")
        };
        let err = fx.posts.create_post(request).await.unwrap_err();
        assert!(matches!(err, FanoutError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_publish_now_from_draft() {
        let fx = fixture().await;
        link_account(&fx).await;

        let post = fx.posts.create_post(draft_request("now")).await.unwrap();
        let outcome = fx.posts.publish_now(&post.id).await.unwrap();
        assert!(matches!(outcome, PublishOutcome::Published { .. }));

        let loaded = fx.posts.get_post(&post.id).await.unwrap();
        assert_eq!(loaded.status, PostStatus::Published);
    }

    #[tokio::test]
    async fn test_publish_now_removes_queued_job() {
        let fx = fixture().await;
        link_account(&fx).await;

        let request = CreatePostRequest {
            scheduled_at: Some(chrono::Utc::now().timestamp() + 3600),
            ..draft_request("scheduled then direct")
        };
        let post = fx.posts.create_post(request).await.unwrap();

        fx.posts.publish_now(&post.id).await.unwrap();
        assert!(fx.posts.jobs(&post.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_publish_now_rejected_while_job_running() {
        let fx = fixture().await;
        link_account(&fx).await;

        let request = CreatePostRequest {
            scheduled_at: Some(chrono::Utc::now().timestamp() + 3600),
            ..draft_request("claimed")
        };
        let post = fx.posts.create_post(request).await.unwrap();
        let job = &fx.posts.jobs(&post.id).await.unwrap()[0];
        fx.store.claim_job(&job.id, 1_000).await.unwrap();

        let err = fx.posts.publish_now(&post.id).await.unwrap_err();
        assert!(matches!(err, FanoutError::PublishInFlight));
    }

    #[tokio::test]
    async fn test_unschedule_removes_job_and_reverts_to_draft() {
        let fx = fixture().await;
        let request = CreatePostRequest {
            scheduled_at: Some(chrono::Utc::now().timestamp() + 3600),
            ..draft_request("cancel me")
        };
        let post = fx.posts.create_post(request).await.unwrap();

        let post = fx.posts.unschedule(&post.id).await.unwrap();
        assert_eq!(post.status, PostStatus::Draft);
        assert_eq!(post.scheduled_at, None);
        assert!(fx.posts.jobs(&post.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unschedule_rejects_running_job() {
        let fx = fixture().await;
        let request = CreatePostRequest {
            scheduled_at: Some(chrono::Utc::now().timestamp() + 3600),
            ..draft_request("in flight")
        };
        let post = fx.posts.create_post(request).await.unwrap();
        let job = &fx.posts.jobs(&post.id).await.unwrap()[0];
        fx.store.claim_job(&job.id, 1_000).await.unwrap();

        let err = fx.posts.unschedule(&post.id).await.unwrap_err();
        assert!(matches!(err, FanoutError::JobRunning));
    }

    #[tokio::test]
    async fn test_failed_post_reschedules_under_same_id() {
        let fx = fixture().await;
        // No account linked: publish_now fails terminally.
        let post = fx.posts.create_post(draft_request("will fail")).await.unwrap();
        let outcome = fx.posts.publish_now(&post.id).await.unwrap();
        assert!(matches!(outcome, PublishOutcome::Terminal { .. }));
        assert_eq!(
            fx.posts.get_post(&post.id).await.unwrap().status,
            PostStatus::Failed
        );

        let at = chrono::Utc::now().timestamp() + 3600;
        let rescheduled = fx.posts.reschedule(&post.id, at).await.unwrap();
        assert_eq!(rescheduled.id, post.id, "same post id re-enters scheduled");
        assert_eq!(rescheduled.status, PostStatus::Scheduled);
        assert_eq!(fx.posts.jobs(&post.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reschedule_replaces_queued_job() {
        let fx = fixture().await;
        let first_at = chrono::Utc::now().timestamp() + 3600;
        let request = CreatePostRequest {
            scheduled_at: Some(first_at),
            ..draft_request("move me")
        };
        let post = fx.posts.create_post(request).await.unwrap();

        let second_at = first_at + 3600;
        fx.posts.reschedule(&post.id, second_at).await.unwrap();

        let jobs = fx.posts.jobs(&post.id).await.unwrap();
        assert_eq!(jobs.len(), 1, "queued job is replaced, not duplicated");
        assert_eq!(jobs[0].next_run_at, second_at);
    }

    #[tokio::test]
    async fn test_update_content_on_published_post_fails() {
        let fx = fixture().await;
        link_account(&fx).await;

        let post = fx.posts.create_post(draft_request("final")).await.unwrap();
        fx.posts.publish_now(&post.id).await.unwrap();

        let err = fx
            .posts
            .update_content(&post.id, "edited".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, FanoutError::AlreadyPublished));
    }

    #[tokio::test]
    async fn test_delete_post_removes_jobs() {
        let fx = fixture().await;
        let request = CreatePostRequest {
            scheduled_at: Some(chrono::Utc::now().timestamp() + 3600),
            ..draft_request("delete me")
        };
        let post = fx.posts.create_post(request).await.unwrap();

        fx.posts.delete_post(&post.id).await.unwrap();
        let err = fx.posts.get_post(&post.id).await.unwrap_err();
        assert!(matches!(err, FanoutError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_post_blocked_while_running() {
        let fx = fixture().await;
        let request = CreatePostRequest {
            scheduled_at: Some(chrono::Utc::now().timestamp() + 3600),
            ..draft_request("busy")
        };
        let post = fx.posts.create_post(request).await.unwrap();
        let job = &fx.posts.jobs(&post.id).await.unwrap()[0];
        fx.store.claim_job(&job.id, 1_000).await.unwrap();

        let err = fx.posts.delete_post(&post.id).await.unwrap_err();
        assert!(matches!(err, FanoutError::JobRunning));
    }
}
