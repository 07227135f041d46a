//! Durable store for posts, jobs, accounts, and limiter counters
//!
//! A thin handle over a SQLite pool, injected into every component at
//! construction. Fields touched by concurrent workers (job status, post
//! status, account tokens, limiter counters) are only ever written through
//! single conditional statements checked by rows-affected, never
//! read-then-write.

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;

use crate::error::{Result, StoreError};
use crate::types::{JobStatus, Post, PostStatus, SchedulerJob, SocialAccount};

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if needed) the database at `db_path` and run migrations.
    pub async fn open(db_path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(StoreError::Io)?;
        }

        // Forward slashes work for SQLite URLs on every platform; mode=rwc
        // creates the file on first open.
        let db_url = format!("sqlite://{}?mode=rwc", expanded_path.replace('\\', "/"));

        let pool = SqlitePool::connect(&db_url)
            .await
            .map_err(StoreError::Sqlx)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(StoreError::Migration)?;

        Ok(Self { pool })
    }

    /// In-memory store for tests. A single connection keeps every query on
    /// the same in-memory database.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(StoreError::Sqlx)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(StoreError::Migration)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the pool. Later operations fail with a store error, which the
    /// rate limiter uses to exercise its fail-open path in tests.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ------------------------------------------------------------------
    // Posts
    // ------------------------------------------------------------------

    pub async fn create_post(&self, post: &Post) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(StoreError::Sqlx)?;
        insert_post(&mut tx, post).await?;
        tx.commit().await.map_err(StoreError::Sqlx)?;
        Ok(())
    }

    /// Create a post and its scheduler job in one transaction, so a
    /// scheduled post never exists without its job.
    pub async fn create_post_with_job(&self, post: &Post, job: &SchedulerJob) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(StoreError::Sqlx)?;
        insert_post(&mut tx, post).await?;
        insert_job(&mut tx, job).await?;
        tx.commit().await.map_err(StoreError::Sqlx)?;
        Ok(())
    }

    pub async fn get_post(&self, post_id: &str) -> Result<Option<Post>> {
        let row = sqlx::query(
            r#"
            SELECT id, workspace_id, content, platform, target_account_ids, media_ids,
                   status, scheduled_at, published_at, external_id, created_at, updated_at
            FROM posts WHERE id = ?
            "#,
        )
        .bind(post_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Sqlx)?;

        row.map(map_post).transpose()
    }

    /// Persist a lifecycle transition, conditional on the status the caller
    /// read. Returns false when another worker got there first.
    pub async fn transition_post(&self, post: &Post, expected: PostStatus) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE posts
            SET status = ?, scheduled_at = ?, published_at = ?, external_id = ?, updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(post.status.as_str())
        .bind(post.scheduled_at)
        .bind(post.published_at)
        .bind(&post.external_id)
        .bind(post.updated_at)
        .bind(&post.id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await
        .map_err(StoreError::Sqlx)?;

        Ok(result.rows_affected() == 1)
    }

    /// Update authoring fields. Published posts are immutable, enforced here
    /// as well as in the lifecycle layer.
    pub async fn update_post_content(&self, post: &Post) -> Result<bool> {
        let targets = encode_ids(&post.target_account_ids)?;
        let media = encode_ids(&post.media_ids)?;

        let result = sqlx::query(
            r#"
            UPDATE posts
            SET content = ?, platform = ?, target_account_ids = ?, media_ids = ?, updated_at = ?
            WHERE id = ? AND status != 'published'
            "#,
        )
        .bind(&post.content)
        .bind(&post.platform)
        .bind(targets)
        .bind(media)
        .bind(post.updated_at)
        .bind(&post.id)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Sqlx)?;

        Ok(result.rows_affected() == 1)
    }

    /// Delete a post and its jobs, jobs first, in one transaction.
    pub async fn delete_post(&self, post_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(StoreError::Sqlx)?;

        sqlx::query("DELETE FROM scheduler_jobs WHERE post_id = ?")
            .bind(post_id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::Sqlx)?;

        sqlx::query("DELETE FROM posts WHERE id = ?")
            .bind(post_id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::Sqlx)?;

        tx.commit().await.map_err(StoreError::Sqlx)?;
        Ok(())
    }

    pub async fn list_posts(&self, workspace_id: &str, limit: usize) -> Result<Vec<Post>> {
        let rows = sqlx::query(
            r#"
            SELECT id, workspace_id, content, platform, target_account_ids, media_ids,
                   status, scheduled_at, published_at, external_id, created_at, updated_at
            FROM posts
            WHERE workspace_id = ?
            ORDER BY created_at DESC
            LIMIT ?
            "#,
        )
        .bind(workspace_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Sqlx)?;

        rows.into_iter().map(map_post).collect()
    }

    // ------------------------------------------------------------------
    // Scheduler jobs
    // ------------------------------------------------------------------

    pub async fn create_job(&self, job: &SchedulerJob) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(StoreError::Sqlx)?;
        insert_job(&mut tx, job).await?;
        tx.commit().await.map_err(StoreError::Sqlx)?;
        Ok(())
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<SchedulerJob>> {
        let row = sqlx::query(
            r#"
            SELECT id, workspace_id, post_id, run_at, cron, status, attempt_count,
                   last_error, next_run_at, created_at, updated_at
            FROM scheduler_jobs WHERE id = ?
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Sqlx)?;

        row.map(map_job).transpose()
    }

    pub async fn jobs_for_post(&self, post_id: &str) -> Result<Vec<SchedulerJob>> {
        let rows = sqlx::query(
            r#"
            SELECT id, workspace_id, post_id, run_at, cron, status, attempt_count,
                   last_error, next_run_at, created_at, updated_at
            FROM scheduler_jobs WHERE post_id = ?
            ORDER BY created_at DESC
            "#,
        )
        .bind(post_id)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Sqlx)?;

        rows.into_iter().map(map_job).collect()
    }

    /// Queued jobs due at or before `now`, oldest due time first.
    pub async fn due_jobs(&self, now: i64, limit: usize) -> Result<Vec<SchedulerJob>> {
        let rows = sqlx::query(
            r#"
            SELECT id, workspace_id, post_id, run_at, cron, status, attempt_count,
                   last_error, next_run_at, created_at, updated_at
            FROM scheduler_jobs
            WHERE status = 'queued' AND next_run_at <= ?
            ORDER BY next_run_at ASC
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Sqlx)?;

        rows.into_iter().map(map_job).collect()
    }

    /// Claim a job for one attempt. The update is conditional on the queued
    /// status, so concurrent dispatchers claim each job at most once.
    pub async fn claim_job(&self, job_id: &str, now: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduler_jobs SET status = 'running', updated_at = ?
            WHERE id = ? AND status = 'queued'
            "#,
        )
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Sqlx)?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn has_running_job_for_post(&self, post_id: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM scheduler_jobs WHERE post_id = ? AND status = 'running'",
        )
        .bind(post_id)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::Sqlx)?;

        Ok(row.get::<i64, _>("n") > 0)
    }

    /// Running -> Done.
    pub async fn complete_job(&self, job_id: &str, now: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduler_jobs SET status = 'done', last_error = NULL, updated_at = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Sqlx)?;

        Ok(result.rows_affected() == 1)
    }

    /// Running -> Queued, with a new due time. Used both for retry backoff
    /// and for cron re-arm (which resets the attempt count).
    pub async fn rearm_job(
        &self,
        job_id: &str,
        next_run_at: i64,
        attempt_count: i64,
        last_error: Option<&str>,
        now: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduler_jobs
            SET status = 'queued', next_run_at = ?, attempt_count = ?, last_error = ?, updated_at = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(next_run_at)
        .bind(attempt_count)
        .bind(last_error)
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Sqlx)?;

        Ok(result.rows_affected() == 1)
    }

    /// Running -> Failed (terminal).
    pub async fn fail_job(
        &self,
        job_id: &str,
        attempt_count: i64,
        last_error: &str,
        now: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduler_jobs
            SET status = 'failed', attempt_count = ?, last_error = ?, updated_at = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(attempt_count)
        .bind(last_error)
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Sqlx)?;

        Ok(result.rows_affected() == 1)
    }

    /// Cancellation: only queued jobs can be removed. A running job must
    /// finish and have its outcome observed.
    pub async fn delete_queued_job(&self, job_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM scheduler_jobs WHERE id = ? AND status = 'queued'")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Sqlx)?;

        Ok(result.rows_affected() == 1)
    }

    /// Crash recovery: running jobs untouched since `cutoff` go back to
    /// queued. At-least-once, relying on the executor's publish guards to
    /// keep a possibly-still-finishing prior attempt from doubling up.
    pub async fn reset_stale_jobs(&self, cutoff: i64, now: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE scheduler_jobs SET status = 'queued', updated_at = ?
            WHERE status = 'running' AND updated_at < ?
            "#,
        )
        .bind(now)
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Sqlx)?;

        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------------
    // Social accounts
    // ------------------------------------------------------------------

    /// Insert or, when `(workspace_id, provider, external_id)` already
    /// exists, refresh the credential columns of the existing row.
    pub async fn upsert_account(&self, account: &SocialAccount) -> Result<SocialAccount> {
        sqlx::query(
            r#"
            INSERT INTO social_accounts
                (id, workspace_id, provider, external_id, encrypted_access_token,
                 encrypted_refresh_token, token_expires_at, meta, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(workspace_id, provider, external_id) DO UPDATE SET
                encrypted_access_token = excluded.encrypted_access_token,
                encrypted_refresh_token = excluded.encrypted_refresh_token,
                token_expires_at = excluded.token_expires_at,
                meta = excluded.meta,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&account.id)
        .bind(&account.workspace_id)
        .bind(&account.provider)
        .bind(&account.external_id)
        .bind(&account.encrypted_access_token)
        .bind(&account.encrypted_refresh_token)
        .bind(account.token_expires_at)
        .bind(&account.meta)
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Sqlx)?;

        // The surviving row keeps its original id on conflict; read it back.
        let row = sqlx::query(
            r#"
            SELECT id, workspace_id, provider, external_id, encrypted_access_token,
                   encrypted_refresh_token, token_expires_at, meta, created_at, updated_at
            FROM social_accounts
            WHERE workspace_id = ? AND provider = ? AND external_id = ?
            "#,
        )
        .bind(&account.workspace_id)
        .bind(&account.provider)
        .bind(&account.external_id)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::Sqlx)?;

        map_account(row)
    }

    pub async fn get_account(&self, account_id: &str) -> Result<Option<SocialAccount>> {
        let row = sqlx::query(
            r#"
            SELECT id, workspace_id, provider, external_id, encrypted_access_token,
                   encrypted_refresh_token, token_expires_at, meta, created_at, updated_at
            FROM social_accounts WHERE id = ?
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Sqlx)?;

        row.map(map_account).transpose()
    }

    /// The workspace's account for a provider, most recently linked first.
    pub async fn find_account(
        &self,
        workspace_id: &str,
        provider: &str,
    ) -> Result<Option<SocialAccount>> {
        let row = sqlx::query(
            r#"
            SELECT id, workspace_id, provider, external_id, encrypted_access_token,
                   encrypted_refresh_token, token_expires_at, meta, created_at, updated_at
            FROM social_accounts
            WHERE workspace_id = ? AND provider = ?
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(workspace_id)
        .bind(provider)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Sqlx)?;

        row.map(map_account).transpose()
    }

    pub async fn list_accounts(&self, workspace_id: &str) -> Result<Vec<SocialAccount>> {
        let rows = sqlx::query(
            r#"
            SELECT id, workspace_id, provider, external_id, encrypted_access_token,
                   encrypted_refresh_token, token_expires_at, meta, created_at, updated_at
            FROM social_accounts
            WHERE workspace_id = ?
            ORDER BY created_at ASC
            "#,
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Sqlx)?;

        rows.into_iter().map(map_account).collect()
    }

    /// Persist a refreshed token pair in one statement keyed by account id,
    /// so a concurrent reader never sees a half-updated row.
    pub async fn update_account_tokens(
        &self,
        account_id: &str,
        encrypted_access_token: &str,
        encrypted_refresh_token: Option<&str>,
        token_expires_at: Option<i64>,
        now: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE social_accounts
            SET encrypted_access_token = ?, encrypted_refresh_token = ?,
                token_expires_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(encrypted_access_token)
        .bind(encrypted_refresh_token)
        .bind(token_expires_at)
        .bind(now)
        .bind(account_id)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Sqlx)?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn delete_account(&self, account_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM social_accounts WHERE id = ?")
            .bind(account_id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Sqlx)?;

        Ok(result.rows_affected() == 1)
    }

    // ------------------------------------------------------------------
    // Rate limit windows
    // ------------------------------------------------------------------

    pub async fn window_count(
        &self,
        identity: &str,
        op_class: &str,
        window_start: i64,
    ) -> Result<u32> {
        let row = sqlx::query_as::<_, (Option<i64>,)>(
            r#"
            SELECT hit_count FROM rate_limit_windows
            WHERE identity = ? AND op_class = ? AND window_start = ?
            "#,
        )
        .bind(identity)
        .bind(op_class)
        .bind(window_start)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Sqlx)?;

        Ok(row.and_then(|r| r.0).unwrap_or(0) as u32)
    }

    /// Atomic increment-with-upsert; safe under concurrent dispatchers.
    pub async fn increment_window(
        &self,
        identity: &str,
        op_class: &str,
        window_start: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO rate_limit_windows (identity, op_class, window_start, hit_count)
            VALUES (?, ?, ?, 1)
            ON CONFLICT(identity, op_class, window_start)
            DO UPDATE SET hit_count = hit_count + 1
            "#,
        )
        .bind(identity)
        .bind(op_class)
        .bind(window_start)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Sqlx)?;

        Ok(())
    }

    pub async fn cleanup_windows(&self, cutoff: i64) -> Result<()> {
        sqlx::query("DELETE FROM rate_limit_windows WHERE window_start < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Sqlx)?;

        Ok(())
    }
}

async fn insert_post(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    post: &Post,
) -> Result<()> {
    let targets = encode_ids(&post.target_account_ids)?;
    let media = encode_ids(&post.media_ids)?;

    sqlx::query(
        r#"
        INSERT INTO posts
            (id, workspace_id, content, platform, target_account_ids, media_ids,
             status, scheduled_at, published_at, external_id, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&post.id)
    .bind(&post.workspace_id)
    .bind(&post.content)
    .bind(&post.platform)
    .bind(targets)
    .bind(media)
    .bind(post.status.as_str())
    .bind(post.scheduled_at)
    .bind(post.published_at)
    .bind(&post.external_id)
    .bind(post.created_at)
    .bind(post.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(StoreError::Sqlx)?;

    Ok(())
}

async fn insert_job(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    job: &SchedulerJob,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO scheduler_jobs
            (id, workspace_id, post_id, run_at, cron, status, attempt_count,
             last_error, next_run_at, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&job.id)
    .bind(&job.workspace_id)
    .bind(&job.post_id)
    .bind(job.run_at)
    .bind(&job.cron)
    .bind(job.status.as_str())
    .bind(job.attempt_count)
    .bind(&job.last_error)
    .bind(job.next_run_at)
    .bind(job.created_at)
    .bind(job.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(StoreError::Sqlx)?;

    Ok(())
}

fn encode_ids(ids: &[String]) -> Result<String> {
    serde_json::to_string(ids)
        .map_err(|e| StoreError::Decode(format!("id list encode: {}", e)).into())
}

fn decode_ids(raw: &str) -> Result<Vec<String>> {
    serde_json::from_str(raw)
        .map_err(|e| StoreError::Decode(format!("id list '{}': {}", raw, e)).into())
}

fn map_post(row: sqlx::sqlite::SqliteRow) -> Result<Post> {
    let status_raw: String = row.get("status");
    let status = PostStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::Decode(format!("post status '{}'", status_raw)))?;

    Ok(Post {
        id: row.get("id"),
        workspace_id: row.get("workspace_id"),
        content: row.get("content"),
        platform: row.get("platform"),
        target_account_ids: decode_ids(row.get::<String, _>("target_account_ids").as_str())?,
        media_ids: decode_ids(row.get::<String, _>("media_ids").as_str())?,
        status,
        scheduled_at: row.get("scheduled_at"),
        published_at: row.get("published_at"),
        external_id: row.get("external_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn map_job(row: sqlx::sqlite::SqliteRow) -> Result<SchedulerJob> {
    let status_raw: String = row.get("status");
    let status = JobStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::Decode(format!("job status '{}'", status_raw)))?;

    Ok(SchedulerJob {
        id: row.get("id"),
        workspace_id: row.get("workspace_id"),
        post_id: row.get("post_id"),
        run_at: row.get("run_at"),
        cron: row.get("cron"),
        status,
        attempt_count: row.get("attempt_count"),
        last_error: row.get("last_error"),
        next_run_at: row.get("next_run_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn map_account(row: sqlx::sqlite::SqliteRow) -> Result<SocialAccount> {
    Ok(SocialAccount {
        id: row.get("id"),
        workspace_id: row.get("workspace_id"),
        provider: row.get("provider"),
        external_id: row.get("external_id"),
        encrypted_access_token: row.get("encrypted_access_token"),
        encrypted_refresh_token: row.get("encrypted_refresh_token"),
        token_expires_at: row.get("token_expires_at"),
        meta: row.get("meta"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
