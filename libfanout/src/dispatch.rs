//! Job dispatcher
//!
//! The polling side of the scheduler: each tick atomically claims due jobs,
//! runs them through the publish executor on a bounded worker pool, and
//! applies the retry policy. Claims are conditional updates, so concurrent
//! dispatcher processes claim each job at most once; one job's failure never
//! aborts the rest of the tick; and a failed tick never kills the loop.
//!
//! Recovery is at-least-once: jobs stuck in `Running` past a grace period
//! are swept back to `Queued`, and an attempt that finds its post already
//! published completes the job instead of publishing twice.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::error::{FanoutError, Result};
use crate::executor::{PublishExecutor, PublishOutcome};
use crate::lifecycle;
use crate::schedule;
use crate::service::events::{Event, EventBus};
use crate::store::Store;
use crate::types::{PostStatus, SchedulerJob};

/// Tuning for the dispatch loop.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Time between polls for due jobs.
    pub poll_interval: Duration,
    /// Maximum jobs claimed per tick.
    pub batch_size: usize,
    /// Publish attempts per job before it fails for good.
    pub max_attempts: i64,
    /// First retry delay; doubles per attempt.
    pub backoff_base: Duration,
    /// Upper bound on the retry delay.
    pub backoff_cap: Duration,
    /// Running jobs older than this are presumed crashed and reclaimed.
    pub stale_after: Duration,
    /// Concurrent executions per tick.
    pub concurrency: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            batch_size: 10,
            max_attempts: 5,
            backoff_base: Duration::from_secs(60),
            backoff_cap: Duration::from_secs(30 * 60),
            stale_after: Duration::from_secs(10 * 60),
            concurrency: 4,
        }
    }
}

pub struct Dispatcher {
    store: Store,
    executor: Arc<PublishExecutor>,
    events: EventBus,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        store: Store,
        executor: Arc<PublishExecutor>,
        events: EventBus,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            executor,
            events,
            config,
        }
    }

    /// Run the poll loop until `shutdown` is set.
    pub async fn run(&self, shutdown: Arc<AtomicBool>) -> Result<()> {
        info!(
            poll_interval = ?self.config.poll_interval,
            "dispatcher started"
        );

        loop {
            if shutdown.load(Ordering::Relaxed) {
                info!("shutdown requested, stopping dispatcher");
                break;
            }

            let now = chrono::Utc::now().timestamp();
            match self.tick(now).await {
                Ok(0) => {}
                Ok(count) => info!(count, "processed due jobs"),
                // Store unavailability means this tick made no progress;
                // the next one will try again.
                Err(e) => error!("dispatch tick failed: {}", e),
            }

            let seconds = self.config.poll_interval.as_secs().max(1);
            for _ in 0..seconds {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                sleep(Duration::from_secs(1)).await;
            }
        }

        Ok(())
    }

    /// Process everything due at `now` once. Returns how many jobs ran.
    pub async fn tick(&self, now: i64) -> Result<usize> {
        let stale_cutoff = now - self.config.stale_after.as_secs() as i64;
        let reclaimed = self.store.reset_stale_jobs(stale_cutoff, now).await?;
        if reclaimed > 0 {
            warn!(reclaimed, "reclaimed stale running jobs");
        }

        let due = self.store.due_jobs(now, self.config.batch_size).await?;
        if due.is_empty() {
            return Ok(0);
        }

        let mut claimed = Vec::new();
        for job in due {
            // Conditional claim: a concurrent dispatcher may have won.
            if self.store.claim_job(&job.id, now).await? {
                self.events.emit(Event::JobClaimed {
                    job_id: job.id.clone(),
                    post_id: job.post_id.clone(),
                });
                claimed.push(job);
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let tasks = claimed.iter().map(|job| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let _permit = match semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                self.process_job(job, now).await;
            }
        });
        futures::future::join_all(tasks).await;

        Ok(claimed.len())
    }

    /// Run one claimed job to its next job state. Never propagates an
    /// error: whatever happens to this job must not touch its tick-mates.
    async fn process_job(&self, job: &SchedulerJob, now: i64) {
        let result = self.executor.execute(&job.post_id).await;

        let applied = match result {
            Ok(PublishOutcome::Published { .. }) => self.finish_success(job, now).await,
            // At-least-once recovery: a prior attempt already published
            // this post, so the re-claimed job just completes.
            Err(FanoutError::AlreadyPublished) => self.complete(job, now).await,
            Ok(PublishOutcome::Retryable { reason, retry_at }) => {
                self.handle_retry(job, &reason, retry_at, now).await
            }
            Ok(PublishOutcome::Terminal { reason }) => self.fail(job, &reason, now).await,
            Err(FanoutError::NotFound(_)) => {
                self.fail(job, "post no longer exists", now).await
            }
            // A direct publish call holds the post right now; try again
            // shortly without spending the attempt budget.
            Err(FanoutError::PublishInFlight) => {
                self.store
                    .rearm_job(
                        &job.id,
                        now + self.config.backoff_base.as_secs() as i64,
                        job.attempt_count,
                        Some("publish already in flight"),
                        now,
                    )
                    .await
                    .map(|_| ())
            }
            Err(e) => {
                warn!(job_id = %job.id, "infrastructure failure during publish: {}", e);
                self.handle_retry(job, &e.to_string(), None, now).await
            }
        };

        if let Err(e) = applied {
            error!(job_id = %job.id, "failed to persist job state: {}", e);
        }
    }

    async fn finish_success(&self, job: &SchedulerJob, now: i64) -> Result<()> {
        let Some(cron) = job.cron.as_deref() else {
            return self.complete(job, now).await;
        };

        match schedule::next_occurrence(cron, now) {
            Ok(Some(next_run_at)) => {
                // Re-arm with a fresh attempt budget for the next occurrence.
                self.store
                    .rearm_job(&job.id, next_run_at, 0, None, now)
                    .await?;
                self.events.emit(Event::JobRearmed {
                    job_id: job.id.clone(),
                    next_run_at,
                    attempt_count: 0,
                });
                Ok(())
            }
            Ok(None) => {
                info!(job_id = %job.id, "cron schedule exhausted");
                self.complete(job, now).await
            }
            Err(e) => self.fail(job, &format!("invalid cron expression: {}", e), now).await,
        }
    }

    async fn complete(&self, job: &SchedulerJob, now: i64) -> Result<()> {
        self.store.complete_job(&job.id, now).await?;
        self.events.emit(Event::JobCompleted {
            job_id: job.id.clone(),
        });
        Ok(())
    }

    async fn handle_retry(
        &self,
        job: &SchedulerJob,
        reason: &str,
        retry_at: Option<i64>,
        now: i64,
    ) -> Result<()> {
        let attempts = job.attempt_count + 1;

        if attempts >= self.config.max_attempts {
            self.fail(job, &format!("retries exhausted: {}", reason), now)
                .await?;
            return Ok(());
        }

        let delay = schedule::backoff_delay(
            attempts,
            self.config.backoff_base,
            self.config.backoff_cap,
        );
        let mut next_run_at = now + delay.as_secs() as i64;
        // A provider retry hint later than our backoff wins.
        if let Some(hint) = retry_at {
            next_run_at = next_run_at.max(hint);
        }

        self.store
            .rearm_job(&job.id, next_run_at, attempts, Some(reason), now)
            .await?;
        self.events.emit(Event::JobRearmed {
            job_id: job.id.clone(),
            next_run_at,
            attempt_count: attempts,
        });
        Ok(())
    }

    /// Terminal job failure; the post goes to `Failed` with it.
    async fn fail(&self, job: &SchedulerJob, reason: &str, now: i64) -> Result<()> {
        self.store
            .fail_job(&job.id, job.attempt_count + 1, reason, now)
            .await?;
        self.events.emit(Event::JobFailed {
            job_id: job.id.clone(),
            error: reason.to_string(),
        });
        self.fail_post(&job.post_id, now).await;
        Ok(())
    }

    /// Best-effort: move the post to `Failed` unless it already reached a
    /// terminal state. The executor handles this for terminal outcomes; this
    /// covers retry exhaustion and vanished posts.
    async fn fail_post(&self, post_id: &str, now: i64) {
        let post = match self.store.get_post(post_id).await {
            Ok(Some(post)) => post,
            Ok(None) => return,
            Err(e) => {
                warn!(post_id, "could not load post to mark failed: {}", e);
                return;
            }
        };

        if post.status == PostStatus::Published || post.status == PostStatus::Failed {
            return;
        }

        let expected = post.status;
        let mut updated = post;
        if lifecycle::fail(&mut updated, now).is_ok() {
            if let Err(e) = self.store.transition_post(&updated, expected).await {
                warn!(post_id, "could not mark post failed: {}", e);
            }
        }
    }
}
