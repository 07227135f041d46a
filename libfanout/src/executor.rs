//! Publish executor
//!
//! Orchestrates one publish attempt: load the post, resolve the target
//! account, obtain a valid token from the vault, pass the rate limiter,
//! call the provider adapter, and apply the resulting lifecycle transition.
//!
//! The executor never lets an error escape unclassified: every attempt ends
//! in a `PublishOutcome`, and only caller mistakes (unknown post, re-publish
//! of a published post, concurrent direct calls) or store unavailability
//! surface as errors. At most one execution runs per post id inside this
//! process; across processes the scheduler's job claim provides the same
//! guarantee.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::error::{FanoutError, Result, StoreError};
use crate::lifecycle;
use crate::providers::ProviderRegistry;
use crate::rate_limit::{RateLimiter, PUBLISH_CLASS};
use crate::service::events::{Event, EventBus};
use crate::store::Store;
use crate::types::{Post, PostStatus, SocialAccount};
use crate::vault::CredentialVault;

/// Classified result of one publish attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Published {
        external_id: String,
    },
    /// The attempt may succeed later; `retry_at` is the earliest useful
    /// retry when the failure source supplied one.
    Retryable {
        reason: String,
        retry_at: Option<i64>,
    },
    /// Retrying cannot help; the post has been marked failed.
    Terminal {
        reason: String,
    },
}

pub struct PublishExecutor {
    store: Store,
    vault: CredentialVault,
    limiter: Arc<RateLimiter>,
    registry: Arc<ProviderRegistry>,
    events: EventBus,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl PublishExecutor {
    pub fn new(
        store: Store,
        vault: CredentialVault,
        limiter: Arc<RateLimiter>,
        registry: Arc<ProviderRegistry>,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            vault,
            limiter,
            registry,
            events,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Run one publish attempt for `post_id`.
    pub async fn execute(&self, post_id: &str) -> Result<PublishOutcome> {
        let _guard = InFlightGuard::acquire(&self.in_flight, post_id)
            .ok_or(FanoutError::PublishInFlight)?;

        let post = self
            .store
            .get_post(post_id)
            .await?
            .ok_or_else(|| FanoutError::NotFound(post_id.to_string()))?;

        if post.status == PostStatus::Published {
            return Err(FanoutError::AlreadyPublished);
        }

        let Some(platform) = post.platform.clone() else {
            return self.terminal(post, "platform not specified".to_string()).await;
        };

        self.events.emit(Event::PublishAttempted {
            post_id: post.id.clone(),
            platform: platform.clone(),
        });

        let Some(account) = self.resolve_account(&post, &platform).await? else {
            return self
                .terminal(post, format!("no {} account connected", platform))
                .await;
        };

        let token = match self.vault.get_valid_token(&account.id).await {
            Ok(token) => token,
            Err(FanoutError::Vault(e)) if e.is_terminal() => {
                return self.terminal(post, format!("credential failure: {}", e)).await;
            }
            Err(FanoutError::Vault(e)) => {
                return self.retryable(&post, e.to_string(), None);
            }
            Err(other) => return Err(other),
        };

        let now = chrono::Utc::now().timestamp();
        let decision = self
            .limiter
            .allow(&post.workspace_id, PUBLISH_CLASS, now)
            .await;
        if !decision.allowed {
            return self.retryable(
                &post,
                "publish rate limit exceeded".to_string(),
                Some(decision.reset_at),
            );
        }

        let adapter = match self.registry.get(&platform) {
            Ok(adapter) => adapter,
            Err(e) => return self.terminal(post, e.to_string()).await,
        };

        match adapter
            .publish(&token, &post, &post.target_account_ids)
            .await
        {
            Ok(external_id) => self.apply_published(post, external_id).await,
            Err(e) if e.is_retryable() => {
                let retry_at = e.retry_after();
                self.retryable(&post, e.to_string(), retry_at)
            }
            Err(e) => self.terminal(post, e.to_string()).await,
        }
    }

    /// Resolve the account the post targets: an explicit target account id
    /// of the right provider wins, otherwise the workspace's account for
    /// the platform.
    async fn resolve_account(
        &self,
        post: &Post,
        platform: &str,
    ) -> Result<Option<SocialAccount>> {
        for account_id in &post.target_account_ids {
            if let Some(account) = self.store.get_account(account_id).await? {
                if account.provider == platform && account.workspace_id == post.workspace_id {
                    return Ok(Some(account));
                }
            }
        }

        if post.target_account_ids.is_empty() {
            return self.store.find_account(&post.workspace_id, platform).await;
        }

        Ok(None)
    }

    async fn apply_published(&self, post: Post, external_id: String) -> Result<PublishOutcome> {
        let now = chrono::Utc::now().timestamp();
        let expected = post.status;

        let mut updated = post;
        lifecycle::publish(&mut updated, external_id.clone(), now)?;

        if !self.store.transition_post(&updated, expected).await? {
            return Err(StoreError::Conflict(format!(
                "post {} changed during publish",
                updated.id
            ))
            .into());
        }

        info!(post_id = %updated.id, external_id = %external_id, "post published");
        self.events.emit(Event::PublishSucceeded {
            post_id: updated.id,
            external_id: external_id.clone(),
        });

        Ok(PublishOutcome::Published { external_id })
    }

    fn retryable(
        &self,
        post: &Post,
        reason: String,
        retry_at: Option<i64>,
    ) -> Result<PublishOutcome> {
        warn!(post_id = %post.id, reason = %reason, "publish attempt failed, retryable");
        self.events.emit(Event::PublishFailed {
            post_id: post.id.clone(),
            reason: reason.clone(),
            terminal: false,
        });
        Ok(PublishOutcome::Retryable { reason, retry_at })
    }

    /// Mark the post failed and return a terminal outcome. A post that is
    /// already failed (a reclaimed job finishing late) stays failed.
    async fn terminal(&self, post: Post, reason: String) -> Result<PublishOutcome> {
        let now = chrono::Utc::now().timestamp();
        let expected = post.status;

        if expected != PostStatus::Failed {
            let mut updated = post.clone();
            lifecycle::fail(&mut updated, now)?;
            if !self.store.transition_post(&updated, expected).await? {
                warn!(post_id = %post.id, "post changed while marking failed");
            }
        }

        warn!(post_id = %post.id, reason = %reason, "publish attempt failed, terminal");
        self.events.emit(Event::PublishFailed {
            post_id: post.id,
            reason: reason.clone(),
            terminal: true,
        });
        Ok(PublishOutcome::Terminal { reason })
    }
}

/// Removes its key from the in-flight set on drop.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl InFlightGuard {
    fn acquire(set: &Arc<Mutex<HashSet<String>>>, key: &str) -> Option<Self> {
        let mut guard = set.lock().unwrap();
        if !guard.insert(key.to_string()) {
            return None;
        }
        Some(Self {
            set: Arc::clone(set),
            key: key.to_string(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.lock().unwrap().remove(&self.key);
    }
}
