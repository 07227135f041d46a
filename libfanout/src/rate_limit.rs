//! Rate limiting for provider dispatch
//!
//! Window counting per (identity, operation class), with independent budgets
//! per class. Counters live in the shared store so admission decisions stay
//! correct across concurrent dispatcher processes; the only write is an
//! atomic upsert-increment.
//!
//! When the counter store is unavailable the limiter fails open: the call is
//! admitted and a warning is logged. Availability is prioritized over strict
//! quota enforcement here, and the policy is deliberate, not an oversight.

use std::collections::HashMap;

use tracing::warn;

use crate::store::Store;

/// Operation class for post publication.
pub const PUBLISH_CLASS: &str = "publish";
/// Operation class for media uploads.
pub const MEDIA_CLASS: &str = "media";

/// Budget for one operation class.
#[derive(Debug, Clone, Copy)]
pub struct ClassLimit {
    pub max_hits: u32,
    pub window_secs: i64,
}

/// Per-class budgets, keyed by operation class.
#[derive(Debug, Clone)]
pub struct RateLimits {
    limits: HashMap<String, ClassLimit>,
}

impl RateLimits {
    pub fn new(limits: HashMap<String, ClassLimit>) -> Self {
        Self { limits }
    }

    pub fn get(&self, op_class: &str) -> Option<ClassLimit> {
        self.limits.get(op_class).copied()
    }
}

impl Default for RateLimits {
    /// Publish ≈ 5/minute, media ≈ 10/minute, per identity.
    fn default() -> Self {
        let mut limits = HashMap::new();
        limits.insert(
            PUBLISH_CLASS.to_string(),
            ClassLimit {
                max_hits: 5,
                window_secs: 60,
            },
        );
        limits.insert(
            MEDIA_CLASS.to_string(),
            ClassLimit {
                max_hits: 10,
                window_secs: 60,
            },
        );
        Self { limits }
    }
}

/// Admission decision for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: i64,
}

pub struct RateLimiter {
    store: Store,
    limits: RateLimits,
}

impl RateLimiter {
    pub fn new(store: Store, limits: RateLimits) -> Self {
        Self { store, limits }
    }

    /// Check and record one call for `(identity, op_class)` at `now`.
    ///
    /// An admitted call is counted; a denied call is not. Classes without a
    /// configured budget are always admitted.
    pub async fn allow(&self, identity: &str, op_class: &str, now: i64) -> Decision {
        let Some(limit) = self.limits.get(op_class) else {
            return Decision {
                allowed: true,
                remaining: u32::MAX,
                reset_at: now,
            };
        };

        let window_start = now - now.rem_euclid(limit.window_secs);
        let reset_at = window_start + limit.window_secs;

        let count = match self.store.window_count(identity, op_class, window_start).await {
            Ok(count) => count,
            Err(e) => {
                warn!(identity, op_class, "rate limiter store unavailable, failing open: {}", e);
                return Decision {
                    allowed: true,
                    remaining: limit.max_hits,
                    reset_at,
                };
            }
        };

        if count >= limit.max_hits {
            return Decision {
                allowed: false,
                remaining: 0,
                reset_at,
            };
        }

        if let Err(e) = self
            .store
            .increment_window(identity, op_class, window_start)
            .await
        {
            warn!(identity, op_class, "rate limiter store unavailable, failing open: {}", e);
        }

        Decision {
            allowed: true,
            remaining: limit.max_hits - count - 1,
            reset_at,
        }
    }

    /// Drop counter rows for windows that ended before `now`.
    pub async fn cleanup(&self, now: i64) -> crate::Result<()> {
        let horizon = self
            .limits
            .limits
            .values()
            .map(|l| l.window_secs)
            .max()
            .unwrap_or(60);
        self.store.cleanup_windows(now - horizon).await
    }
}
