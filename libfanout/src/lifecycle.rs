//! Post lifecycle state machine
//!
//! The authoritative transition table for a post. All status changes go
//! through the apply helpers here so the `published_at`/`external_id`
//! invariants hold after any sequence of transitions. Publishing is
//! immutable: a published post accepts no further transitions, and attempts
//! to re-publish fail `AlreadyPublished` without mutating state.
//!
//! A failed post may be rescheduled; that re-enters `Scheduled` under the
//! same post id as a fresh lifecycle.

use crate::error::{FanoutError, Result};
use crate::types::{Post, PostStatus};

/// Whether `from -> to` appears in the legal transition table.
pub fn can_transition(from: PostStatus, to: PostStatus) -> bool {
    use PostStatus::*;
    matches!(
        (from, to),
        (Draft, Scheduled)
            | (Draft, Published)
            | (Draft, Failed)
            | (Scheduled, Published)
            | (Scheduled, Failed)
            | (Scheduled, Draft)
            | (Failed, Scheduled)
    )
}

fn check(post: &Post, to: PostStatus) -> Result<()> {
    if post.status == PostStatus::Published {
        return Err(FanoutError::AlreadyPublished);
    }
    if !can_transition(post.status, to) {
        return Err(FanoutError::IllegalTransition {
            from: post.status,
            to,
        });
    }
    Ok(())
}

/// Attach a schedule: `Draft|Failed -> Scheduled`.
///
/// The caller validates that `at` is in the future; this only enforces the
/// transition table and stamps the schedule.
pub fn schedule(post: &mut Post, at: i64, now: i64) -> Result<()> {
    check(post, PostStatus::Scheduled)?;
    post.status = PostStatus::Scheduled;
    post.scheduled_at = Some(at);
    post.updated_at = now;
    Ok(())
}

/// A successful publish attempt: sets `published_at` and `external_id`.
pub fn publish(post: &mut Post, external_id: String, now: i64) -> Result<()> {
    check(post, PostStatus::Published)?;
    post.status = PostStatus::Published;
    post.published_at = Some(now);
    post.external_id = Some(external_id);
    post.updated_at = now;
    Ok(())
}

/// A terminal publish failure. The error message lives on the job record,
/// not here.
pub fn fail(post: &mut Post, now: i64) -> Result<()> {
    check(post, PostStatus::Failed)?;
    post.status = PostStatus::Failed;
    post.updated_at = now;
    Ok(())
}

/// Cancel a pending schedule: `Scheduled -> Draft`.
pub fn unschedule(post: &mut Post, now: i64) -> Result<()> {
    check(post, PostStatus::Draft)?;
    post.status = PostStatus::Draft;
    post.scheduled_at = None;
    post.updated_at = now;
    Ok(())
}
