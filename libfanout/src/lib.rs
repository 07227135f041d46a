//! Fanout - publishing orchestration for workspace social posting
//!
//! This library moves a post from draft to a terminal outcome: scheduling
//! (one-off or cron), encrypted provider credentials with refresh-before-
//! expiry, rate-limited dispatch to provider APIs, and classified failure
//! handling with bounded retries.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod lifecycle;
pub mod logging;
pub mod providers;
pub mod rate_limit;
pub mod schedule;
pub mod service;
pub mod store;
pub mod types;
pub mod vault;

// Re-export commonly used types
pub use config::Config;
pub use dispatch::{DispatchConfig, Dispatcher};
pub use error::{FanoutError, Result};
pub use executor::{PublishExecutor, PublishOutcome};
pub use service::FanoutService;
pub use store::Store;
pub use types::{JobStatus, Post, PostStatus, SchedulerJob, SocialAccount};
pub use vault::CredentialVault;
