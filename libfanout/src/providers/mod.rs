//! Provider abstraction and implementations
//!
//! Each adapter translates "publish this content" into one provider's API
//! call and classifies the response into the closed `ProviderError` kinds,
//! whose `is_retryable()` drives the scheduler's retry policy. Adapters are
//! stateless and swappable; the executor selects one through the registry by
//! the post's platform tag.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::types::Post;

pub mod mastodon;

// The mock provider ships in normal builds so integration tests can drive
// the full publish pipeline without provider credentials.
pub mod mock;

/// One provider's publish surface.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Lowercase platform tag the registry keys on (e.g. "mastodon").
    fn name(&self) -> &str;

    /// Publish `post` on behalf of the accounts in `targets`, returning the
    /// provider-assigned id of the created content.
    async fn publish(
        &self,
        token: &str,
        post: &Post,
        targets: &[String],
    ) -> std::result::Result<String, ProviderError>;
}

/// Adapter lookup by platform tag.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    /// Resolve the adapter for a platform tag. An unknown platform is a
    /// terminal `Unsupported` failure: no retry budget is spent on it.
    pub fn get(&self, platform: &str) -> std::result::Result<Arc<dyn ProviderAdapter>, ProviderError> {
        self.adapters
            .get(platform)
            .cloned()
            .ok_or_else(|| ProviderError::Unsupported(platform.to_string()))
    }

    pub fn platforms(&self) -> Vec<&str> {
        self.adapters.keys().map(String::as_str).collect()
    }
}
