//! Mock provider for testing
//!
//! A configurable adapter that simulates provider behavior: success,
//! terminal rejection, retryable failure, fail-N-then-succeed, and latency.
//! Call counts and published content are recorded for verification. It is
//! compiled into normal builds so integration tests can exercise the whole
//! publish pipeline without credentials or network access.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;

use crate::error::ProviderError;
use crate::providers::ProviderAdapter;
use crate::types::Post;

#[derive(Clone)]
enum Behavior {
    Succeed,
    Fail(ProviderError),
    /// Fail with the error this many times, then succeed.
    FailThenSucceed(usize, ProviderError),
}

/// Mock provider adapter.
pub struct MockProvider {
    name: String,
    behavior: Behavior,
    delay: Duration,
    publish_calls: Arc<Mutex<usize>>,
    published: Arc<Mutex<Vec<String>>>,
    tokens_seen: Arc<Mutex<Vec<String>>>,
}

impl MockProvider {
    fn new(name: &str, behavior: Behavior) -> Self {
        Self {
            name: name.to_string(),
            behavior,
            delay: Duration::ZERO,
            publish_calls: Arc::new(Mutex::new(0)),
            published: Arc::new(Mutex::new(Vec::new())),
            tokens_seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Always publishes successfully.
    pub fn success(name: &str) -> Self {
        Self::new(name, Behavior::Succeed)
    }

    /// Always fails with a terminal policy rejection.
    pub fn terminal(name: &str, reason: &str) -> Self {
        Self::new(name, Behavior::Fail(ProviderError::PolicyRejected(reason.to_string())))
    }

    /// Always fails with a retryable network error.
    pub fn retryable(name: &str, reason: &str) -> Self {
        Self::new(name, Behavior::Fail(ProviderError::Network(reason.to_string())))
    }

    /// Always fails with the given error.
    pub fn failing_with(name: &str, error: ProviderError) -> Self {
        Self::new(name, Behavior::Fail(error))
    }

    /// Fails `failures` times with a retryable error, then succeeds.
    pub fn flaky(name: &str, failures: usize) -> Self {
        Self::new(
            name,
            Behavior::FailThenSucceed(
                failures,
                ProviderError::Network("simulated transient failure".to_string()),
            ),
        )
    }

    /// Add simulated latency to every publish call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn publish_calls(&self) -> usize {
        *self.publish_calls.lock().unwrap()
    }

    pub fn published(&self) -> Vec<String> {
        self.published.lock().unwrap().clone()
    }

    pub fn tokens_seen(&self) -> Vec<String> {
        self.tokens_seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProviderAdapter for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(
        &self,
        token: &str,
        post: &Post,
        _targets: &[String],
    ) -> std::result::Result<String, ProviderError> {
        let call_number = {
            let mut calls = self.publish_calls.lock().unwrap();
            *calls += 1;
            *calls
        };
        self.tokens_seen.lock().unwrap().push(token.to_string());

        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }

        let succeed = match &self.behavior {
            Behavior::Succeed => Ok(()),
            Behavior::Fail(error) => Err(error.clone()),
            Behavior::FailThenSucceed(failures, error) => {
                if call_number <= *failures {
                    Err(error.clone())
                } else {
                    Ok(())
                }
            }
        };

        succeed?;

        self.published.lock().unwrap().push(post.content.clone());
        Ok(format!("{}-{}", self.name, uuid::Uuid::new_v4()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_post() -> Post {
        Post::new("ws-1".to_string(), "hello".to_string())
    }

    #[tokio::test]
    async fn test_mock_success() {
        let provider = MockProvider::success("demo");
        let id = provider.publish("tok", &test_post(), &[]).await.unwrap();

        assert!(id.starts_with("demo-"));
        assert_eq!(provider.publish_calls(), 1);
        assert_eq!(provider.published(), vec!["hello".to_string()]);
        assert_eq!(provider.tokens_seen(), vec!["tok".to_string()]);
    }

    #[tokio::test]
    async fn test_mock_terminal() {
        let provider = MockProvider::terminal("demo", "policy violation");
        let err = provider.publish("tok", &test_post(), &[]).await.unwrap_err();

        assert!(matches!(err, ProviderError::PolicyRejected(_)));
        assert!(!err.is_retryable());
        assert!(provider.published().is_empty());
    }

    #[tokio::test]
    async fn test_mock_retryable() {
        let provider = MockProvider::retryable("demo", "connection reset");
        let err = provider.publish("tok", &test_post(), &[]).await.unwrap_err();

        assert!(matches!(err, ProviderError::Network(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_mock_flaky_succeeds_after_failures() {
        let provider = MockProvider::flaky("demo", 2);
        let post = test_post();

        assert!(provider.publish("tok", &post, &[]).await.is_err());
        assert!(provider.publish("tok", &post, &[]).await.is_err());
        assert!(provider.publish("tok", &post, &[]).await.is_ok());
        assert_eq!(provider.publish_calls(), 3);
    }

    #[tokio::test]
    async fn test_mock_delay() {
        let provider =
            MockProvider::success("demo").with_delay(Duration::from_millis(50));

        let start = std::time::Instant::now();
        provider.publish("tok", &test_post(), &[]).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_mock_unique_external_ids() {
        let provider = MockProvider::success("demo");
        let a = provider.publish("tok", &test_post(), &[]).await.unwrap();
        let b = provider.publish("tok", &test_post(), &[]).await.unwrap();
        assert_ne!(a, b);
    }
}
