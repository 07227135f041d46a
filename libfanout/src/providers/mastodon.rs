//! Mastodon provider adapter
//!
//! Publishes through the megalodon client, which also covers Pleroma,
//! Firefish, GoToSocial, and other instances speaking the Mastodon API. The
//! adapter is stateless: each publish builds a client around the access
//! token the vault handed out, so refreshed tokens are picked up
//! transparently.

use async_trait::async_trait;
use megalodon::{Megalodon, SNS};

use crate::error::ProviderError;
use crate::providers::ProviderAdapter;
use crate::types::Post;

pub struct MastodonProvider {
    /// Instance base URL, e.g. "https://mastodon.social".
    base_url: String,
}

impl MastodonProvider {
    pub fn new(base_url: String) -> Self {
        let base_url = if base_url.starts_with("http://") || base_url.starts_with("https://") {
            base_url
        } else {
            format!("https://{}", base_url)
        };
        Self { base_url }
    }

    fn client(
        &self,
        token: &str,
    ) -> std::result::Result<Box<dyn Megalodon + Send + Sync>, ProviderError> {
        megalodon::generator(
            SNS::Mastodon,
            self.base_url.clone(),
            Some(token.to_string()),
            None,
        )
        .map_err(|e| ProviderError::Auth(format!("failed to build client: {:?}", e)))
    }
}

#[async_trait]
impl ProviderAdapter for MastodonProvider {
    fn name(&self) -> &str {
        "mastodon"
    }

    async fn publish(
        &self,
        token: &str,
        post: &Post,
        _targets: &[String],
    ) -> std::result::Result<String, ProviderError> {
        if post.content.trim().is_empty() {
            return Err(ProviderError::PolicyRejected(
                "content cannot be empty".to_string(),
            ));
        }

        let client = self.client(token)?;
        let response = client
            .post_status(post.content.clone(), None)
            .await
            .map_err(map_megalodon_error)?;

        let external_id = match response.json {
            megalodon::megalodon::PostStatusOutput::Status(status) => status.id,
            megalodon::megalodon::PostStatusOutput::ScheduledStatus(scheduled) => scheduled.id,
        };

        Ok(external_id)
    }
}

/// Map a megalodon failure onto the closed `ProviderError` kinds.
///
/// The HTTP status class decides the kind; nothing downstream ever inspects
/// message text. A response with no recognizable status is treated as a
/// transport failure, which is retryable.
fn map_megalodon_error(error: megalodon::error::Error) -> ProviderError {
    let text = error.to_string();

    match extract_http_status(&text) {
        Some(401) | Some(403) => ProviderError::Auth(text),
        Some(404) => ProviderError::NotConnected,
        Some(422) => ProviderError::PolicyRejected(text),
        Some(429) => ProviderError::RateLimited { retry_after: None },
        Some(status) if (500..=599).contains(&status) => ProviderError::ServerError(text),
        Some(_) => ProviderError::PolicyRejected(text),
        None => ProviderError::Network(text),
    }
}

/// Pull the first plausible HTTP status code out of an error rendering.
fn extract_http_status(text: &str) -> Option<u16> {
    text.split(|c: char| !c.is_ascii_digit())
        .filter(|s| s.len() == 3)
        .filter_map(|s| s.parse::<u16>().ok())
        .find(|code| (100..=599).contains(code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_scheme_prefixing() {
        let provider = MastodonProvider::new("mastodon.social".to_string());
        assert_eq!(provider.base_url, "https://mastodon.social");

        let provider = MastodonProvider::new("https://example.social".to_string());
        assert_eq!(provider.base_url, "https://example.social");
    }

    #[test]
    fn test_extract_http_status() {
        assert_eq!(extract_http_status("status code 429 returned"), Some(429));
        assert_eq!(extract_http_status("HTTP 502: bad gateway"), Some(502));
        assert_eq!(extract_http_status("connection reset by peer"), None);
        // Out-of-range three-digit runs are skipped.
        assert_eq!(extract_http_status("id 999 then 401"), Some(401));
    }

    #[test]
    fn test_status_class_mapping() {
        assert!(matches!(
            extract_and_map("error 401: unauthorized"),
            ProviderError::Auth(_)
        ));
        assert!(matches!(
            extract_and_map("error 403: forbidden"),
            ProviderError::Auth(_)
        ));
        assert!(matches!(
            extract_and_map("error 422: validation failed"),
            ProviderError::PolicyRejected(_)
        ));
        assert!(matches!(
            extract_and_map("error 429: too many requests"),
            ProviderError::RateLimited { .. }
        ));
        assert!(matches!(
            extract_and_map("error 503: service unavailable"),
            ProviderError::ServerError(_)
        ));
        assert!(matches!(
            extract_and_map("dns lookup failed"),
            ProviderError::Network(_)
        ));
    }

    #[test]
    fn test_retryability_follows_status_class() {
        assert!(extract_and_map("error 503: unavailable").is_retryable());
        assert!(extract_and_map("error 429: slow down").is_retryable());
        assert!(extract_and_map("timed out").is_retryable());
        assert!(!extract_and_map("error 401: unauthorized").is_retryable());
        assert!(!extract_and_map("error 422: rejected").is_retryable());
    }

    // Mirrors map_megalodon_error without constructing a megalodon error.
    fn extract_and_map(text: &str) -> ProviderError {
        match extract_http_status(text) {
            Some(401) | Some(403) => ProviderError::Auth(text.to_string()),
            Some(404) => ProviderError::NotConnected,
            Some(422) => ProviderError::PolicyRejected(text.to_string()),
            Some(429) => ProviderError::RateLimited { retry_after: None },
            Some(status) if (500..=599).contains(&status) => {
                ProviderError::ServerError(text.to_string())
            }
            Some(_) => ProviderError::PolicyRejected(text.to_string()),
            None => ProviderError::Network(text.to_string()),
        }
    }
}
