//! Error types for Fanout
//!
//! Failure kinds are closed enums. Callers branch on variants, never on
//! message text, and the retryable/terminal split lives on the types that
//! produce the failures.

use thiserror::Error;

use crate::types::PostStatus;

pub type Result<T> = std::result::Result<T, FanoutError>;

#[derive(Error, Debug)]
pub enum FanoutError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Credential error: {0}")]
    Vault(#[from] VaultError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Post not found: {0}")]
    NotFound(String),

    #[error("Post is already published")]
    AlreadyPublished,

    #[error("Illegal post transition: {from} -> {to}")]
    IllegalTransition { from: PostStatus, to: PostStatus },

    #[error("Job is running and cannot be cancelled")]
    JobRunning,

    #[error("A publish attempt for this post is already in flight")]
    PublishInFlight,
}

impl FanoutError {
    /// Returns the appropriate process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            FanoutError::Config(_) => 2,
            FanoutError::InvalidInput(_) => 3,
            _ => 1,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store operation failed: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Conditional update matched no row: {0}")]
    Conflict(String),

    #[error("Unexpected value in store: {0}")]
    Decode(String),
}

/// Failures surfaced by the credential vault.
#[derive(Error, Debug)]
pub enum VaultError {
    #[error("No account with id {0}")]
    NoAccount(String),

    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("Access token expired and no refresh token is stored")]
    TokenExpiredNoRefresh,

    #[error("Stored credential failed authentication")]
    CorruptCredential,

    #[error("Encryption failed: {0}")]
    Encrypt(String),
}

impl VaultError {
    /// True when retrying without external intervention cannot succeed.
    ///
    /// A failed refresh exchange may succeed later (the provider could be
    /// down); everything else requires a re-link or operator action.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, VaultError::RefreshFailed(_))
    }
}

/// Failures reported by provider adapters, classified for retry policy.
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Provider server error: {0}")]
    ServerError(String),

    #[error("Provider rate limited")]
    RateLimited { retry_after: Option<i64> },

    #[error("Authentication rejected: {0}")]
    Auth(String),

    #[error("Content rejected: {0}")]
    PolicyRejected(String),

    #[error("Account not connected")]
    NotConnected,

    #[error("Platform not supported: {0}")]
    Unsupported(String),
}

impl ProviderError {
    /// Whether a later attempt may succeed without external intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Network(_)
                | ProviderError::ServerError(_)
                | ProviderError::RateLimited { .. }
        )
    }

    /// Provider-supplied hint for the earliest useful retry, if any.
    pub fn retry_after(&self) -> Option<i64> {
        match self {
            ProviderError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_config_error() {
        let error = FanoutError::Config(ConfigError::MissingField("database.path".to_string()));
        assert_eq!(error.exit_code(), 2);
    }

    #[test]
    fn test_exit_code_invalid_input() {
        let error = FanoutError::InvalidInput("empty content".to_string());
        assert_eq!(error.exit_code(), 3);
    }

    #[test]
    fn test_exit_code_runtime_errors() {
        let provider = FanoutError::Provider(ProviderError::NotConnected);
        assert_eq!(provider.exit_code(), 1);

        let vault = FanoutError::Vault(VaultError::CorruptCredential);
        assert_eq!(vault.exit_code(), 1);

        assert_eq!(FanoutError::AlreadyPublished.exit_code(), 1);
    }

    #[test]
    fn test_provider_error_retryable_classification() {
        assert!(ProviderError::Network("timeout".to_string()).is_retryable());
        assert!(ProviderError::ServerError("502".to_string()).is_retryable());
        assert!(ProviderError::RateLimited { retry_after: None }.is_retryable());

        assert!(!ProviderError::Auth("bad token".to_string()).is_retryable());
        assert!(!ProviderError::PolicyRejected("spam".to_string()).is_retryable());
        assert!(!ProviderError::NotConnected.is_retryable());
        assert!(!ProviderError::Unsupported("x".to_string()).is_retryable());
    }

    #[test]
    fn test_provider_error_retry_after_hint() {
        let limited = ProviderError::RateLimited {
            retry_after: Some(1_700_000_000),
        };
        assert_eq!(limited.retry_after(), Some(1_700_000_000));
        assert_eq!(ProviderError::Network("x".to_string()).retry_after(), None);
    }

    #[test]
    fn test_vault_error_terminal_classification() {
        assert!(VaultError::TokenExpiredNoRefresh.is_terminal());
        assert!(VaultError::CorruptCredential.is_terminal());
        assert!(VaultError::NoAccount("a1".to_string()).is_terminal());
        assert!(!VaultError::RefreshFailed("503 from provider".to_string()).is_terminal());
    }

    #[test]
    fn test_error_message_formatting() {
        let error = FanoutError::Provider(ProviderError::Unsupported("telegram".to_string()));
        assert_eq!(
            format!("{}", error),
            "Provider error: Platform not supported: telegram"
        );

        let error = FanoutError::IllegalTransition {
            from: PostStatus::Published,
            to: PostStatus::Scheduled,
        };
        assert_eq!(
            format!("{}", error),
            "Illegal post transition: published -> scheduled"
        );
    }

    #[test]
    fn test_error_conversion_from_store_error() {
        let store_error = StoreError::Conflict("job claim".to_string());
        let error: FanoutError = store_error.into();
        assert!(matches!(error, FanoutError::Store(_)));
    }
}
