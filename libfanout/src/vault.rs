//! Credential vault
//!
//! Encrypts provider tokens at rest and hands out valid access tokens,
//! refreshing them before expiry. Plaintext tokens never cross this module's
//! boundary except as the return value of `get_valid_token` and the inputs
//! of `seal`/`store_tokens`.
//!
//! Encryption uses the `age` passphrase scheme (scrypt key derivation, a
//! fresh random salt per encryption, authenticated payload). The passphrase
//! is derived once from a process-wide secret via SHA-256 and held in a
//! `SecretString`. Ciphertext is base64-encoded for TEXT columns. A payload
//! that fails authentication on decrypt is a `CorruptCredential` error,
//! never silently ignored.

use std::io::{Read, Write};
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{Result, VaultError};
use crate::store::Store;

/// Safety margin before `token_expires_at` at which a refresh is forced.
const REFRESH_MARGIN_SECS: i64 = 60;

/// A fresh token pair returned by a provider's refresh exchange.
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    /// Some providers rotate the refresh token on every exchange.
    pub refresh_token: Option<String>,
    pub expires_at: Option<i64>,
}

/// Exchanges a refresh token with a provider for a fresh access token.
///
/// The vault owns when to refresh; implementations own how. Failures are
/// reported as `VaultError::RefreshFailed`.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(
        &self,
        provider: &str,
        refresh_token: &str,
    ) -> std::result::Result<RefreshedToken, VaultError>;
}

/// Refresher for deployments whose providers issue non-rotating tokens.
pub struct NoRefresher;

#[async_trait]
impl TokenRefresher for NoRefresher {
    async fn refresh(
        &self,
        provider: &str,
        _refresh_token: &str,
    ) -> std::result::Result<RefreshedToken, VaultError> {
        Err(VaultError::RefreshFailed(format!(
            "no token refresher configured for provider {}",
            provider
        )))
    }
}

#[derive(Clone)]
pub struct CredentialVault {
    store: Store,
    passphrase: SecretString,
    refresher: Arc<dyn TokenRefresher>,
}

impl CredentialVault {
    /// Derive the encryption passphrase from `secret` and bind the vault to
    /// a store and refresher. The derivation happens once; the raw secret is
    /// not retained.
    pub fn new(store: Store, secret: &str, refresher: Arc<dyn TokenRefresher>) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let passphrase = SecretString::from(BASE64.encode(digest));
        Self {
            store,
            passphrase,
            refresher,
        }
    }

    /// Encrypt a plaintext token for storage.
    pub fn seal(&self, plaintext: &str) -> std::result::Result<String, VaultError> {
        let encryptor = age::Encryptor::with_user_passphrase(age::secrecy::Secret::new(
            self.passphrase.expose_secret().to_string(),
        ));

        let mut encrypted = vec![];
        let mut writer = encryptor
            .wrap_output(&mut encrypted)
            .map_err(|e| VaultError::Encrypt(e.to_string()))?;
        writer
            .write_all(plaintext.as_bytes())
            .map_err(|e| VaultError::Encrypt(e.to_string()))?;
        writer
            .finish()
            .map_err(|e| VaultError::Encrypt(e.to_string()))?;

        Ok(BASE64.encode(encrypted))
    }

    /// Decrypt a stored token. Any failure past base64 framing means the
    /// ciphertext does not authenticate under our key.
    fn open(&self, encoded: &str) -> std::result::Result<String, VaultError> {
        let encrypted = BASE64
            .decode(encoded)
            .map_err(|_| VaultError::CorruptCredential)?;

        let decryptor = match age::Decryptor::new(&encrypted[..]) {
            Ok(age::Decryptor::Passphrase(d)) => d,
            Ok(_) | Err(_) => return Err(VaultError::CorruptCredential),
        };

        let mut decrypted = vec![];
        let mut reader = decryptor
            .decrypt(
                &age::secrecy::Secret::new(self.passphrase.expose_secret().to_string()),
                None,
            )
            .map_err(|_| VaultError::CorruptCredential)?;
        reader
            .read_to_end(&mut decrypted)
            .map_err(|_| VaultError::CorruptCredential)?;

        String::from_utf8(decrypted).map_err(|_| VaultError::CorruptCredential)
    }

    #[cfg(test)]
    pub(crate) fn open_for_tests(&self, encoded: &str) -> String {
        self.open(encoded).unwrap()
    }

    /// Encrypt and persist a token pair for an existing account, atomically.
    pub async fn store_tokens(
        &self,
        account_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: Option<i64>,
    ) -> Result<()> {
        let enc_access = self.seal(access_token)?;
        let enc_refresh = refresh_token.map(|t| self.seal(t)).transpose()?;

        let now = chrono::Utc::now().timestamp();
        let updated = self
            .store
            .update_account_tokens(account_id, &enc_access, enc_refresh.as_deref(), expires_at, now)
            .await?;

        if !updated {
            return Err(VaultError::NoAccount(account_id.to_string()).into());
        }
        Ok(())
    }

    /// Return a valid access token for the account, refreshing first when
    /// the stored one is expired or inside the safety margin.
    ///
    /// A token with no recorded expiry and no refresh token is treated as
    /// non-expiring. A stale token with no refresh token is a terminal
    /// `TokenExpiredNoRefresh`.
    pub async fn get_valid_token(&self, account_id: &str) -> Result<String> {
        let account = self
            .store
            .get_account(account_id)
            .await?
            .ok_or_else(|| VaultError::NoAccount(account_id.to_string()))?;

        let now = chrono::Utc::now().timestamp();
        let stale = match account.token_expires_at {
            Some(expires_at) => expires_at - now <= REFRESH_MARGIN_SECS,
            None => account.encrypted_refresh_token.is_some(),
        };

        if !stale {
            return Ok(self.open(&account.encrypted_access_token)?);
        }

        let Some(enc_refresh) = account.encrypted_refresh_token.as_deref() else {
            return Err(VaultError::TokenExpiredNoRefresh.into());
        };

        let refresh_token = Zeroizing::new(self.open(enc_refresh)?);
        tracing::debug!(account_id, provider = %account.provider, "refreshing access token");

        let refreshed = self
            .refresher
            .refresh(&account.provider, &refresh_token)
            .await?;

        // Providers that do not rotate the refresh token keep the old one.
        let enc_access = self.seal(&refreshed.access_token)?;
        let enc_new_refresh = match refreshed.refresh_token.as_deref() {
            Some(rotated) => Some(self.seal(rotated)?),
            None => Some(enc_refresh.to_string()),
        };

        self.store
            .update_account_tokens(
                account_id,
                &enc_access,
                enc_new_refresh.as_deref(),
                refreshed.expires_at,
                chrono::Utc::now().timestamp(),
            )
            .await?;

        Ok(refreshed.access_token)
    }
}
