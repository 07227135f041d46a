//! Account linking operations
//!
//! The library side of the OAuth completion flow: raw tokens arrive here
//! once, get sealed by the vault, and are persisted as ciphertext. Linking
//! the same `(workspace, provider, external_id)` identity again updates the
//! existing binding instead of duplicating it.

use crate::error::{FanoutError, Result};
use crate::store::Store;
use crate::types::SocialAccount;
use crate::vault::CredentialVault;

/// Input from a completed OAuth exchange.
#[derive(Debug, Clone, Default)]
pub struct LinkAccountRequest {
    pub workspace_id: String,
    pub provider: String,
    /// Provider-assigned identity (e.g. the fediverse handle).
    pub external_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<i64>,
    pub meta: Option<serde_json::Value>,
}

#[derive(Clone)]
pub struct AccountService {
    store: Store,
    vault: CredentialVault,
}

impl AccountService {
    pub fn new(store: Store, vault: CredentialVault) -> Self {
        Self { store, vault }
    }

    /// Bind (or re-bind) a provider identity to a workspace, encrypting the
    /// tokens before anything touches the store.
    pub async fn link_account(&self, request: LinkAccountRequest) -> Result<SocialAccount> {
        if request.provider.trim().is_empty() || request.external_id.trim().is_empty() {
            return Err(FanoutError::InvalidInput(
                "provider and external_id are required".to_string(),
            ));
        }
        if request.access_token.is_empty() {
            return Err(FanoutError::InvalidInput(
                "access_token is required".to_string(),
            ));
        }

        let mut account = SocialAccount::new(
            request.workspace_id,
            request.provider,
            request.external_id,
        );
        account.encrypted_access_token = self.vault.seal(&request.access_token)?;
        account.encrypted_refresh_token = request
            .refresh_token
            .as_deref()
            .map(|t| self.vault.seal(t))
            .transpose()?;
        account.token_expires_at = request.expires_at;
        account.meta = request
            .meta
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| FanoutError::InvalidInput(format!("meta is not valid JSON: {}", e)))?;

        self.store.upsert_account(&account).await
    }

    pub async fn get_account(&self, account_id: &str) -> Result<SocialAccount> {
        self.store
            .get_account(account_id)
            .await?
            .ok_or_else(|| FanoutError::NotFound(account_id.to_string()))
    }

    pub async fn list_accounts(&self, workspace_id: &str) -> Result<Vec<SocialAccount>> {
        self.store.list_accounts(workspace_id).await
    }

    pub async fn unlink_account(&self, account_id: &str) -> Result<()> {
        if !self.store.delete_account(account_id).await? {
            return Err(FanoutError::NotFound(account_id.to_string()));
        }
        Ok(())
    }
}
