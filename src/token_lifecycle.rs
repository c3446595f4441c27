//! Token lifecycle management.
//!
//! Reads the stored credential blob, decides whether the access token is
//! still usable, and performs the OAuth refresh when it is not. A token that
//! expires within the proactive buffer is treated as already expired so
//! callers refresh ahead of the server's own clock instead of racing it.
//!
//! Refreshed credentials are written back to the credential store. The store
//! entry is shared with an external process, so the write-back is
//! best-effort: losing that race costs nothing beyond an extra refresh on a
//! later cycle.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::credentials::{CredentialError, CredentialStore};
use crate::models::{CredentialBlob, OauthCredentials};

/// Lead time before nominal expiry at which a token counts as expired.
pub const PROACTIVE_BUFFER_MS: i64 = 10 * 60 * 1000;

/// Successful body of the token refresh endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshResponse {
    pub access_token: String,
    pub refresh_token: String,
    /// Seconds until the new access token expires.
    pub expires_in: i64,
}

/// Seam between the engine's remote source and the token lifecycle, so the
/// refresh-aware fetch path can be exercised without a credential file or a
/// token endpoint.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// A token valid beyond the proactive buffer, or the typed reason there
    /// is none.
    async fn usable_token(&self, account_id: &str) -> Result<String, CredentialError>;

    /// Exchange the stored refresh token for fresh credentials.
    async fn refresh(&self, account_id: &str) -> Result<OauthCredentials, CredentialError>;
}

pub struct TokenLifecycleManager {
    store: Arc<dyn CredentialStore>,
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    required_scopes: Vec<String>,
}

impl TokenLifecycleManager {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        client: reqwest::Client,
        token_url: String,
        client_id: String,
        required_scopes: Vec<String>,
    ) -> Self {
        Self {
            store,
            client,
            token_url,
            client_id,
            required_scopes,
        }
    }

    /// Load and decode the stored blob. Absent or malformed both read as
    /// "no credentials" - a malformed entry cannot be refreshed either.
    fn load(&self, account_id: &str) -> Result<OauthCredentials, CredentialError> {
        let raw = self
            .store
            .read(account_id)?
            .ok_or(CredentialError::NoCredentials)?;

        match serde_json::from_str::<CredentialBlob>(&raw) {
            Ok(blob) => Ok(blob.claude_ai_oauth),
            Err(e) => {
                debug!(account = account_id, error = %e, "Stored credential blob is malformed");
                Err(CredentialError::NoCredentials)
            }
        }
    }

    /// Scope and expiry validation. Scope is checked first: a missing scope
    /// is non-retryable, and refreshing an expired token will not grant it.
    fn validate(&self, creds: &OauthCredentials, now: DateTime<Utc>) -> Result<(), CredentialError> {
        for scope in &self.required_scopes {
            if !creds.has_scope(scope) {
                return Err(CredentialError::InsufficientScope(scope.clone()));
            }
        }

        if creds.expires_at - now.timestamp_millis() <= PROACTIVE_BUFFER_MS {
            return Err(CredentialError::Expired);
        }

        Ok(())
    }

    pub fn get_usable_token(&self, account_id: &str) -> Result<String, CredentialError> {
        let creds = self.load(account_id)?;
        self.validate(&creds, Utc::now())?;
        Ok(creds.access_token)
    }

    async fn refresh_inner(&self, account_id: &str) -> Result<OauthCredentials, CredentialError> {
        let creds = self.load(account_id)?;

        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", creds.refresh_token.as_str()),
                ("client_id", self.client_id.as_str()),
            ])
            .send()
            .await
            .map_err(|e| CredentialError::RefreshFailed(format!("transport: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CredentialError::RefreshFailed(format!(
                "token endpoint returned HTTP {}",
                status.as_u16()
            )));
        }

        let body: RefreshResponse = response
            .json()
            .await
            .map_err(|e| CredentialError::RefreshFailed(format!("decode: {e}")))?;

        let updated = apply_refresh(&creds, &body, Utc::now());

        // Write-back may race with the external owner of this entry; losing
        // costs one extra refresh later, so a failed write is not an error.
        let blob = CredentialBlob {
            claude_ai_oauth: updated.clone(),
        };
        match serde_json::to_string(&blob) {
            Ok(serialized) => {
                if let Err(e) = self.store.write(account_id, &serialized) {
                    warn!(account = account_id, error = %e, "Credential write-back failed; continuing with in-memory credentials");
                }
            }
            Err(e) => {
                warn!(account = account_id, error = %e, "Could not serialize refreshed credentials for write-back");
            }
        }

        info!(
            account = account_id,
            expires_at = updated.expires_at,
            "Refreshed access token"
        );

        Ok(updated)
    }
}

/// New credentials from a refresh response. Scopes carry over unchanged;
/// `expires_at` is recomputed from `expires_in` relative to `now`.
pub fn apply_refresh(
    creds: &OauthCredentials,
    response: &RefreshResponse,
    now: DateTime<Utc>,
) -> OauthCredentials {
    OauthCredentials {
        access_token: response.access_token.clone(),
        refresh_token: response.refresh_token.clone(),
        expires_at: now.timestamp_millis() + response.expires_in * 1000,
        scopes: creds.scopes.clone(),
    }
}

#[async_trait]
impl TokenProvider for TokenLifecycleManager {
    async fn usable_token(&self, account_id: &str) -> Result<String, CredentialError> {
        self.get_usable_token(account_id)
    }

    async fn refresh(&self, account_id: &str) -> Result<OauthCredentials, CredentialError> {
        self.refresh_inner(account_id).await
    }
}
