//! Remote usage endpoint client.
//!
//! [`RemoteUsageClient`] issues the single authenticated GET against the
//! usage endpoint and maps HTTP outcomes to typed errors. [`RemoteSource`]
//! composes it with the token lifecycle: proactive refresh before the
//! request, and exactly one refresh-and-retry cycle if the server rejects a
//! token the lifecycle considered valid. Retry depth is bounded at one so a
//! misbehaving server cannot drive a refresh loop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::credentials::CredentialError;
use crate::models::{RateWindow, SourceTag, UsageSnapshot};
use crate::sources::{SourceKind, UsageSource};
use crate::token_lifecycle::TokenProvider;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("access token rejected by the usage endpoint")]
    TokenExpired,
    #[error("token lacks permission for the usage endpoint")]
    InsufficientScope,
    #[error("usage endpoint returned HTTP {0}")]
    Http(u16),
    #[error("network: {0}")]
    Network(String),
    #[error(transparent)]
    Credential(#[from] CredentialError),
}

/// Response body of the usage endpoint. Every window is optional; the
/// server omits the ones the account's plan does not have.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UsageResponse {
    pub five_hour: Option<WindowBody>,
    pub seven_day: Option<WindowBody>,
    pub seven_day_opus: Option<WindowBody>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WindowBody {
    pub utilization: f64,
    #[serde(default)]
    pub resets_at: Option<DateTime<Utc>>,
}

impl From<WindowBody> for RateWindow {
    fn from(body: WindowBody) -> Self {
        RateWindow {
            utilization: body.utilization,
            resets_at: body.resets_at,
        }
    }
}

impl UsageResponse {
    pub fn into_snapshot(self, account_id: &str, taken_at: DateTime<Utc>) -> UsageSnapshot {
        UsageSnapshot {
            account_id: account_id.to_string(),
            taken_at,
            source: SourceTag::Remote,
            primary: self.five_hour.map(Into::into),
            secondary: self.seven_day.map(Into::into),
            opus: self.seven_day_opus.map(Into::into),
            tokens: None,
        }
    }
}

/// Seam between [`RemoteSource`] and the HTTP transport.
#[async_trait]
pub trait UsageFetcher: Send + Sync {
    async fn fetch_usage(&self, access_token: &str) -> Result<UsageResponse, FetchError>;
}

pub struct RemoteUsageClient {
    client: reqwest::Client,
    usage_url: String,
    beta_header: String,
}

impl RemoteUsageClient {
    pub fn new(usage_url: String, beta_header: String, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            usage_url,
            beta_header,
        })
    }
}

#[async_trait]
impl UsageFetcher for RemoteUsageClient {
    async fn fetch_usage(&self, access_token: &str) -> Result<UsageResponse, FetchError> {
        let response = self
            .client
            .get(&self.usage_url)
            .header("Authorization", format!("Bearer {access_token}"))
            .header("anthropic-beta", &self.beta_header)
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        match response.status().as_u16() {
            200..=299 => response
                .json::<UsageResponse>()
                .await
                .map_err(|e| FetchError::Network(format!("decode: {e}"))),
            401 => Err(FetchError::TokenExpired),
            403 => Err(FetchError::InsufficientScope),
            code => Err(FetchError::Http(code)),
        }
    }
}

/// The refresh-aware primary source.
pub struct RemoteSource {
    tokens: Arc<dyn TokenProvider>,
    fetcher: Arc<dyn UsageFetcher>,
}

impl RemoteSource {
    pub fn new(tokens: Arc<dyn TokenProvider>, fetcher: Arc<dyn UsageFetcher>) -> Self {
        Self { tokens, fetcher }
    }

    async fn fetch_with_token_refresh(&self, account_id: &str) -> Result<UsageResponse, FetchError> {
        let token = match self.tokens.usable_token(account_id).await {
            Ok(token) => token,
            Err(e) if e.is_refreshable() => {
                debug!(account = account_id, "Token inside proactive buffer, refreshing before fetch");
                self.tokens.refresh(account_id).await?.access_token
            }
            Err(e) => return Err(e.into()),
        };

        match self.fetcher.fetch_usage(&token).await {
            Ok(body) => Ok(body),
            Err(FetchError::TokenExpired) => {
                // The server disagreed with our expiry math. One refresh, one
                // retry; if the fresh token is also rejected the failure
                // propagates to the engine.
                warn!(account = account_id, "Server rejected token, refreshing once and retrying");
                let fresh = self.tokens.refresh(account_id).await?;
                self.fetcher.fetch_usage(&fresh.access_token).await
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl UsageSource for RemoteSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Remote
    }

    async fn fetch(&self, account_id: &str) -> anyhow::Result<UsageSnapshot> {
        let body = self.fetch_with_token_refresh(account_id).await?;
        Ok(body.into_snapshot(account_id, Utc::now()))
    }
}
