//! Core Data Models
//!
//! This module defines the primary data structures used throughout the usage
//! reliability pipeline. The data flows through these models in the following
//! sequence:
//!
//! 1. **Credentials**: [`CredentialBlob`] / [`OauthCredentials`] - the stored
//!    OAuth credential entry, read and written by the token lifecycle
//! 2. **Snapshot**: [`UsageSnapshot`] - one immutable reading per poll cycle,
//!    tagged with its origin
//! 3. **History**: [`UsageDataPoint`] - the persisted time-series form of a
//!    snapshot, owned exclusively by the history store
//!
//! Alongside the pipeline types, [`DataSourceState`] and [`RetryState`] carry
//! the per-source availability and failure bookkeeping the engine maintains
//! across cycles.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Scopes a freshly issued token is expected to carry.
pub const DEFAULT_SCOPES: &[&str] = &["user:inference", "user:profile"];

/// Stored credential entry, keyed per account in the credential store.
///
/// The wire shape is `{ "claudeAiOauth": { ... } }`, matching what the
/// external login flow writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialBlob {
    #[serde(rename = "claudeAiOauth")]
    pub claude_ai_oauth: OauthCredentials,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OauthCredentials {
    pub access_token: String,
    pub refresh_token: String,
    /// Epoch milliseconds.
    pub expires_at: i64,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl OauthCredentials {
    /// Manual-entry path: the user pasted a token by hand, so there is no
    /// server-issued expiry. Synthesizes a far-future one (one year) and the
    /// default scope set.
    pub fn manual(access_token: String, refresh_token: String, now: DateTime<Utc>) -> Self {
        Self {
            access_token,
            refresh_token,
            expires_at: now.timestamp_millis() + 365 * 24 * 60 * 60 * 1000,
            scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }

    pub fn expires_at_utc(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.expires_at).single()
    }
}

/// Origin of a usage reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceTag {
    Remote,
    LocalLog,
    None,
}

impl std::fmt::Display for SourceTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceTag::Remote => write!(f, "remote"),
            SourceTag::LocalLog => write!(f, "local-log"),
            SourceTag::None => write!(f, "none"),
        }
    }
}

/// One rate-limit window as reported by the remote endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateWindow {
    /// Percent utilization, 0-100.
    pub utilization: f64,
    pub resets_at: Option<DateTime<Utc>>,
}

/// Raw token counters accumulated from local session logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
}

impl TokenTotals {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_creation_tokens + self.cache_read_tokens
    }

    pub fn accumulate(&mut self, other: &TokenTotals) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_creation_tokens += other.cache_creation_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
    }
}

/// Aggregate produced by one local log scan.
///
/// `skipped_lines` counts unparseable or irrelevant lines and exists for
/// diagnostics only.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregateUsage {
    pub tokens: TokenTotals,
    pub records: usize,
    pub skipped_lines: usize,
    pub files_scanned: usize,
}

/// One immutable usage reading, produced once per successful poll cycle.
///
/// A remote reading carries utilization windows and no token counters; a
/// local-log reading carries token counters and no utilization. An absent
/// percentage stays absent - it is never substituted with a clamped number.
#[derive(Debug, Clone, Serialize)]
pub struct UsageSnapshot {
    pub account_id: String,
    pub taken_at: DateTime<Utc>,
    pub source: SourceTag,
    /// Five-hour window.
    pub primary: Option<RateWindow>,
    /// Seven-day window.
    pub secondary: Option<RateWindow>,
    /// Seven-day Opus window.
    pub opus: Option<RateWindow>,
    pub tokens: Option<TokenTotals>,
}

impl UsageSnapshot {
    pub fn from_local(
        account_id: &str,
        aggregate: &AggregateUsage,
        taken_at: DateTime<Utc>,
    ) -> Self {
        Self {
            account_id: account_id.to_string(),
            taken_at,
            source: SourceTag::LocalLog,
            primary: None,
            secondary: None,
            opus: None,
            tokens: Some(aggregate.tokens),
        }
    }

    /// Persisted form of this snapshot, or `None` when there is no
    /// utilization percentage to record (local-log readings).
    pub fn to_data_point(&self) -> Option<UsageDataPoint> {
        let primary = self.primary?;
        Some(UsageDataPoint {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: self.taken_at,
            primary_percentage: primary.utilization,
            secondary_percentage: self.secondary.map(|w| w.utilization),
            source: self.source,
        })
    }
}

/// Persisted time-series point, owned exclusively by the history store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageDataPoint {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub primary_percentage: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_percentage: Option<f64>,
    #[serde(rename = "sourceTag")]
    pub source: SourceTag,
}

/// Per-source availability, mutated only by the engine after each attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DataSourceState {
    Available,
    Failed(String),
    Disabled,
    NotConfigured,
}

impl std::fmt::Display for DataSourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataSourceState::Available => write!(f, "available"),
            DataSourceState::Failed(reason) => write!(f, "failed: {reason}"),
            DataSourceState::Disabled => write!(f, "disabled"),
            DataSourceState::NotConfigured => write!(f, "not configured"),
        }
    }
}

/// Failure bookkeeping across poll cycles. Process-lifetime state, cleared
/// only by a successful fetch or an explicit manual reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryState {
    pub remote_failures: u32,
    pub local_failures: u32,
    pub total_failures: u32,
    pub circuit_open: bool,
}
