use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use claude_sentinel::credentials::{CredentialError, CredentialStore, FileCredentialStore};
use claude_sentinel::models::{CredentialBlob, OauthCredentials, SourceTag};
use claude_sentinel::remote::{FetchError, RemoteSource, UsageFetcher, UsageResponse, WindowBody};
use claude_sentinel::token_lifecycle::{TokenLifecycleManager, TokenProvider};

/// A token provider whose first `usable_token` answer and refresh behavior
/// are scripted, with call counting.
struct MockTokenProvider {
    usable_result: Result<String, CredentialError>,
    usable_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    refresh_fails: bool,
}

impl MockTokenProvider {
    fn valid(token: &str) -> Self {
        Self {
            usable_result: Ok(token.to_string()),
            usable_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            refresh_fails: false,
        }
    }

    fn expired() -> Self {
        Self {
            usable_result: Err(CredentialError::Expired),
            usable_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            refresh_fails: false,
        }
    }

    fn insufficient_scope() -> Self {
        Self {
            usable_result: Err(CredentialError::InsufficientScope("user:inference".into())),
            usable_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            refresh_fails: false,
        }
    }
}

#[async_trait]
impl TokenProvider for MockTokenProvider {
    async fn usable_token(&self, _account_id: &str) -> Result<String, CredentialError> {
        self.usable_calls.fetch_add(1, Ordering::SeqCst);
        match &self.usable_result {
            Ok(token) => Ok(token.clone()),
            Err(CredentialError::Expired) => Err(CredentialError::Expired),
            Err(CredentialError::InsufficientScope(s)) => {
                Err(CredentialError::InsufficientScope(s.clone()))
            }
            Err(_) => Err(CredentialError::NoCredentials),
        }
    }

    async fn refresh(&self, _account_id: &str) -> Result<OauthCredentials, CredentialError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if self.refresh_fails {
            return Err(CredentialError::RefreshFailed("simulated".into()));
        }
        Ok(OauthCredentials {
            access_token: "refreshed-token".to_string(),
            refresh_token: "refreshed-refresh".to_string(),
            expires_at: Utc::now().timestamp_millis() + 8 * 60 * 60 * 1000,
            scopes: vec!["user:inference".to_string()],
        })
    }
}

/// A usage fetcher that rejects the first N tokens as expired, then serves a
/// fixed utilization.
struct MockFetcher {
    reject_first: AtomicUsize,
    calls: AtomicUsize,
    utilization: f64,
}

impl MockFetcher {
    fn accepting(utilization: f64) -> Self {
        Self {
            reject_first: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            utilization,
        }
    }

    fn rejecting_first(n: usize, utilization: f64) -> Self {
        Self {
            reject_first: AtomicUsize::new(n),
            calls: AtomicUsize::new(0),
            utilization,
        }
    }
}

#[async_trait]
impl UsageFetcher for MockFetcher {
    async fn fetch_usage(&self, _access_token: &str) -> Result<UsageResponse, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.reject_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.reject_first.store(remaining - 1, Ordering::SeqCst);
            return Err(FetchError::TokenExpired);
        }
        Ok(UsageResponse {
            five_hour: Some(WindowBody {
                utilization: self.utilization,
                resets_at: None,
            }),
            seven_day: None,
            seven_day_opus: None,
        })
    }
}

fn manager_for(dir: &tempfile::TempDir) -> TokenLifecycleManager {
    TokenLifecycleManager::new(
        Arc::new(FileCredentialStore::new(dir.path())),
        reqwest::Client::new(),
        "http://localhost:9/token".to_string(),
        "client-id".to_string(),
        vec!["user:inference".to_string()],
    )
}

fn store_creds(dir: &tempfile::TempDir, expires_at: i64) {
    let store = FileCredentialStore::new(dir.path());
    let blob = CredentialBlob {
        claude_ai_oauth: OauthCredentials {
            access_token: "stored-token".into(),
            refresh_token: "stored-refresh".into(),
            expires_at,
            scopes: vec!["user:inference".into()],
        },
    };
    store
        .write("default", &serde_json::to_string(&blob).unwrap())
        .unwrap();
}

#[test]
fn token_expiring_within_buffer_is_never_returned() {
    let dir = tempfile::TempDir::new().unwrap();
    // Nominally valid for nine more minutes: inside the ten-minute buffer.
    store_creds(&dir, Utc::now().timestamp_millis() + 9 * 60 * 1000);

    let manager = manager_for(&dir);
    assert!(matches!(
        manager.get_usable_token("default"),
        Err(CredentialError::Expired)
    ));
}

#[test]
fn token_expired_a_second_ago_is_expired() {
    let dir = tempfile::TempDir::new().unwrap();
    store_creds(&dir, Utc::now().timestamp_millis() - 1000);

    let manager = manager_for(&dir);
    assert!(matches!(
        manager.get_usable_token("default"),
        Err(CredentialError::Expired)
    ));
}

#[tokio::test]
async fn expired_token_refreshes_before_the_fetch() {
    let tokens = Arc::new(MockTokenProvider::expired());
    let fetcher = Arc::new(MockFetcher::accepting(37.0));
    let source = RemoteSource::new(tokens.clone(), fetcher.clone());

    let snapshot = claude_sentinel::sources::UsageSource::fetch(&source, "default")
        .await
        .unwrap();

    // The caller sees a valid snapshot; the refresh happened underneath.
    assert_eq!(snapshot.source, SourceTag::Remote);
    assert_eq!(snapshot.primary.unwrap().utilization, 37.0);
    assert_eq!(tokens.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn server_side_rejection_gets_exactly_one_refresh_and_retry() {
    let tokens = Arc::new(MockTokenProvider::valid("stale-but-plausible"));
    let fetcher = Arc::new(MockFetcher::rejecting_first(1, 64.0));
    let source = RemoteSource::new(tokens.clone(), fetcher.clone());

    let snapshot = claude_sentinel::sources::UsageSource::fetch(&source, "default")
        .await
        .unwrap();

    assert_eq!(snapshot.primary.unwrap().utilization, 64.0);
    assert_eq!(tokens.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn persistent_rejection_propagates_after_one_retry() {
    let tokens = Arc::new(MockTokenProvider::valid("rejected"));
    let fetcher = Arc::new(MockFetcher::rejecting_first(usize::MAX, 0.0));
    let source = RemoteSource::new(tokens.clone(), fetcher.clone());

    let result = claude_sentinel::sources::UsageSource::fetch(&source, "default").await;

    assert!(result.is_err());
    // Bounded to one refresh-and-retry cycle: two fetches, one refresh.
    assert_eq!(tokens.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn insufficient_scope_is_not_refreshed() {
    let tokens = Arc::new(MockTokenProvider::insufficient_scope());
    let fetcher = Arc::new(MockFetcher::accepting(10.0));
    let source = RemoteSource::new(tokens.clone(), fetcher.clone());

    let result = claude_sentinel::sources::UsageSource::fetch(&source, "default").await;

    assert!(result.is_err());
    // Refreshing cannot grant a missing scope, so nothing was attempted.
    assert_eq!(tokens.refresh_calls.load(Ordering::SeqCst), 0);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failed_refresh_terminates_the_fetch_attempt() {
    let mut provider = MockTokenProvider::expired();
    provider.refresh_fails = true;
    let tokens = Arc::new(provider);
    let fetcher = Arc::new(MockFetcher::accepting(10.0));
    let source = RemoteSource::new(tokens.clone(), fetcher.clone());

    let result = claude_sentinel::sources::UsageSource::fetch(&source, "default").await;

    assert!(result.is_err());
    assert_eq!(tokens.refresh_calls.load(Ordering::SeqCst), 1);
    // The fetch never ran without a usable token.
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
}
