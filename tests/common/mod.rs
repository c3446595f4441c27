#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::TempDir;

use claude_sentinel::config::HistoryConfig;
use claude_sentinel::history::HistoryStore;
use claude_sentinel::models::{RateWindow, SourceTag, UsageDataPoint, UsageSnapshot};
use claude_sentinel::sources::{SourceKind, UsageSource};

pub fn create_test_jsonl(dir: &Path, filename: &str, content: &str) -> Result<()> {
    let file_path = dir.join(filename);
    fs::write(&file_path, content)?;
    Ok(())
}

/// A Claude home with one project directory, ready for log files.
pub fn setup_claude_home() -> Result<(TempDir, std::path::PathBuf)> {
    let home = TempDir::new()?;
    let project_dir = home.path().join("projects").join("-home-user-project");
    fs::create_dir_all(&project_dir)?;
    Ok((home, project_dir))
}

pub fn history_store(dir: &Path) -> HistoryStore {
    HistoryStore::new(
        dir,
        &HistoryConfig {
            retention_days: 90,
            recent_window_days: 7,
            downsample_interval_secs: 3600,
        },
    )
}

pub fn remote_point(timestamp: DateTime<Utc>, primary: f64) -> UsageDataPoint {
    UsageDataPoint {
        id: uuid_like(timestamp, primary),
        timestamp,
        primary_percentage: primary,
        secondary_percentage: None,
        source: SourceTag::Remote,
    }
}

fn uuid_like(timestamp: DateTime<Utc>, primary: f64) -> String {
    format!("test-{}-{}", timestamp.timestamp_millis(), primary)
}

/// A scripted [`UsageSource`] that counts calls and can be flipped between
/// success and failure mid-test.
pub struct MockSource {
    kind: SourceKind,
    succeed: AtomicBool,
    calls: AtomicUsize,
    utilization: f64,
}

impl MockSource {
    pub fn remote(utilization: f64) -> Arc<Self> {
        Arc::new(Self {
            kind: SourceKind::Remote,
            succeed: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
            utilization,
        })
    }

    pub fn local() -> Arc<Self> {
        Arc::new(Self {
            kind: SourceKind::LocalLog,
            succeed: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
            utilization: 0.0,
        })
    }

    pub fn set_succeed(&self, succeed: bool) {
        self.succeed.store(succeed, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UsageSource for MockSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn fetch(&self, account_id: &str) -> Result<UsageSnapshot> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.succeed.load(Ordering::SeqCst) {
            anyhow::bail!("simulated {} outage", self.kind);
        }

        let snapshot = match self.kind {
            SourceKind::Remote => UsageSnapshot {
                account_id: account_id.to_string(),
                taken_at: Utc::now(),
                source: SourceTag::Remote,
                primary: Some(RateWindow {
                    utilization: self.utilization,
                    resets_at: None,
                }),
                secondary: None,
                opus: None,
                tokens: None,
            },
            SourceKind::LocalLog => UsageSnapshot {
                account_id: account_id.to_string(),
                taken_at: Utc::now(),
                source: SourceTag::LocalLog,
                primary: None,
                secondary: None,
                opus: None,
                tokens: Some(Default::default()),
            },
        };
        Ok(snapshot)
    }
}
