//! Local session log scanner.
//!
//! The fallback usage source. Walks the per-project log directories under
//! the Claude home, picks files modified inside the scan window, and parses
//! each file line by line as independent JSON records. Session logs get
//! truncated, hand-edited, and written concurrently, so a line that fails to
//! decode or has the wrong shape is skipped, never fatal; a skip counter is
//! kept for diagnostics.
//!
//! This source counts raw tokens. The log has no notion of a rate limit, so
//! the resulting snapshot never carries a utilization percentage.

use std::fs::{metadata, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use glob::glob;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, trace};

use async_trait::async_trait;

use crate::models::{AggregateUsage, TokenTotals, UsageSnapshot};
use crate::sources::{SourceKind, UsageSource};

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("log directory not found: {0}")]
    NoLogDirectory(PathBuf),
    #[error("no log files modified in the scan window")]
    NoLogFiles,
}

/// One log line, decoded strictly. Anything that does not fit this shape is
/// skipped rather than coerced - the tolerance lives in the skip, not in
/// loose typing.
#[derive(Debug, Deserialize)]
struct LogRecord {
    #[serde(rename = "type")]
    record_type: String,
    message: Option<LogMessage>,
}

#[derive(Debug, Deserialize)]
struct LogMessage {
    usage: Option<LogUsage>,
}

#[derive(Debug, Deserialize)]
struct LogUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
}

pub struct LocalLogScanner {
    projects_dir: PathBuf,
}

impl LocalLogScanner {
    pub fn new(claude_home: impl Into<PathBuf>) -> Self {
        Self {
            projects_dir: claude_home.into().join("projects"),
        }
    }

    /// Aggregate token usage from log files modified after `since`.
    pub fn scan_recent(&self, since: DateTime<Utc>) -> Result<AggregateUsage, ScanError> {
        if !self.projects_dir.exists() {
            return Err(ScanError::NoLogDirectory(self.projects_dir.clone()));
        }

        let files = self.find_recent_files(since);
        if files.is_empty() {
            return Err(ScanError::NoLogFiles);
        }

        let mut aggregate = AggregateUsage::default();
        for path in &files {
            self.scan_file(path, &mut aggregate);
            aggregate.files_scanned += 1;
        }

        debug!(
            files = aggregate.files_scanned,
            records = aggregate.records,
            skipped = aggregate.skipped_lines,
            total_tokens = aggregate.tokens.total(),
            "Local log scan complete"
        );

        Ok(aggregate)
    }

    /// Per-project log files with a modification time after `since`.
    fn find_recent_files(&self, since: DateTime<Utc>) -> Vec<PathBuf> {
        let mut files = Vec::new();

        let pattern = self.projects_dir.join("*").join("*.jsonl");
        if let Ok(paths) = glob(&pattern.to_string_lossy()) {
            for entry in paths.flatten() {
                if let Ok(meta) = metadata(&entry) {
                    if let Ok(modified) = meta.modified() {
                        if DateTime::<Utc>::from(modified) > since {
                            files.push(entry);
                        }
                    }
                }
            }
        }

        files
    }

    /// Accumulate one file into the aggregate. Unreadable files and bad
    /// lines are skipped; a truncated tail never aborts the scan.
    fn scan_file(&self, path: &Path, aggregate: &mut AggregateUsage) {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) => {
                debug!(file = %path.display(), error = %e, "Skipping unreadable log file");
                return;
            }
        };

        for line in BufReader::new(file).lines() {
            let line = match line {
                Ok(l) => l,
                // Mid-file read error: count it and keep what we have.
                Err(_) => {
                    aggregate.skipped_lines += 1;
                    break;
                }
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match parse_usage_line(line) {
                Some(tokens) => {
                    aggregate.tokens.accumulate(&tokens);
                    aggregate.records += 1;
                }
                None => {
                    trace!(file = %path.display(), "Skipping non-usage log line");
                    aggregate.skipped_lines += 1;
                }
            }
        }
    }
}

/// Token counters from one log line, or `None` for anything that is not an
/// assistant record with usage data.
fn parse_usage_line(line: &str) -> Option<TokenTotals> {
    let record: LogRecord = serde_json::from_str(line).ok()?;
    if record.record_type != "assistant" {
        return None;
    }
    let usage = record.message?.usage?;
    Some(TokenTotals {
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        cache_creation_tokens: usage.cache_creation_input_tokens,
        cache_read_tokens: usage.cache_read_input_tokens,
    })
}

/// [`UsageSource`] adapter over the scanner with a fixed look-back window.
pub struct LocalLogSource {
    scanner: LocalLogScanner,
    lookback: Duration,
}

impl LocalLogSource {
    pub fn new(scanner: LocalLogScanner, lookback: Duration) -> Self {
        Self { scanner, lookback }
    }
}

#[async_trait]
impl UsageSource for LocalLogSource {
    fn kind(&self) -> SourceKind {
        SourceKind::LocalLog
    }

    async fn fetch(&self, account_id: &str) -> anyhow::Result<UsageSnapshot> {
        let now = Utc::now();
        let aggregate = self.scanner.scan_recent(now - self.lookback)?;
        Ok(UsageSnapshot::from_local(account_id, &aggregate, now))
    }
}
