//! Historical usage store.
//!
//! Persists every percentage-bearing snapshot as a time-series point, one
//! JSON array file per account, and bounds growth with a two-stage
//! lifecycle: points older than the retention horizon are dropped on every
//! append, and points older than the recent window are collapsed to one
//! averaged point per calendar hour. The resident series stays small (seven
//! days at full cadence plus roughly one point per hour for the remainder of
//! the retention horizon), so a full-series read-modify-write per mutation
//! is cheap.
//!
//! Partitions are independent: mutations on one account's series never block
//! another's.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::HistoryConfig;
use crate::models::UsageDataPoint;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history io: {0}")]
    Io(#[from] std::io::Error),
    #[error("history encode: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Default)]
struct Partition {
    points: Vec<UsageDataPoint>,
    loaded: bool,
    last_downsample: Option<DateTime<Utc>>,
}

pub struct HistoryStore {
    dir: PathBuf,
    retention: Duration,
    recent_window: Duration,
    downsample_interval: Duration,
    partitions: DashMap<String, Arc<Mutex<Partition>>>,
}

impl HistoryStore {
    pub fn new(dir: impl Into<PathBuf>, config: &HistoryConfig) -> Self {
        Self {
            dir: dir.into(),
            retention: Duration::days(config.retention_days),
            recent_window: Duration::days(config.recent_window_days),
            downsample_interval: Duration::seconds(config.downsample_interval_secs),
            partitions: DashMap::new(),
        }
    }

    fn partition(&self, account_id: &str) -> Arc<Mutex<Partition>> {
        self.partitions
            .entry(account_id.to_string())
            .or_default()
            .clone()
    }

    fn file_path(&self, account_id: &str) -> PathBuf {
        self.dir.join(format!("{account_id}.json"))
    }

    /// Append one point, enforcing the retention horizon in the same pass.
    pub async fn append(
        &self,
        account_id: &str,
        point: UsageDataPoint,
    ) -> Result<(), HistoryError> {
        let partition = self.partition(account_id);
        let mut guard = partition.lock().await;
        self.ensure_loaded(account_id, &mut guard);

        guard.points.push(point);
        guard.points.sort_by_key(|p| p.timestamp);

        let horizon = Utc::now() - self.retention;
        guard.points.retain(|p| p.timestamp >= horizon);

        self.persist(account_id, &guard.points)
    }

    /// The account's series, ascending by timestamp, optionally bounded
    /// below by `since`.
    pub async fn query(
        &self,
        account_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Vec<UsageDataPoint> {
        let partition = self.partition(account_id);
        let mut guard = partition.lock().await;
        self.ensure_loaded(account_id, &mut guard);

        match since {
            Some(cutoff) => guard
                .points
                .iter()
                .filter(|p| p.timestamp >= cutoff)
                .cloned()
                .collect(),
            None => guard.points.clone(),
        }
    }

    pub async fn clear(&self, account_id: &str) -> Result<(), HistoryError> {
        let partition = self.partition(account_id);
        let mut guard = partition.lock().await;
        guard.points.clear();
        guard.loaded = true;
        guard.last_downsample = None;
        self.persist(account_id, &guard.points)
    }

    /// Collapse aged points to hourly averages, at most once per
    /// `downsample_interval` per account. Returns whether a pass ran.
    pub async fn maybe_downsample(
        &self,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, HistoryError> {
        let partition = self.partition(account_id);
        let mut guard = partition.lock().await;
        self.ensure_loaded(account_id, &mut guard);

        if let Some(last) = guard.last_downsample {
            if now - last < self.downsample_interval {
                return Ok(false);
            }
        }
        guard.last_downsample = Some(now);

        let cutoff = now - self.recent_window;
        let collapsed = downsample_series(&guard.points, cutoff);
        if collapsed != guard.points {
            debug!(
                account = account_id,
                before = guard.points.len(),
                after = collapsed.len(),
                "Downsampled aged history points"
            );
            guard.points = collapsed;
            self.persist(account_id, &guard.points)?;
        }

        Ok(true)
    }

    /// Lazily load the partition's file. A missing file is an empty series;
    /// an unreadable one is logged and treated as empty rather than
    /// poisoning the partition.
    fn ensure_loaded(&self, account_id: &str, partition: &mut Partition) {
        if partition.loaded {
            return;
        }
        partition.loaded = true;

        let path = self.file_path(account_id);
        if !path.exists() {
            return;
        }

        match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<Vec<UsageDataPoint>>(&raw) {
                Ok(mut points) => {
                    points.sort_by_key(|p| p.timestamp);
                    partition.points = points;
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "History file is corrupt, starting empty");
                }
            },
            Err(e) => {
                warn!(file = %path.display(), error = %e, "Could not read history file, starting empty");
            }
        }
    }

    /// Full-series write-replace: serialize to a sibling temp file, then
    /// rename over the real one.
    fn persist(&self, account_id: &str, points: &[UsageDataPoint]) -> Result<(), HistoryError> {
        fs::create_dir_all(&self.dir)?;

        let path = self.file_path(account_id);
        let json = serde_json::to_string_pretty(points)?;
        write_atomic(&path, &json)?;
        Ok(())
    }
}

fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    {
        let mut tmp = fs::File::create(&tmp_path)?;
        tmp.write_all(contents.as_bytes())?;
        tmp.sync_all()?;
    }
    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    Ok(())
}

fn hour_floor(ts: DateTime<Utc>) -> DateTime<Utc> {
    let secs = ts.timestamp();
    DateTime::from_timestamp(secs - secs.rem_euclid(3600), 0).unwrap_or(ts)
}

/// Pure downsampling pass: points older than `cutoff` collapse to one
/// averaged point per calendar hour; newer points pass through untouched.
///
/// The primary percentage averages over every point in an hour bucket; the
/// secondary averages independently over the subset that has one. A bucket
/// already reduced to a single hour-boundary point passes through unchanged,
/// which makes repeated passes over unchanged data yield identical series.
/// The result is re-sorted ascending and never duplicates a timestamp.
pub fn downsample_series(
    points: &[UsageDataPoint],
    cutoff: DateTime<Utc>,
) -> Vec<UsageDataPoint> {
    let (old, recent): (Vec<UsageDataPoint>, Vec<UsageDataPoint>) =
        points.iter().cloned().partition(|p| p.timestamp < cutoff);

    let mut buckets: BTreeMap<i64, Vec<UsageDataPoint>> = BTreeMap::new();
    for point in old {
        buckets
            .entry(hour_floor(point.timestamp).timestamp())
            .or_default()
            .push(point);
    }

    let mut result = Vec::with_capacity(buckets.len() + recent.len());
    for members in buckets.into_values() {
        let boundary = hour_floor(members[0].timestamp);

        if members.len() == 1 && members[0].timestamp == boundary {
            result.push(members[0].clone());
            continue;
        }

        let primary = members.iter().map(|p| p.primary_percentage).sum::<f64>()
            / members.len() as f64;
        let secondaries: Vec<f64> = members
            .iter()
            .filter_map(|p| p.secondary_percentage)
            .collect();
        let secondary = if secondaries.is_empty() {
            None
        } else {
            Some(secondaries.iter().sum::<f64>() / secondaries.len() as f64)
        };

        result.push(UsageDataPoint {
            id: Uuid::new_v4().to_string(),
            timestamp: boundary,
            primary_percentage: primary,
            secondary_percentage: secondary,
            source: members[0].source,
        });
    }

    result.extend(recent);
    result.sort_by_key(|p| p.timestamp);
    result
}
