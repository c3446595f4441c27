//! Data source reliability engine.
//!
//! Drives the poll cycle: remote endpoint first, local logs as fallback,
//! consecutive-failure tracking, and a circuit breaker that halts automatic
//! polling after a run of fully-failed cycles. The circuit can only be
//! cleared by an explicit manual reset; repeated dead cycles waste resources
//! and should require human attention rather than silent retries.
//!
//! The engine is a constructor-injected service owned by the application
//! context. Cycle ordering is strict: snapshot production, then history
//! append, then observer notification, so observers never see a snapshot
//! that failed to persist.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::events::{EngineEvent, EventBus};
use crate::history::HistoryStore;
use crate::models::{DataSourceState, RetryState, UsageSnapshot};
use crate::sources::{SourceKind, UsageSource};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("cannot disable the last enabled data source")]
    LastSource,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub poll_interval: Duration,
    /// Consecutive fully-failed cycles before the circuit opens.
    pub failure_ceiling: u32,
    pub remote_enabled: bool,
    pub local_enabled: bool,
    pub primary_account: String,
    pub secondary_accounts: Vec<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            failure_ceiling: 3,
            remote_enabled: true,
            local_enabled: true,
            primary_account: "default".to_string(),
            secondary_accounts: Vec::new(),
        }
    }
}

/// Point-in-time view of the engine's bookkeeping, for status surfaces.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineStatus {
    pub retry: RetryState,
    pub remote: DataSourceState,
    pub local: DataSourceState,
    pub remote_enabled: bool,
    pub local_enabled: bool,
}

struct EngineState {
    retry: RetryState,
    remote_state: DataSourceState,
    local_state: DataSourceState,
    remote_enabled: bool,
    local_enabled: bool,
    /// Latched after the first fallback notification of an outage so later
    /// failed cycles in the same outage stay quiet.
    fallback_notified: bool,
}

pub struct DataSourceReliabilityEngine {
    settings: EngineSettings,
    remote: Option<Arc<dyn UsageSource>>,
    local: Option<Arc<dyn UsageSource>>,
    history: Arc<HistoryStore>,
    events: EventBus,
    state: Mutex<EngineState>,
    shutdown_tx: watch::Sender<bool>,
}

impl DataSourceReliabilityEngine {
    pub fn new(
        settings: EngineSettings,
        remote: Option<Arc<dyn UsageSource>>,
        local: Option<Arc<dyn UsageSource>>,
        history: Arc<HistoryStore>,
        events: EventBus,
    ) -> Self {
        let remote_state = initial_state(remote.is_some(), settings.remote_enabled);
        let local_state = initial_state(local.is_some(), settings.local_enabled);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            state: Mutex::new(EngineState {
                retry: RetryState::default(),
                remote_state,
                local_state,
                remote_enabled: settings.remote_enabled,
                local_enabled: settings.local_enabled,
                fallback_notified: false,
            }),
            settings,
            remote,
            local,
            history,
            events,
            shutdown_tx,
        }
    }

    /// Run one poll cycle. Returns the produced snapshot, or `None` when the
    /// circuit is open or every enabled source failed.
    pub async fn poll_cycle(&self) -> Result<Option<UsageSnapshot>> {
        // Entry guard: an open circuit means no network calls and no log
        // scans until someone resets.
        let (remote_enabled, local_enabled) = {
            let state = self.state.lock().unwrap();
            if state.retry.circuit_open {
                debug!("Circuit open, skipping poll cycle");
                return Ok(None);
            }
            (state.remote_enabled, state.local_enabled)
        };

        // Primary attempt: remote is always tried before local when both
        // are enabled.
        if remote_enabled {
            if let Some(remote) = self.remote.clone() {
                match remote.fetch(&self.settings.primary_account).await {
                    Ok(snapshot) => {
                        self.set_source_state(SourceKind::Remote, DataSourceState::Available);
                        {
                            let mut state = self.state.lock().unwrap();
                            state.retry.remote_failures = 0;
                            state.retry.local_failures = 0;
                            state.retry.total_failures = 0;
                            state.fallback_notified = false;
                        }

                        self.commit(&snapshot).await?;
                        let secondaries = self.fan_out_secondaries().await;

                        self.events
                            .emit(EngineEvent::SnapshotProduced(snapshot.clone()));
                        for secondary in secondaries {
                            self.events.emit(EngineEvent::SnapshotProduced(secondary));
                        }
                        return Ok(Some(snapshot));
                    }
                    Err(e) => {
                        let reason = e.to_string();
                        warn!(error = %reason, "Remote usage fetch failed");
                        self.set_source_state(
                            SourceKind::Remote,
                            DataSourceState::Failed(reason.clone()),
                        );
                        let notify = {
                            let mut state = self.state.lock().unwrap();
                            state.retry.remote_failures += 1;
                            let will_fall_back = local_enabled && self.local.is_some();
                            let notify = will_fall_back && !state.fallback_notified;
                            if notify {
                                state.fallback_notified = true;
                            }
                            notify
                        };
                        if notify {
                            self.events.emit(EngineEvent::FallbackEngaged { reason });
                        }
                    }
                }
            }
        }

        // Fallback attempt.
        if local_enabled {
            if let Some(local) = self.local.clone() {
                match local.fetch(&self.settings.primary_account).await {
                    Ok(snapshot) => {
                        self.set_source_state(SourceKind::LocalLog, DataSourceState::Available);
                        {
                            // The remote counter is deliberately untouched: a
                            // standing remote outage keeps being tracked even
                            // while the fallback covers it.
                            let mut state = self.state.lock().unwrap();
                            state.retry.local_failures = 0;
                            state.retry.total_failures = 0;
                        }

                        self.commit(&snapshot).await?;
                        self.events
                            .emit(EngineEvent::SnapshotProduced(snapshot.clone()));
                        return Ok(Some(snapshot));
                    }
                    Err(e) => {
                        let reason = e.to_string();
                        warn!(error = %reason, "Local log scan failed");
                        self.set_source_state(
                            SourceKind::LocalLog,
                            DataSourceState::Failed(reason),
                        );
                        let mut state = self.state.lock().unwrap();
                        state.retry.local_failures += 1;
                    }
                }
            }
        }

        // Every enabled source failed this cycle.
        let opened = {
            let mut state = self.state.lock().unwrap();
            state.retry.total_failures += 1;
            if !state.retry.circuit_open
                && state.retry.total_failures >= self.settings.failure_ceiling
            {
                state.retry.circuit_open = true;
                Some(state.retry.total_failures)
            } else {
                None
            }
        };
        if let Some(total_failures) = opened {
            error!(
                total_failures,
                "Failure ceiling reached, circuit opened; manual reset required"
            );
            self.events.emit(EngineEvent::CircuitOpened { total_failures });
        }

        Ok(None)
    }

    /// Drive poll cycles on the configured interval until shutdown. Cycles
    /// never overlap: the next tick is not acted on until the previous
    /// cycle, including history persistence, has completed.
    pub async fn run(&self) -> Result<()> {
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown = self.shutdown_tx.subscribe();

        info!(
            interval_secs = self.settings.poll_interval.as_secs(),
            ceiling = self.settings.failure_ceiling,
            "Polling started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_cycle().await {
                        warn!(error = %e, "Poll cycle failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        info!("Polling stopped");
        Ok(())
    }

    /// Stop the polling loop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Manual reset: clears all failure counters, closes the circuit, and
    /// re-arms the one-time fallback notification. The next cycle runs from
    /// a clean state.
    pub fn reset(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.retry = RetryState::default();
            state.fallback_notified = false;
        }
        info!("Manual reset: counters cleared, circuit closed");
    }

    /// Enable or disable a source at runtime. Disabling the last enabled
    /// source is rejected so the configuration can never go empty.
    pub fn set_source_enabled(&self, kind: SourceKind, enabled: bool) -> Result<(), EngineError> {
        let event = {
            let mut guard = self.state.lock().unwrap();
            let state = &mut *guard;

            if !enabled {
                let other_active = match kind {
                    SourceKind::Remote => state.local_enabled && self.local.is_some(),
                    SourceKind::LocalLog => state.remote_enabled && self.remote.is_some(),
                };
                if !other_active {
                    return Err(EngineError::LastSource);
                }
            }

            let configured = match kind {
                SourceKind::Remote => self.remote.is_some(),
                SourceKind::LocalLog => self.local.is_some(),
            };
            let new_state = initial_state(configured, enabled);

            let (flag, slot) = match kind {
                SourceKind::Remote => (&mut state.remote_enabled, &mut state.remote_state),
                SourceKind::LocalLog => (&mut state.local_enabled, &mut state.local_state),
            };
            *flag = enabled;
            if *slot != new_state {
                *slot = new_state.clone();
                Some(EngineEvent::SourceStateChanged {
                    source: kind,
                    state: new_state,
                })
            } else {
                None
            }
        };

        if let Some(event) = event {
            self.events.emit(event);
        }
        Ok(())
    }

    pub fn status(&self) -> EngineStatus {
        let state = self.state.lock().unwrap();
        EngineStatus {
            retry: state.retry,
            remote: state.remote_state.clone(),
            local: state.local_state.clone(),
            remote_enabled: state.remote_enabled,
            local_enabled: state.local_enabled,
        }
    }

    /// Persist the snapshot before anyone hears about it.
    async fn commit(&self, snapshot: &UsageSnapshot) -> Result<()> {
        if let Some(point) = snapshot.to_data_point() {
            self.history.append(&snapshot.account_id, point).await?;
            self.history
                .maybe_downsample(&snapshot.account_id, Utc::now())
                .await?;
        }
        Ok(())
    }

    /// Fetch secondary accounts in parallel and persist what succeeds. One
    /// account's failure never fails or blocks the others. Only snapshots
    /// that persisted (or had nothing to persist) are returned for
    /// notification.
    async fn fan_out_secondaries(&self) -> Vec<UsageSnapshot> {
        let Some(remote) = self.remote.clone() else {
            return Vec::new();
        };
        if self.settings.secondary_accounts.is_empty() {
            return Vec::new();
        }

        let tasks = self.settings.secondary_accounts.iter().map(|account| {
            let remote = remote.clone();
            let account = account.clone();
            async move {
                match remote.fetch(&account).await {
                    Ok(snapshot) => Some(snapshot),
                    Err(e) => {
                        warn!(account = %account, error = %e, "Secondary account fetch failed");
                        None
                    }
                }
            }
        });

        let mut produced = Vec::new();
        for snapshot in futures::future::join_all(tasks).await.into_iter().flatten() {
            if let Some(point) = snapshot.to_data_point() {
                if let Err(e) = self.history.append(&snapshot.account_id, point).await {
                    warn!(account = %snapshot.account_id, error = %e, "History append failed for secondary account");
                    continue;
                }
                if let Err(e) = self
                    .history
                    .maybe_downsample(&snapshot.account_id, Utc::now())
                    .await
                {
                    warn!(account = %snapshot.account_id, error = %e, "Downsample failed for secondary account");
                }
            }
            produced.push(snapshot);
        }
        produced
    }

    fn set_source_state(&self, kind: SourceKind, new_state: DataSourceState) {
        let changed = {
            let mut state = self.state.lock().unwrap();
            let slot = match kind {
                SourceKind::Remote => &mut state.remote_state,
                SourceKind::LocalLog => &mut state.local_state,
            };
            if *slot != new_state {
                *slot = new_state.clone();
                true
            } else {
                false
            }
        };
        if changed {
            self.events.emit(EngineEvent::SourceStateChanged {
                source: kind,
                state: new_state,
            });
        }
    }
}

fn initial_state(configured: bool, enabled: bool) -> DataSourceState {
    if !configured {
        DataSourceState::NotConfigured
    } else if !enabled {
        DataSourceState::Disabled
    } else {
        DataSourceState::Available
    }
}
