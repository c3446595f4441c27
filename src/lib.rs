//! Claude Sentinel Library
//!
//! Reliable usage monitoring for a rate-limited Claude account. The library
//! polls two independent data sources, reconciles their availability, and
//! maintains a bounded historical time series for trend analysis.
//!
//! ## Core Features
//!
//! - **Credential lifecycle**: proactive token expiry handling and OAuth
//!   refresh with best-effort write-back to the shared credential store
//! - **Primary/fallback orchestration**: the live usage endpoint first,
//!   local session logs when it is unavailable or disabled, with
//!   consecutive-failure tracking and a manually-reset circuit breaker
//! - **Bounded history**: per-account time series with a 90-day retention
//!   horizon and hourly downsampling of aged points
//! - **Observer decoupling**: collaborators subscribe to a broadcast event
//!   bus instead of being wired into the core
//!
//! ## Architecture Overview
//!
//! - [`models`] - Core data structures: credentials, snapshots, history
//!   points, source states
//! - [`credentials`] - The credential store seam and its file-backed
//!   implementation
//! - [`token_lifecycle`] - Token validity decisions and the refresh flow
//! - [`remote`] - The authenticated usage endpoint client and the
//!   refresh-aware remote source
//! - [`scanner`] - Defensive local session log scanning, the fallback source
//! - [`engine`] - The poll-cycle state machine and scheduler
//! - [`history`] - Persistent per-account series with retention and
//!   downsampling
//! - [`events`] - The broadcast event bus observers subscribe to
//! - [`config`] - Configuration management with environment variable support
//! - [`logging`] - Structured logging with JSON and pretty-print formats
//!
//! ## Main Entry Point
//!
//! Services are constructor-injected and owned by the application context:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use claude_sentinel::config::Config;
//! use claude_sentinel::engine::{DataSourceReliabilityEngine, EngineSettings};
//! use claude_sentinel::events::EventBus;
//! use claude_sentinel::history::HistoryStore;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = Config::default();
//! let history = Arc::new(HistoryStore::new(
//!     &config.paths.history_directory,
//!     &config.history,
//! ));
//! let events = EventBus::default();
//! let engine = DataSourceReliabilityEngine::new(
//!     EngineSettings::default(),
//!     None, // remote source
//!     None, // local source
//!     history,
//!     events.clone(),
//! );
//! engine.poll_cycle().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod credentials;
pub mod engine;
pub mod events;
pub mod history;
pub mod logging;
pub mod models;
pub mod remote;
pub mod scanner;
pub mod sources;
pub mod token_lifecycle;

pub use engine::DataSourceReliabilityEngine;
pub use models::*;
