//! The data-source seam the reliability engine drives.
//!
//! Both the remote endpoint and the local log scanner sit behind
//! [`UsageSource`], which lets the engine run the priority chain without
//! knowing how a reading is produced and lets tests substitute scripted
//! sources.

use async_trait::async_trait;

use crate::models::UsageSnapshot;

/// Which source a reading comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Remote,
    LocalLog,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::Remote => write!(f, "remote"),
            SourceKind::LocalLog => write!(f, "local-log"),
        }
    }
}

/// One way of producing a usage reading for an account.
#[async_trait]
pub trait UsageSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Produce a snapshot for the account, or the reason it could not.
    async fn fetch(&self, account_id: &str) -> anyhow::Result<UsageSnapshot>;
}
