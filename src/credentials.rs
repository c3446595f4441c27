//! Credential store access.
//!
//! The actual secure store is external (the login flow owns it); this module
//! consumes it as an opaque read/write-by-key service holding one JSON blob
//! per account. [`FileCredentialStore`] is the production implementation,
//! reading the same on-disk entry the Claude CLI writes.

use std::fs;
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no credentials stored for account")]
    NoCredentials,
    #[error("access token expired or expiring within the proactive buffer")]
    Expired,
    #[error("stored credentials lack required scope '{0}'")]
    InsufficientScope(String),
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),
    #[error("credential store: {0}")]
    Store(String),
}

impl CredentialError {
    /// Only an expired token can be repaired by refreshing.
    pub fn is_refreshable(&self) -> bool {
        matches!(self, CredentialError::Expired)
    }
}

/// Opaque read/write-by-key credential service.
pub trait CredentialStore: Send + Sync {
    /// Raw JSON blob for the account, or `None` when no entry exists.
    fn read(&self, account_id: &str) -> Result<Option<String>, CredentialError>;

    /// Replace the account's entry with the given blob.
    fn write(&self, account_id: &str, blob: &str) -> Result<(), CredentialError>;
}

/// File-backed credential store rooted at the Claude home directory.
///
/// The primary account maps to `.credentials.json` (the entry the external
/// login flow maintains); additional accounts get their own suffixed files.
pub struct FileCredentialStore {
    dir: PathBuf,
}

impl FileCredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, account_id: &str) -> PathBuf {
        if account_id == "default" {
            self.dir.join(".credentials.json")
        } else {
            self.dir.join(format!(".credentials.{account_id}.json"))
        }
    }

    fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
        let tmp_path = path.with_extension("json.tmp");
        {
            let mut options = fs::OpenOptions::new();
            options.write(true).create(true).truncate(true);
            #[cfg(unix)]
            options.mode(0o600);
            let mut tmp = options.open(&tmp_path)?;
            tmp.write_all(contents.as_bytes())?;
            tmp.sync_all()?;
        }
        if let Err(err) = fs::rename(&tmp_path, path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }
        Ok(())
    }
}

impl CredentialStore for FileCredentialStore {
    fn read(&self, account_id: &str) -> Result<Option<String>, CredentialError> {
        let path = self.path_for(account_id);
        if !path.exists() {
            return Ok(None);
        }
        fs::read_to_string(&path)
            .map(Some)
            .map_err(|e| CredentialError::Store(format!("read {}: {e}", path.display())))
    }

    fn write(&self, account_id: &str, blob: &str) -> Result<(), CredentialError> {
        let path = self.path_for(account_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| CredentialError::Store(format!("create {}: {e}", parent.display())))?;
        }
        Self::write_atomic(&path, blob)
            .map_err(|e| CredentialError::Store(format!("write {}: {e}", path.display())))
    }
}
