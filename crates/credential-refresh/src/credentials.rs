//! Per-resource OAuth credential file
//!
//! Manages a JSON file mapping resource IDs (mailboxes, API accounts) to
//! OAuth credentials. All writes use atomic temp-file + rename to prevent
//! corruption on crash. A tokio Mutex serializes writers within a process.
//! Every mutation re-reads the file first, so entries written by other
//! worker processes are carried forward instead of overwritten.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    #[default]
    Active,
    /// Refresh grant rejected. No refresh is attempted until re-authorized.
    NeedsReauth,
}

/// A single resource's OAuth credentials.
///
/// `expires` is a unix timestamp in milliseconds (absolute, not a delta).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub access: String,
    pub refresh: String,
    pub expires: u64,
    #[serde(default)]
    pub status: CredentialStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Credential {
    pub fn new(access: impl Into<String>, refresh: impl Into<String>, expires: u64) -> Self {
        Self {
            access: access.into(),
            refresh: refresh.into(),
            expires,
            status: CredentialStatus::Active,
            last_error: None,
        }
    }

    /// Whether the access token expires within `threshold_millis` of `now`.
    pub fn expires_within(&self, now: u64, threshold_millis: u64) -> bool {
        self.expires <= now.saturating_add(threshold_millis)
    }

    pub fn needs_reauth(&self) -> bool {
        self.status == CredentialStatus::NeedsReauth
    }
}

pub struct CredentialStore {
    path: PathBuf,
    state: Mutex<HashMap<String, Credential>>,
}

impl CredentialStore {
    /// Open the credential file at `path`, creating it as `{}` when missing.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let entries = if path.exists() {
            read_file(&path).await?
        } else {
            write_atomic(&path, &HashMap::new()).await?;
            HashMap::new()
        };
        info!(path = %path.display(), credentials = entries.len(), "credential store opened");
        Ok(Self {
            path,
            state: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the file, replacing the in-memory view.
    ///
    /// Called under the refresh lock so writes from other processes are seen
    /// before deciding whether a refresh is still needed. A missing file keeps
    /// the current state.
    pub async fn reload(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        sync_from_disk(&self.path, &mut state).await?;
        debug!(path = %self.path.display(), "reloaded credentials");
        Ok(())
    }

    pub async fn get(&self, resource_id: &str) -> Option<Credential> {
        let state = self.state.lock().await;
        state.get(resource_id).cloned()
    }

    pub async fn resource_ids(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut ids: Vec<String> = state.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Insert or overwrite `resource_id`.
    pub async fn add(&self, resource_id: String, credential: Credential) -> Result<()> {
        self.mutate(|entries| {
            debug!(resource_id, "added credential");
            entries.insert(resource_id, credential);
            Ok(())
        })
        .await
    }

    pub async fn remove(&self, resource_id: &str) -> Result<Option<Credential>> {
        self.mutate(|entries| Ok(entries.remove(resource_id))).await
    }

    /// Store refreshed tokens and expiry in one write. Clears `last_error`.
    pub async fn update_token(
        &self,
        resource_id: &str,
        access: String,
        refresh: String,
        expires: u64,
    ) -> Result<()> {
        self.mutate(|entries| {
            let entry = lookup(entries, resource_id)?;
            entry.access = access;
            entry.refresh = refresh;
            entry.expires = expires;
            entry.last_error = None;
            debug!(resource_id, expires, "updated token");
            Ok(())
        })
        .await
    }

    /// Flag a credential whose grant was rejected.
    pub async fn mark_needs_reauth(&self, resource_id: &str, error: &str) -> Result<()> {
        self.mutate(|entries| {
            let entry = lookup(entries, resource_id)?;
            entry.status = CredentialStatus::NeedsReauth;
            entry.last_error = Some(error.to_string());
            warn!(resource_id, error, "credential marked needs_reauth");
            Ok(())
        })
        .await
    }

    /// Replace a credential after out-of-band re-authorization.
    pub async fn reauthorize(&self, resource_id: &str, mut credential: Credential) -> Result<()> {
        credential.status = CredentialStatus::Active;
        credential.last_error = None;
        self.mutate(|entries| {
            entries.insert(resource_id.to_string(), credential);
            info!(resource_id, "credential re-authorized");
            Ok(())
        })
        .await
    }

    /// Read-modify-write under the store mutex. Nothing is written when `f` fails.
    async fn mutate<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, Credential>) -> Result<T>,
    ) -> Result<T> {
        let mut entries = self.state.lock().await;
        sync_from_disk(&self.path, &mut entries).await?;
        let out = f(&mut entries)?;
        write_atomic(&self.path, &entries).await?;
        Ok(out)
    }

    pub async fn len(&self) -> usize {
        let state = self.state.lock().await;
        state.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn lookup<'a>(
    entries: &'a mut HashMap<String, Credential>,
    resource_id: &str,
) -> Result<&'a mut Credential> {
    entries
        .get_mut(resource_id)
        .ok_or_else(|| Error::NotFound(format!("resource {resource_id} not in credential store")))
}

/// Pick up entries written by other processes before a read-modify-write.
async fn sync_from_disk(path: &Path, state: &mut HashMap<String, Credential>) -> Result<()> {
    if path.exists() {
        *state = read_file(path).await?;
    } else {
        warn!(path = %path.display(), "credential file vanished, keeping in-memory state");
    }
    Ok(())
}

async fn read_file(path: &Path) -> Result<HashMap<String, Credential>> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::Io(format!("reading credential file: {e}")))?;
    serde_json::from_str(&contents)
        .map_err(|e| Error::CredentialParse(format!("parsing credential file: {e}")))
}

/// Persist through a sibling temp file and rename. Mode 0600 on unix.
async fn write_atomic(path: &Path, entries: &HashMap<String, Credential>) -> Result<()> {
    let io = |what: &str, e: std::io::Error| Error::Io(format!("{what} {}: {e}", path.display()));
    let body = serde_json::to_vec_pretty(entries)
        .map_err(|e| Error::CredentialParse(format!("encoding credential file: {e}")))?;
    let parent = path
        .parent()
        .ok_or_else(|| Error::Io(format!("{} has no parent directory", path.display())))?;
    let staging = parent.join(format!(".credentials.{}.partial", std::process::id()));

    tokio::fs::write(&staging, &body)
        .await
        .map_err(|e| io("staging", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&staging, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(|e| io("restricting", e))?;
    }
    tokio::fs::rename(&staging, path)
        .await
        .map_err(|e| io("replacing", e))?;

    debug!(path = %path.display(), bytes = body.len(), "credential file written");
    Ok(())
}
