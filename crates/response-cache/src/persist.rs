//! Atomic JSON snapshot of the cache table

use std::collections::HashMap;
use std::path::Path;

use tracing::debug;

use crate::cache::CacheEntry;
use crate::error::{Error, Result};

pub(crate) async fn load(path: &Path) -> Result<HashMap<String, CacheEntry>> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::Io(format!("reading cache file: {e}")))?;
    serde_json::from_str(&contents).map_err(|e| Error::Serialize(format!("parsing cache file: {e}")))
}

/// Write to a sibling temp file, then rename it over `path`.
pub(crate) async fn write_atomic(path: &Path, entries: &HashMap<String, CacheEntry>) -> Result<()> {
    let json = serde_json::to_string(entries)
        .map_err(|e| Error::Serialize(format!("serializing cache: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("cache path has no parent directory".into()))?;
    let tmp_path = dir.join(format!(".cache.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp cache file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting cache file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp cache file: {e}")))?;

    debug!(path = %path.display(), entries = entries.len(), "persisted cache");
    Ok(())
}
