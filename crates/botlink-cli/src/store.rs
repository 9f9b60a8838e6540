//! File-backed credential store
//!
//! Keeps the single credential row as a JSON record under the data directory, one file
//! per connection-string database and user. Writes go to a temporary sibling first and
//! are renamed into place, so a concurrent reader sees the old or the new row.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use botlink_core::{
    types::now_millis, ConnectionString, CredentialStore, DeviceCredential, StoreError,
};

const RECORD_VERSION: u32 = 1;

/// On-disk record
#[derive(Debug, Serialize, Deserialize)]
struct StoredCredential {
    version: u32,
    credential: DeviceCredential,
    fingerprint: String,
    saved_at_ms: u64,
}

#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store namespaced by the database and user of `connection`
    pub fn for_connection(data_dir: &Path, connection: &ConnectionString) -> Self {
        let name = format!(
            "{}-{}.credential.json",
            sanitize(connection.database()),
            sanitize(connection.user())
        );
        Self::new(data_dir.join(name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
        self.path.with_file_name(name)
    }
}

fn sanitize(part: &str) -> String {
    let cleaned: String = part
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "default".to_string()
    } else {
        cleaned
    }
}

fn unavailable(action: &str, path: &Path, err: std::io::Error) -> StoreError {
    StoreError::Unavailable {
        reason: format!("{} {}: {}", action, path.display(), err),
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn get(&self) -> Result<Option<DeviceCredential>, StoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(unavailable("cannot read", &self.path, err)),
        };

        let record: StoredCredential =
            serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
                reason: format!("{}: {}", self.path.display(), e),
            })?;
        if record.version != RECORD_VERSION {
            return Err(StoreError::Corrupt {
                reason: format!("unsupported record version {}", record.version),
            });
        }
        Ok(Some(record.credential))
    }

    async fn put(&self, credential: &DeviceCredential) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| unavailable("cannot create", parent, e))?;
        }

        let record = StoredCredential {
            version: RECORD_VERSION,
            credential: credential.clone(),
            fingerprint: credential.fingerprint(),
            saved_at_ms: now_millis(),
        };
        let json = serde_json::to_vec_pretty(&record).map_err(|e| StoreError::Unavailable {
            reason: format!("cannot encode credential record: {}", e),
        })?;

        let temp = self.temp_path();
        if let Err(err) = tokio::fs::write(&temp, &json).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(unavailable("cannot write", &temp, err));
        }
        if let Err(err) = tokio::fs::rename(&temp, &self.path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(unavailable("cannot replace", &self.path, err));
        }

        debug!(path = %self.path.display(), fingerprint = %record.fingerprint, "Credential written");
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(unavailable("cannot remove", &self.path, err)),
        }
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}
