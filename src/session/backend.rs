//! Durable session storage
//!
//! Full session snapshots keyed by session id. Any I/O or decoding failure is
//! reported as a storage error.

use std::fmt::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::core::{QuillError, Result};
use crate::session::state::Session;

/// Key/value persistence of session snapshots
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Snapshot stored under `id`, if any
    async fn load(&self, id: &str) -> Result<Option<Session>>;

    /// Store or replace the snapshot of `session`
    async fn store(&self, session: &Session) -> Result<()>;

    /// Drop the snapshot under `id`, returning whether one existed
    async fn remove(&self, id: &str) -> Result<bool>;

    /// Ids of every stored snapshot
    async fn list(&self) -> Result<Vec<String>>;
}

/// File stem for `id`: `[A-Za-z0-9-]` is kept, every other byte becomes `_XX`
fn encode_id(id: &str) -> String {
    let mut stem = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            stem.push(char::from(byte));
        } else {
            let _ = write!(stem, "_{:02X}", byte);
        }
    }
    stem
}

/// Inverse of `encode_id`; `None` for names it never produces
fn decode_id(stem: &str) -> Option<String> {
    let bytes = stem.as_bytes();
    let mut id = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'_' {
            let hex = stem.get(i + 1..i + 3)?;
            id.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            id.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(id).ok()
}

/// One JSON file per session in a directory
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", encode_id(id)))
    }
}

#[async_trait]
impl SessionBackend for FileBackend {
    async fn load(&self, id: &str) -> Result<Option<Session>> {
        let path = self.path_for(id);

        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(QuillError::storage(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let session: Session = serde_json::from_str(&text)
            .map_err(|e| QuillError::storage(format!("Corrupt snapshot {}: {}", path.display(), e)))?;

        if session.id != id {
            return Err(QuillError::storage(format!(
                "Snapshot {} holds session '{}', not '{}'",
                path.display(),
                session.id,
                id
            )));
        }
        Ok(Some(session))
    }

    async fn store(&self, session: &Session) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            QuillError::storage(format!(
                "Failed to create {}: {}",
                self.dir.display(),
                e
            ))
        })?;

        let path = self.path_for(&session.id);
        let text = serde_json::to_string_pretty(session)
            .map_err(|e| QuillError::storage(format!("Failed to encode session: {}", e)))?;

        // temp file + rename: readers see the old or the new snapshot, never half
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, text)
            .await
            .map_err(|e| QuillError::storage(format!("Failed to write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| QuillError::storage(format!("Failed to write {}: {}", path.display(), e)))?;

        tracing::debug!(session = %session.id, path = %path.display(), "session stored");
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        match tokio::fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(QuillError::storage(format!(
                "Failed to remove session {}: {}",
                id, e
            ))),
        }
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(QuillError::storage(format!(
                    "Failed to read {}: {}",
                    self.dir.display(),
                    e
                )))
            }
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| QuillError::storage(format!("Failed to read {}: {}", self.dir.display(), e)))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(decode_id)
            {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}
