//! Content Store Contract (§4.J): the external collaborator this crate
//! consumes for blob storage. Only the interface is owned here; a real
//! implementation lives outside this crate. [`InMemoryContentStore`] is a
//! test double modelled the same way `pbs-datastore`'s `ChunkStore` exposes
//! insert/verify/read over content-addressed digests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use tokio::io::{AsyncRead, AsyncReadExt};

/// A content digest, always `sha256:<hex>` (§3.5).
pub type ContentDigest = String;

#[derive(thiserror::Error, Debug)]
pub enum ContentStoreError {
    #[error("no such ingest session: {0}")]
    NoSuchSession(String),
    #[error("blob not found: {0}")]
    NotFound(ContentDigest),
    #[error("session already finalized: {0}")]
    SessionFinalized(String),
    #[error("ingest session {0} completed with no digest")]
    EmptySession(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Handle returned by `new_ingest_session`, consumed by exactly one of
/// `complete_ingest_session` / `cancel_ingest_session` (§4.J invariant).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IngestSessionId(pub String);

/// The external blob store this crate writes layers into and reads chains
/// back from (§4.J). A session hands back a directory the caller writes
/// blobs into directly; `complete` digests whatever was written there.
/// Implementations must make `complete_ingest_session` atomic with respect
/// to concurrent `get` calls on the same digest.
#[async_trait::async_trait]
pub trait ContentStore: Send + Sync {
    /// Open a session and the directory content for it should be written
    /// into (§4.J `newIngestSession() -> (sessionId, ingestDirectory)`).
    async fn new_ingest_session(&self) -> Result<(IngestSessionId, PathBuf), ContentStoreError>;

    /// Digest everything written into the session's ingest directory.
    /// Returns at least one digest when a single blob was written (§4.J).
    async fn complete_ingest_session(&self, session: IngestSessionId) -> Result<Vec<ContentDigest>, ContentStoreError>;

    async fn cancel_ingest_session(&self, session: IngestSessionId) -> Result<(), ContentStoreError>;

    /// Open a blob for reading by digest.
    async fn get(&self, digest: &ContentDigest) -> Result<Box<dyn AsyncRead + Send + Unpin>, ContentStoreError>;
}

/// In-process test double: each session gets a real temporary directory;
/// `complete` digests every file found in it and removes the directory
/// (§9 "Polymorphism" — swap for a real store in integration tests without
/// touching the differ/snapshotter logic).
#[derive(Default)]
pub struct InMemoryContentStore {
    sessions: Mutex<HashMap<String, PathBuf>>,
    blobs: Mutex<HashMap<ContentDigest, Vec<u8>>>,
    next_id: Mutex<u64>,
}

impl InMemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn digest_of(data: &[u8]) -> ContentDigest {
        let mut hasher = openssl::sha::Sha256::new();
        hasher.update(data);
        format!("sha256:{}", hex::encode(hasher.finish()))
    }
}

#[async_trait::async_trait]
impl ContentStore for InMemoryContentStore {
    async fn new_ingest_session(&self) -> Result<(IngestSessionId, PathBuf), ContentStoreError> {
        let mut next_id = self.next_id.lock().unwrap();
        *next_id += 1;
        let id = format!("session-{next_id}");
        let dir = std::env::temp_dir().join(format!("container-layer-differ-ingest-{id}-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await?;
        self.sessions.lock().unwrap().insert(id.clone(), dir.clone());
        Ok((IngestSessionId(id), dir))
    }

    async fn complete_ingest_session(&self, session: IngestSessionId) -> Result<Vec<ContentDigest>, ContentStoreError> {
        let dir = self
            .sessions
            .lock()
            .unwrap()
            .remove(&session.0)
            .ok_or_else(|| ContentStoreError::NoSuchSession(session.0.clone()))?;

        let mut digests = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                let data = tokio::fs::read(entry.path()).await?;
                let digest = Self::digest_of(&data);
                self.blobs.lock().unwrap().insert(digest.clone(), data);
                digests.push(digest);
            }
        }
        let _ = tokio::fs::remove_dir_all(&dir).await;

        if digests.is_empty() {
            return Err(ContentStoreError::EmptySession(session.0));
        }
        Ok(digests)
    }

    async fn cancel_ingest_session(&self, session: IngestSessionId) -> Result<(), ContentStoreError> {
        let dir = self
            .sessions
            .lock()
            .unwrap()
            .remove(&session.0)
            .ok_or(ContentStoreError::NoSuchSession(session.0))?;
        let _ = tokio::fs::remove_dir_all(&dir).await;
        Ok(())
    }

    async fn get(&self, digest: &ContentDigest) -> Result<Box<dyn AsyncRead + Send + Unpin>, ContentStoreError> {
        let data = self
            .blobs
            .lock()
            .unwrap()
            .get(digest)
            .cloned()
            .ok_or_else(|| ContentStoreError::NotFound(digest.clone()))?;
        Ok(Box::new(std::io::Cursor::new(data)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_blob() {
        let store = InMemoryContentStore::new();
        let (session, ingest_dir) = store.new_ingest_session().await.unwrap();
        tokio::fs::write(ingest_dir.join("layer.tar"), b"hello layer").await.unwrap();
        let digests = store.complete_ingest_session(session).await.unwrap();
        assert_eq!(digests.len(), 1);
        assert!(digests[0].starts_with("sha256:"));

        let mut reader = store.get(&digests[0]).await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello layer");
    }

    #[tokio::test]
    async fn cancel_discards_session() {
        let store = InMemoryContentStore::new();
        let (session, ingest_dir) = store.new_ingest_session().await.unwrap();
        store.cancel_ingest_session(session.clone()).await.unwrap();
        assert!(!ingest_dir.exists());
        let err = store.complete_ingest_session(session).await.unwrap_err();
        assert!(matches!(err, ContentStoreError::NoSuchSession(_)));
    }

    #[tokio::test]
    async fn empty_session_fails_to_complete() {
        let store = InMemoryContentStore::new();
        let (session, _ingest_dir) = store.new_ingest_session().await.unwrap();
        let err = store.complete_ingest_session(session).await.unwrap_err();
        assert!(matches!(err, ContentStoreError::EmptySession(_)));
    }

    #[tokio::test]
    async fn get_missing_digest_fails() {
        let store = InMemoryContentStore::new();
        let err = store.get(&"sha256:deadbeef".to_string()).await.unwrap_err();
        assert!(matches!(err, ContentStoreError::NotFound(_)));
    }
}
