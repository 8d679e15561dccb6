//! UploadSessionManager: resumable chunked upload state machine.
//!
//! Grounded on the chunk-math and dedup rules in the Python original's
//! `web/routes/uploads.py`: chunk size and count are fixed at `init` time,
//! every chunk but the last is exactly `chunk_bytes`, and a chunk re-sent with
//! an identical sha256 to one already on disk is accepted as a no-op rather
//! than rejected, so a client retry after a dropped response is always safe.
//!
//! `init` is idempotent: a second `init` for the same `(owner_id, filename,
//! total_bytes)` with an existing incomplete session returns that session's
//! plan rather than creating a duplicate.

use crate::{ReceivedChunk, StateError, StateResult, StateStore, UploadSession};
use sha2::{Digest, Sha256};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkAcceptance {
    /// Chunk written for the first time.
    Accepted,
    /// Chunk already present with a matching sha256; treated as a no-op.
    Duplicate,
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("chunk index {index} out of range (total_chunks={total})")]
    ChunkOutOfRange { index: u64, total: u64 },
    #[error("chunk size mismatch at index {index}: expected {expected}, got {actual}")]
    ChunkSizeMismatch { index: u64, expected: u64, actual: u64 },
    #[error("chunk sha256 mismatch at index {index}")]
    ChunkChecksumMismatch { index: u64 },
    #[error("upload session already completed")]
    AlreadyCompleted,
    #[error("upload incomplete: missing chunks {missing:?}")]
    Incomplete { missing: Vec<u64> },
    #[error("final checksum mismatch: expected {expected}, got {actual}")]
    FinalChecksumMismatch { expected: String, actual: String },
}

pub struct UploadSessionManager {
    store: Arc<dyn StateStore>,
    upload_root: PathBuf,
}

impl UploadSessionManager {
    pub fn new(store: Arc<dyn StateStore>, upload_root: impl Into<PathBuf>) -> Self {
        Self {
            store,
            upload_root: upload_root.into(),
        }
    }

    #[instrument(skip(self), fields(owner_id, filename, total_bytes))]
    pub async fn init(
        &self,
        owner_id: &str,
        filename: &str,
        total_bytes: u64,
        chunk_bytes: u64,
        expected_sha256: Option<String>,
    ) -> Result<UploadSession, UploadError> {
        for existing in self.store.list_uploads(Some(owner_id), false).await? {
            if existing.filename == filename && existing.total_bytes == total_bytes && !existing.completed {
                return Ok(existing);
            }
        }

        let id = Uuid::new_v4().to_string();
        let total_chunks = total_bytes.div_ceil(chunk_bytes).max(1);
        let part_path = self.upload_root.join(format!("{id}.part"));
        let final_path = self.upload_root.join(format!("{id}_{filename}"));

        let now = chrono::Utc::now();
        let session = UploadSession {
            id,
            owner_id: owner_id.to_string(),
            filename: filename.to_string(),
            total_bytes,
            chunk_bytes,
            total_chunks,
            part_path: part_path.to_string_lossy().to_string(),
            final_path: final_path.to_string_lossy().to_string(),
            received: Default::default(),
            received_bytes: 0,
            completed: false,
            final_sha256: None,
            expected_sha256,
            created_at: now,
            updated_at: now,
        };

        std::fs::create_dir_all(&self.upload_root)?;
        // Pre-allocate the part file so chunk writes can seek to arbitrary
        // offsets without needing to append in order.
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&session.part_path)?;
        file.set_len(total_bytes)?;

        self.store.put_upload(&session).await?;
        Ok(session)
    }

    #[instrument(skip(self, data), fields(session_id, index, size = data.len()))]
    pub async fn put_chunk(
        &self,
        session_id: &str,
        index: u64,
        data: &[u8],
        claimed_sha256: &str,
    ) -> Result<ChunkAcceptance, UploadError> {
        let mut session = self
            .store
            .get_upload(session_id)
            .await?
            .ok_or_else(|| StateError::NotFound(session_id.to_string()))?;

        if session.completed {
            return Err(UploadError::AlreadyCompleted);
        }

        let expected_size = session
            .expected_chunk_size(index)
            .ok_or(UploadError::ChunkOutOfRange { index, total: session.total_chunks })?;

        if data.len() as u64 != expected_size {
            return Err(UploadError::ChunkSizeMismatch {
                index,
                expected: expected_size,
                actual: data.len() as u64,
            });
        }

        let actual_sha256 = hex::encode(Sha256::digest(data));
        if actual_sha256 != claimed_sha256 {
            return Err(UploadError::ChunkChecksumMismatch { index });
        }

        if let Some(existing) = session.received.get(&index) {
            if existing.sha256 == actual_sha256 {
                return Ok(ChunkAcceptance::Duplicate);
            }
        }

        let offset = session.expected_offset(index);
        write_chunk_at(Path::new(&session.part_path), offset, data)?;

        session.received.insert(
            index,
            ReceivedChunk {
                offset,
                size: data.len() as u64,
                sha256: actual_sha256,
            },
        );
        session.received_bytes += data.len() as u64;
        session.updated_at = chrono::Utc::now();

        self.store.put_upload(&session).await?;
        Ok(ChunkAcceptance::Accepted)
    }

    #[instrument(skip(self), fields(session_id))]
    pub async fn complete(&self, session_id: &str) -> Result<UploadSession, UploadError> {
        let mut session = self
            .store
            .get_upload(session_id)
            .await?
            .ok_or_else(|| StateError::NotFound(session_id.to_string()))?;

        if session.completed {
            return Ok(session);
        }

        let missing = session.missing_chunks();
        if !missing.is_empty() {
            return Err(UploadError::Incomplete { missing });
        }

        let part_path = session.part_path.clone();
        let final_digest = {
            let path = part_path.clone();
            tokio::task::spawn_blocking(move || hash_file(&path))
                .await
                .map_err(|e| UploadError::Io(std::io::Error::other(e)))??
        };

        if let Some(expected) = &session.expected_sha256 {
            if expected != &final_digest {
                return Err(UploadError::FinalChecksumMismatch {
                    expected: expected.clone(),
                    actual: final_digest,
                });
            }
        }

        std::fs::rename(&session.part_path, &session.final_path)?;

        session.completed = true;
        session.final_sha256 = Some(final_digest);
        session.updated_at = chrono::Utc::now();

        self.store.put_upload(&session).await?;
        Ok(session)
    }

    pub async fn resume(&self, session_id: &str) -> StateResult<Option<UploadSession>> {
        self.store.get_upload(session_id).await
    }
}

fn write_chunk_at(path: &Path, offset: u64, data: &[u8]) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new().write(true).open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)
}

fn hash_file(path: &str) -> Result<String, UploadError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::sqlite::SqliteStateStore;

    async fn harness() -> (UploadSessionManager, tempfile::TempDir) {
        let db_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            SqliteStateStore::open(db_dir.path().join("uploads.db").to_str().unwrap())
                .await
                .unwrap(),
        );
        let upload_dir = tempfile::tempdir().unwrap();
        let manager = UploadSessionManager::new(store, upload_dir.path());
        (manager, upload_dir)
    }

    #[tokio::test]
    async fn init_is_idempotent_for_incomplete_session() {
        let (manager, _dir) = harness().await;
        let a = manager
            .init("user1", "ep01.mp4", 10, 4, None)
            .await
            .unwrap();
        let b = manager
            .init("user1", "ep01.mp4", 10, 4, None)
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
    }

    #[tokio::test]
    async fn full_chunk_upload_completes_and_matches_checksum() {
        let (manager, _dir) = harness().await;
        let data = b"hello world upload bytes!".to_vec();
        let chunk_bytes = 8u64;
        let session = manager
            .init("user1", "clip.mp4", data.len() as u64, chunk_bytes, None)
            .await
            .unwrap();

        let mut offset = 0usize;
        let mut index = 0u64;
        while offset < data.len() {
            let end = (offset + chunk_bytes as usize).min(data.len());
            let chunk = &data[offset..end];
            let sha = hex::encode(Sha256::digest(chunk));
            let acceptance = manager
                .put_chunk(&session.id, index, chunk, &sha)
                .await
                .unwrap();
            assert_eq!(acceptance, ChunkAcceptance::Accepted);
            offset = end;
            index += 1;
        }

        let completed = manager.complete(&session.id).await.unwrap();
        assert!(completed.completed);

        let expected = hex::encode(Sha256::digest(&data));
        assert_eq!(completed.final_sha256, Some(expected));

        let on_disk = std::fs::read(&completed.final_path).unwrap();
        assert_eq!(on_disk, data);
    }

    #[tokio::test]
    async fn duplicate_chunk_with_matching_checksum_is_a_noop() {
        let (manager, _dir) = harness().await;
        let chunk = b"abcd1234".to_vec();
        let session = manager
            .init("user1", "clip.mp4", chunk.len() as u64, chunk.len() as u64, None)
            .await
            .unwrap();
        let sha = hex::encode(Sha256::digest(&chunk));

        let first = manager.put_chunk(&session.id, 0, &chunk, &sha).await.unwrap();
        assert_eq!(first, ChunkAcceptance::Accepted);

        let second = manager.put_chunk(&session.id, 0, &chunk, &sha).await.unwrap();
        assert_eq!(second, ChunkAcceptance::Duplicate);
    }

    #[tokio::test]
    async fn complete_rejects_incomplete_session() {
        let (manager, _dir) = harness().await;
        let session = manager
            .init("user1", "clip.mp4", 16, 8, None)
            .await
            .unwrap();
        let err = manager.complete(&session.id).await.unwrap_err();
        assert!(matches!(err, UploadError::Incomplete { .. }));
    }
}
