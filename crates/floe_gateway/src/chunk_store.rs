//! On-disk staging area for uploaded chunks.
//!
//! A chunk lands as `tmp/<uploadId>/<index>`; the assembled file as
//! `tmp/<uploadId>.bin`. Writers stage into `<index>.tmp` opened with
//! exclusive-create and rename into place after validation, which makes
//! replays idempotent and concurrent writers safe without any lock.
//! Renaming into the upload directory also bumps its mtime, which is what
//! the reaper uses for freshness.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

/// Temp files older than this are considered wreckage of a crashed writer
/// and may be reclaimed.
const STALE_TEMP_AGE: Duration = Duration::from_secs(10 * 60);

pub type ChunkStoreResult<T> = Result<T, ChunkStoreError>;

#[derive(Debug, Error)]
pub enum ChunkStoreError {
    #[error("chunk digest mismatch: expected {expected}, computed {actual}")]
    HashMismatch { expected: String, actual: String },
    #[error("chunk exceeds expected size of {expected} bytes")]
    TooLarge { expected: u64 },
    #[error("chunk size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("last chunk size {actual} must be in (0, {max}]")]
    InvalidLastChunkSize { actual: u64, max: u64 },
    #[error("another writer is persisting this chunk")]
    InProgress,
    #[error("chunk body stream failed: {0}")]
    Stream(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub struct ChunkStore {
    root: PathBuf,
    stale_temp_age: Duration,
}

impl ChunkStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            stale_temp_age: STALE_TEMP_AGE,
        }
    }

    #[cfg(test)]
    fn with_stale_temp_age(mut self, age: Duration) -> Self {
        self.stale_temp_age = age;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Startup probe: the staging directory must exist and be writable.
    pub async fn probe_writable(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.root).await?;
        let probe = self.root.join(".floe-write-probe");
        fs::write(&probe, b"probe").await?;
        fs::remove_file(&probe).await?;
        Ok(())
    }

    pub fn upload_dir(&self, upload_id: &Uuid) -> PathBuf {
        self.root.join(upload_id.to_string())
    }

    pub fn assembled_path(&self, upload_id: &Uuid) -> PathBuf {
        self.root.join(format!("{upload_id}.bin"))
    }

    fn chunk_path(&self, upload_id: &Uuid, index: u64) -> PathBuf {
        self.upload_dir(upload_id).join(index.to_string())
    }

    pub async fn ensure_upload_dir(&self, upload_id: &Uuid) -> std::io::Result<()> {
        fs::create_dir_all(self.upload_dir(upload_id)).await
    }

    pub async fn has_chunk(&self, upload_id: &Uuid, index: u64) -> bool {
        fs::try_exists(self.chunk_path(upload_id, index))
            .await
            .unwrap_or(false)
    }

    /// Persist one chunk. Replays of an already-landed chunk are a no-op
    /// success; a concurrent writer on the same chunk surfaces as
    /// [`ChunkStoreError::InProgress`].
    pub async fn write_chunk<S, E>(
        &self,
        upload_id: &Uuid,
        index: u64,
        stream: S,
        expected_hash: &str,
        expected_size: u64,
        is_last: bool,
    ) -> ChunkStoreResult<()>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        self.ensure_upload_dir(upload_id).await?;

        let final_path = self.chunk_path(upload_id, index);
        if fs::try_exists(&final_path).await? {
            debug!(%upload_id, index, "chunk already persisted, replay is a no-op");
            return Ok(());
        }

        let tmp_path = self.upload_dir(upload_id).join(format!("{index}.tmp"));
        let Some(file) = self.open_exclusive(&final_path, &tmp_path).await? else {
            // A racer landed the final file while we were opening.
            return Ok(());
        };

        let result = self
            .stream_into(file, stream, expected_hash, expected_size, is_last)
            .await;

        match result {
            Ok(()) => {
                // Atomic within the staging filesystem; bumps the upload
                // directory's mtime for the reaper.
                if let Err(e) = fs::rename(&tmp_path, &final_path).await {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(e.into());
                }
                Ok(())
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp_path).await;
                Err(e)
            }
        }
    }

    /// Exclusive-create of the temp file, reclaiming stale wreckage once.
    /// `Ok(None)` means the final file appeared concurrently and the write
    /// should be treated as an idempotent replay.
    async fn open_exclusive(
        &self,
        final_path: &Path,
        tmp_path: &Path,
    ) -> ChunkStoreResult<Option<File>> {
        for attempt in 0..2 {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(tmp_path)
                .await
            {
                Ok(file) => return Ok(Some(file)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    // A racer may have just finished: the final file wins.
                    if fs::try_exists(final_path).await? {
                        return Ok(None);
                    }
                    let stale = match fs::metadata(tmp_path).await {
                        Ok(meta) => meta
                            .modified()
                            .ok()
                            .and_then(|m| SystemTime::now().duration_since(m).ok())
                            .is_some_and(|age| age >= self.stale_temp_age),
                        // Temp vanished between the open and the stat.
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
                        Err(e) => return Err(e.into()),
                    };
                    if !stale || attempt == 1 {
                        return Err(ChunkStoreError::InProgress);
                    }
                    warn!(path = %tmp_path.display(), "reclaiming stale chunk temp file");
                    match fs::remove_file(tmp_path).await {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ChunkStoreError::InProgress)
    }

    async fn stream_into<S, E>(
        &self,
        mut file: File,
        mut stream: S,
        expected_hash: &str,
        expected_size: u64,
        is_last: bool,
    ) -> ChunkStoreResult<()>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let mut hasher = Sha256::new();
        let mut written: u64 = 0;

        while let Some(piece) = stream.next().await {
            let piece = piece.map_err(|e| ChunkStoreError::Stream(e.into().to_string()))?;
            written += piece.len() as u64;
            if written > expected_size {
                return Err(ChunkStoreError::TooLarge {
                    expected: expected_size,
                });
            }
            hasher.update(&piece);
            file.write_all(&piece).await?;
        }
        file.flush().await?;

        let actual = hex::encode(hasher.finalize());
        if actual != expected_hash {
            return Err(ChunkStoreError::HashMismatch {
                expected: expected_hash.to_string(),
                actual,
            });
        }

        if is_last {
            if written == 0 || written > expected_size {
                return Err(ChunkStoreError::InvalidLastChunkSize {
                    actual: written,
                    max: expected_size,
                });
            }
        } else if written != expected_size {
            return Err(ChunkStoreError::SizeMismatch {
                expected: expected_size,
                actual: written,
            });
        }

        Ok(())
    }

    /// Chunk indices present on disk, ascending. Temp files are skipped.
    pub async fn list_chunks(&self, upload_id: &Uuid) -> ChunkStoreResult<Vec<u64>> {
        let mut indices = Vec::new();
        let mut dir = match fs::read_dir(self.upload_dir(upload_id)).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(indices),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = dir.next_entry().await? {
            if let Some(index) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u64>().ok())
            {
                indices.push(index);
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }

    /// Lazy read handle over a persisted chunk.
    pub async fn open_chunk(&self, upload_id: &Uuid, index: u64) -> ChunkStoreResult<File> {
        Ok(File::open(self.chunk_path(upload_id, index)).await?)
    }

    /// Last-modified time of the upload's artifacts: the assembled file if
    /// present, else the chunk directory.
    pub async fn artifact_mtime(&self, upload_id: &Uuid) -> Option<SystemTime> {
        for path in [self.assembled_path(upload_id), self.upload_dir(upload_id)] {
            if let Ok(meta) = fs::metadata(&path).await {
                if let Ok(modified) = meta.modified() {
                    return Some(modified);
                }
            }
        }
        None
    }

    /// Best-effort recursive delete of the chunk directory and the
    /// assembled file.
    pub async fn cleanup(&self, upload_id: &Uuid) {
        let dir = self.upload_dir(upload_id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %dir.display(), error = %e, "failed to remove chunk directory"),
        }
        let bin = self.assembled_path(upload_id);
        match fs::remove_file(&bin).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %bin.display(), error = %e, "failed to remove assembled file"),
        }
    }
}
