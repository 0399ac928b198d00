//! Finalization: assemble, publish, mint, commit, exactly once.
//!
//! The protocol runs under a KV lease (`SET NX` with TTL) refreshed by a
//! background task. Publish and mint each checkpoint their result into the
//! meta hash the moment it exists, so a retried finalization after a crash
//! skips straight past anything that already happened: the publisher is
//! never paid twice and the registry is never asked to mint twice once the
//! blob id is durable. Losing the lease aborts the protocol without marking
//! the upload failed, since another owner holds it now.

use std::sync::Arc;
use std::time::Duration;

use floe_base::config::GatewayConfig;
use floe_base::keys;
use floe_base::model::{AssetFields, UploadMeta, UploadSession, UploadStatus};
use floe_kv::{KvError, KvOp, KvStore};
use floe_sui::{MintRequest, Registry, RegistryError};
use floe_walrus::{PublishCoordinator, PublishError, PublishRequest};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chunk_store::{ChunkStore, ChunkStoreError};
use crate::session::{now_millis, SessionError, SessionService};

pub type FinalizeResult<T> = Result<T, FinalizeError>;

#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error("finalization already in progress")]
    InProgress,
    #[error("finalize lease lost to another owner")]
    LockLost,
    #[error("received {actual} of {expected} chunks")]
    Incomplete { expected: u64, actual: u64 },
    #[error("chunk {index} missing on disk")]
    MissingChunk { index: u64 },
    #[error("completed upload is missing its commit record")]
    CorruptCompleted,
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Chunks(#[from] ChunkStoreError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FinalizeOutcome {
    pub file_id: String,
    pub blob_id: String,
    pub size_bytes: u64,
}

pub struct FinalizeEngine {
    kv: Arc<dyn KvStore>,
    sessions: Arc<SessionService>,
    chunks: Arc<ChunkStore>,
    coordinator: Arc<PublishCoordinator>,
    registry: Arc<dyn Registry>,
    config: Arc<GatewayConfig>,
}

impl FinalizeEngine {
    pub fn new(
        kv: Arc<dyn KvStore>,
        sessions: Arc<SessionService>,
        chunks: Arc<ChunkStore>,
        coordinator: Arc<PublishCoordinator>,
        registry: Arc<dyn Registry>,
        config: Arc<GatewayConfig>,
    ) -> Self {
        Self {
            kv,
            sessions,
            chunks,
            coordinator,
            registry,
            config,
        }
    }

    fn outcome_from_meta(meta: &UploadMeta) -> FinalizeResult<FinalizeOutcome> {
        match (&meta.file_id, &meta.blob_id, meta.size_bytes) {
            (Some(file_id), Some(blob_id), Some(size_bytes)) => Ok(FinalizeOutcome {
                file_id: file_id.clone(),
                blob_id: blob_id.clone(),
                size_bytes,
            }),
            _ => Err(FinalizeError::CorruptCompleted),
        }
    }

    /// Idempotent replay: an already-committed upload answers from meta.
    pub async fn completed_outcome(
        &self,
        upload_id: &Uuid,
    ) -> FinalizeResult<Option<FinalizeOutcome>> {
        let meta = self.sessions.get_meta(upload_id).await?;
        if meta.status == Some(UploadStatus::Completed) {
            return Self::outcome_from_meta(&meta).map(Some);
        }
        Ok(None)
    }

    /// Run the full protocol for `session`. Serialized per session by the
    /// KV lease; concurrent callers get [`FinalizeError::InProgress`].
    pub async fn complete(&self, session: &UploadSession) -> FinalizeResult<FinalizeOutcome> {
        let upload_id = session.upload_id;

        if let Some(outcome) = self.completed_outcome(&upload_id).await? {
            return Ok(outcome);
        }

        let lock_key = keys::lock_key(&upload_id);
        let token = Uuid::new_v4().to_string();
        let acquired = self
            .kv
            .set_nx_ex(&lock_key, &token, self.config.finalize.lock_ttl)
            .await?;
        if !acquired {
            return Err(FinalizeError::InProgress);
        }

        // The refresher cancels this token the moment the lease is observed
        // under someone else's token; every stage checks it before doing
        // anything irreversible.
        let lost = CancellationToken::new();
        let refresher = tokio::spawn(refresh_lease(
            self.kv.clone(),
            lock_key.clone(),
            token.clone(),
            lost.clone(),
            self.config.finalize.lock_refresh,
            self.config.finalize.lock_ttl,
        ));

        let result = self.run_locked(session, &lost).await;

        refresher.abort();
        match self.kv.get(&lock_key).await {
            Ok(Some(current)) if current == token => {
                let _ = self.kv.del(&lock_key).await;
            }
            _ => {}
        }

        if let Err(err) = &result {
            if !matches!(err, FinalizeError::InProgress | FinalizeError::LockLost) {
                let _ = self
                    .sessions
                    .set_meta(
                        &upload_id,
                        vec![
                            ("status".into(), UploadStatus::Failed.as_str().into()),
                            ("failed_at".into(), now_millis().to_string()),
                            ("error".into(), err.to_string()),
                        ],
                    )
                    .await;
                warn!(%upload_id, error = %err, "finalization failed");
            }
        }

        result
    }

    async fn run_locked(
        &self,
        session: &UploadSession,
        lost: &CancellationToken,
    ) -> FinalizeResult<FinalizeOutcome> {
        let upload_id = session.upload_id;

        // Another finalizer may have committed between our fast path and
        // the lock acquisition.
        let meta = self.sessions.get_meta(&upload_id).await?;
        if meta.status == Some(UploadStatus::Completed) {
            return Self::outcome_from_meta(&meta);
        }

        self.sessions
            .set_meta_status(&upload_id, UploadStatus::Finalizing, "finalizing_at")
            .await?;

        let received = self.sessions.received_count(&upload_id).await?;
        if received != session.total_chunks {
            return Err(FinalizeError::Incomplete {
                expected: session.total_chunks,
                actual: received,
            });
        }
        let on_disk = self.chunks.list_chunks(&upload_id).await?;
        for index in 0..session.total_chunks {
            if on_disk.binary_search(&index).is_err() {
                return Err(FinalizeError::MissingChunk { index });
            }
        }

        if meta.blob_id.is_none() {
            self.ensure_lease(lost)?;
            self.assemble(session).await?;
        }

        let blob_id = match meta.blob_id.clone() {
            Some(blob_id) => blob_id,
            None => {
                self.ensure_lease(lost)?;
                let request = PublishRequest {
                    upload_id,
                    file_path: self.chunks.assembled_path(&upload_id),
                    size_bytes: session.size_bytes,
                    epochs: session.epochs,
                };
                let blob_id = self.coordinator.submit(request, lost).await?;
                // The once-and-for-all marker: after this write, no retry
                // of the protocol will ever publish again.
                self.sessions
                    .set_meta(
                        &upload_id,
                        vec![
                            ("blob_id".into(), blob_id.clone()),
                            ("walrus_uploaded_at".into(), now_millis().to_string()),
                        ],
                    )
                    .await?;
                blob_id
            }
        };

        let file_id = match meta.file_id.clone() {
            Some(file_id) => file_id,
            None => {
                self.ensure_lease(lost)?;
                let minted = self
                    .registry
                    .mint_asset(&MintRequest {
                        blob_id: blob_id.clone(),
                        size_bytes: session.size_bytes,
                        mime: session.content_type.clone(),
                        owner: self.config.sui.owner_address.clone(),
                    })
                    .await?;
                self.sessions
                    .set_meta(
                        &upload_id,
                        vec![
                            ("file_id".into(), minted.object_id.clone()),
                            ("metadata_finalized_at".into(), now_millis().to_string()),
                        ],
                    )
                    .await?;
                self.prime_fields_cache(&minted.object_id, &blob_id, session)
                    .await;
                minted.object_id
            }
        };

        self.chunks.cleanup(&upload_id).await;

        self.kv
            .atomic(vec![
                KvOp::HSet {
                    key: keys::meta_key(&upload_id),
                    fields: vec![
                        ("status".into(), UploadStatus::Completed.as_str().into()),
                        ("completed_at".into(), now_millis().to_string()),
                        ("file_id".into(), file_id.clone()),
                        ("blob_id".into(), blob_id.clone()),
                        ("size_bytes".into(), session.size_bytes.to_string()),
                    ],
                    ttl: None,
                },
                KvOp::Del {
                    key: keys::session_key(&upload_id),
                },
                KvOp::Del {
                    key: keys::chunks_key(&upload_id),
                },
                KvOp::SRem {
                    key: keys::gc_active_key().to_string(),
                    member: upload_id.to_string(),
                },
            ])
            .await?;

        info!(%upload_id, file_id, blob_id, size_bytes = session.size_bytes, "upload finalized");
        Ok(FinalizeOutcome {
            file_id,
            blob_id,
            size_bytes: session.size_bytes,
        })
    }

    fn ensure_lease(&self, lost: &CancellationToken) -> FinalizeResult<()> {
        if lost.is_cancelled() {
            return Err(FinalizeError::LockLost);
        }
        Ok(())
    }

    /// Concatenate chunks in strictly ascending index order into the
    /// transient assembled file.
    async fn assemble(&self, session: &UploadSession) -> FinalizeResult<()> {
        let upload_id = session.upload_id;
        let path = self.chunks.assembled_path(&upload_id);
        let mut out = tokio::fs::File::create(&path).await?;
        for index in 0..session.total_chunks {
            let mut chunk = self.chunks.open_chunk(&upload_id, index).await?;
            tokio::io::copy(&mut chunk, &mut out).await?;
        }
        out.flush().await?;
        out.sync_all().await?;
        debug!(%upload_id, path = %path.display(), "assembled upload");
        Ok(())
    }

    /// Eagerly seed the asset-fields cache so reads right after completion
    /// do not depend on registry availability.
    async fn prime_fields_cache(&self, file_id: &str, blob_id: &str, session: &UploadSession) {
        let fields = AssetFields {
            blob_id: blob_id.to_string(),
            size_bytes: session.size_bytes,
            mime: session.content_type.clone(),
            created_at: Some(now_millis()),
            owner: self.config.sui.owner_address.clone(),
        };
        match serde_json::to_string(&fields) {
            Ok(json) => {
                if let Err(e) = self
                    .kv
                    .set_ex(
                        &keys::file_fields_key(file_id),
                        &json,
                        self.config.stream.fields_cache_ttl,
                    )
                    .await
                {
                    warn!(file_id, error = %e, "failed to prime fields cache");
                }
            }
            Err(e) => warn!(file_id, error = %e, "failed to encode fields cache entry"),
        }
    }
}

async fn refresh_lease(
    kv: Arc<dyn KvStore>,
    lock_key: String,
    token: String,
    lost: CancellationToken,
    every: Duration,
    ttl: Duration,
) {
    loop {
        tokio::time::sleep(every).await;
        match kv.get(&lock_key).await {
            Ok(Some(current)) if current == token => {
                if let Err(e) = kv.expire(&lock_key, ttl).await {
                    warn!(error = %e, "failed to refresh finalize lease");
                }
            }
            Ok(_) => {
                warn!("finalize lease lost; aborting protocol");
                lost.cancel();
                return;
            }
            // A transient KV error is not evidence of a lost lease.
            Err(e) => warn!(error = %e, "finalize lease check failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::Utc;
    use floe_kv::MemoryKv;
    use floe_walrus::BlobPublisher;
    use sha2::Digest;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct CountingPublisher {
        calls: AtomicU32,
        fail_status: Option<u16>,
    }

    #[async_trait]
    impl BlobPublisher for CountingPublisher {
        async fn publish(
            &self,
            req: &PublishRequest,
            _cancel: &CancellationToken,
        ) -> Result<String, PublishError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(status) = self.fail_status {
                return Err(PublishError::Failed {
                    status,
                    body: "mock".into(),
                });
            }
            // The assembled file must exist by the time we are called.
            let bytes = tokio::fs::read(&req.file_path).await?;
            assert_eq!(bytes.len() as u64, req.size_bytes);
            Ok(format!("blob-{}", hex::encode(&sha2::Sha256::digest(&bytes)[..6])))
        }
    }

    struct CountingRegistry {
        mints: AtomicU32,
        minted: Mutex<Vec<MintRequest>>,
    }

    #[async_trait]
    impl Registry for CountingRegistry {
        async fn mint_asset(
            &self,
            req: &MintRequest,
        ) -> Result<floe_sui::MintedAsset, RegistryError> {
            let n = self.mints.fetch_add(1, Ordering::SeqCst);
            self.minted.lock().unwrap().push(req.clone());
            Ok(floe_sui::MintedAsset {
                object_id: format!("0xfile{n}"),
            })
        }

        async fn get_asset_fields(&self, _file_id: &str) -> Result<AssetFields, RegistryError> {
            Err(RegistryError::NotFound)
        }

        async fn check_balance(&self, _address: &str) -> Result<u64, RegistryError> {
            Ok(u64::MAX)
        }
    }

    struct Fixture {
        engine: FinalizeEngine,
        sessions: Arc<SessionService>,
        kv: Arc<MemoryKv>,
        chunks: Arc<ChunkStore>,
        publisher: Arc<CountingPublisher>,
        registry: Arc<CountingRegistry>,
        session: UploadSession,
    }

    async fn fixture(fail_status: Option<u16>) -> Fixture {
        let tmp = std::env::temp_dir().join(format!("floe-finalize-test-{}", Uuid::new_v4()));
        let config = Arc::new(crate::session::tests::test_config(tmp.clone()));
        let kv: Arc<MemoryKv> = Arc::new(MemoryKv::new());
        let chunks = Arc::new(ChunkStore::new(&tmp));
        let sessions = Arc::new(SessionService::new(kv.clone(), chunks.clone(), config.clone()));
        let publisher = Arc::new(CountingPublisher {
            calls: AtomicU32::new(0),
            fail_status,
        });
        let registry = Arc::new(CountingRegistry {
            mints: AtomicU32::new(0),
            minted: Mutex::new(Vec::new()),
        });
        let coordinator = Arc::new(PublishCoordinator::new(
            publisher.clone(),
            2,
            100,
            Duration::from_millis(10),
            2,
            Duration::from_millis(1),
        ));
        let engine = FinalizeEngine::new(
            kv.clone(),
            sessions.clone(),
            chunks.clone(),
            coordinator,
            registry.clone(),
            config.clone(),
        );

        let session = UploadSession {
            upload_id: Uuid::new_v4(),
            filename: "data.bin".into(),
            content_type: "application/octet-stream".into(),
            size_bytes: 10,
            chunk_size: 4,
            total_chunks: 3,
            epochs: 1,
            status: UploadStatus::Uploading,
            created_at: Utc::now(),
            expires_at: Utc::now(),
        };
        sessions.create(&session).await.unwrap();

        // Land all three chunks: 4 + 4 + 2 bytes.
        for (index, data) in [&b"aaaa"[..], &b"bbbb"[..], &b"cc"[..]].iter().enumerate() {
            let stream = futures::stream::iter(vec![Ok::<_, std::io::Error>(
                Bytes::copy_from_slice(data),
            )]);
            chunks
                .write_chunk(
                    &session.upload_id,
                    index as u64,
                    stream,
                    &hex::encode(sha2::Sha256::digest(data)),
                    session.expected_chunk_size(index as u64),
                    session.is_last_chunk(index as u64),
                )
                .await
                .unwrap();
            sessions
                .add_received(&session.upload_id, index as u64)
                .await
                .unwrap();
        }

        Fixture {
            engine,
            sessions,
            kv,
            chunks,
            publisher,
            registry,
            session,
        }
    }

    #[tokio::test]
    async fn happy_path_publishes_mints_and_commits() {
        let fx = fixture(None).await;
        let outcome = fx.engine.complete(&fx.session).await.unwrap();
        assert_eq!(outcome.size_bytes, 10);
        assert!(outcome.file_id.starts_with("0xfile"));
        assert_eq!(fx.publisher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fx.registry.mints.load(Ordering::SeqCst), 1);

        // Session gone, meta terminal, GC membership dropped.
        assert!(fx.sessions.get(&fx.session.upload_id).await.unwrap().is_none());
        let meta = fx.sessions.get_meta(&fx.session.upload_id).await.unwrap();
        assert_eq!(meta.status, Some(UploadStatus::Completed));
        assert_eq!(fx.sessions.active_count().await.unwrap(), 0);

        // Disk artifacts cleaned up.
        assert!(fx.chunks.list_chunks(&fx.session.upload_id).await.unwrap().is_empty());

        // Fields cache primed.
        let cached = fx
            .kv
            .get(&keys::file_fields_key(&outcome.file_id))
            .await
            .unwrap()
            .expect("fields cache entry");
        let fields: AssetFields = serde_json::from_str(&cached).unwrap();
        assert_eq!(fields.blob_id, outcome.blob_id);
        assert_eq!(fields.size_bytes, 10);
        let _ = std::fs::remove_dir_all(fx.chunks.root());
    }

    #[tokio::test]
    async fn replay_after_commit_never_publishes_again() {
        let fx = fixture(None).await;
        let first = fx.engine.complete(&fx.session).await.unwrap();
        let second = fx.engine.complete(&fx.session).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(fx.publisher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fx.registry.mints.load(Ordering::SeqCst), 1);
        let _ = std::fs::remove_dir_all(fx.chunks.root());
    }

    #[tokio::test]
    async fn checkpointed_blob_id_skips_publish() {
        let fx = fixture(None).await;
        fx.sessions
            .set_meta(
                &fx.session.upload_id,
                vec![("blob_id".into(), "blob-preexisting".into())],
            )
            .await
            .unwrap();

        let outcome = fx.engine.complete(&fx.session).await.unwrap();
        assert_eq!(outcome.blob_id, "blob-preexisting");
        assert_eq!(fx.publisher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(fx.registry.mints.load(Ordering::SeqCst), 1);
        assert_eq!(
            fx.registry.minted.lock().unwrap()[0].blob_id,
            "blob-preexisting"
        );
        let _ = std::fs::remove_dir_all(fx.chunks.root());
    }

    #[tokio::test]
    async fn held_lock_turns_into_in_progress() {
        let fx = fixture(None).await;
        fx.kv
            .set_nx_ex(
                &keys::lock_key(&fx.session.upload_id),
                "someone-else",
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        let err = fx.engine.complete(&fx.session).await.unwrap_err();
        assert!(matches!(err, FinalizeError::InProgress));
        assert_eq!(fx.publisher.calls.load(Ordering::SeqCst), 0);
        let _ = std::fs::remove_dir_all(fx.chunks.root());
    }

    #[tokio::test]
    async fn publish_failure_marks_meta_failed_and_releases_lock() {
        let fx = fixture(Some(403)).await;
        let err = fx.engine.complete(&fx.session).await.unwrap_err();
        assert!(matches!(err, FinalizeError::Publish(_)));

        let meta = fx.sessions.get_meta(&fx.session.upload_id).await.unwrap();
        assert_eq!(meta.status, Some(UploadStatus::Failed));
        assert!(meta.error.is_some());

        // Lock released: a retry is admitted (and fails the same way, not
        // with InProgress).
        let err = fx.engine.complete(&fx.session).await.unwrap_err();
        assert!(matches!(err, FinalizeError::Publish(_)));
        let _ = std::fs::remove_dir_all(fx.chunks.root());
    }

    #[tokio::test]
    async fn incomplete_chunk_set_is_rejected() {
        let fx = fixture(None).await;
        fx.kv
            .srem(&keys::chunks_key(&fx.session.upload_id), "1")
            .await
            .unwrap();
        let err = fx.engine.complete(&fx.session).await.unwrap_err();
        assert!(matches!(
            err,
            FinalizeError::Incomplete {
                expected: 3,
                actual: 2
            }
        ));
        let _ = std::fs::remove_dir_all(fx.chunks.root());
    }

    #[tokio::test]
    async fn assembled_bytes_equal_ascending_chunk_order() {
        let fx = fixture(None).await;
        fx.engine.assemble(&fx.session).await.unwrap();
        let assembled = tokio::fs::read(fx.chunks.assembled_path(&fx.session.upload_id))
            .await
            .unwrap();
        assert_eq!(assembled, b"aaaabbbbcc");
        assert_eq!(assembled.len() as u64, fx.session.size_bytes);
        let _ = std::fs::remove_dir_all(fx.chunks.root());
    }
}
