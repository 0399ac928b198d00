//! Session lifecycle across KV and disk.
//!
//! A session is three KV keys (session hash, meta hash, membership in the
//! GC index) created in one atomic multi-op, plus an on-disk chunk
//! directory. The meta hash gets a longer TTL than the session so terminal
//! state stays observable after the session key has expired.

use std::sync::Arc;

use chrono::Utc;
use floe_base::config::GatewayConfig;
use floe_base::keys;
use floe_base::model::{ModelError, UploadMeta, UploadSession, UploadStatus};
use floe_kv::{KvError, KvOp, KvStore};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::chunk_store::ChunkStore;

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("corrupt upload session: {0}")]
    Corrupt(#[from] ModelError),
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error("failed to create upload staging directory: {0}")]
    Io(#[from] std::io::Error),
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub struct SessionService {
    kv: Arc<dyn KvStore>,
    chunks: Arc<ChunkStore>,
    config: Arc<GatewayConfig>,
}

impl SessionService {
    pub fn new(kv: Arc<dyn KvStore>, chunks: Arc<ChunkStore>, config: Arc<GatewayConfig>) -> Self {
        Self { kv, chunks, config }
    }

    /// Cardinality of the GC index; the create-time capacity gate.
    pub async fn active_count(&self) -> SessionResult<u64> {
        Ok(self.kv.scard(keys::gc_active_key()).await?)
    }

    /// Write session + meta + GC membership in one atomic step, then make
    /// the chunk directory (idempotent).
    pub async fn create(&self, session: &UploadSession) -> SessionResult<()> {
        let id = &session.upload_id;
        let session_ttl = self.config.upload.session_ttl;
        let meta_ttl = session_ttl + self.config.upload.meta_ttl_slack;

        let meta_fields = vec![
            ("status".to_string(), session.status.as_str().to_string()),
            (
                "created_at".to_string(),
                session.created_at.timestamp_millis().to_string(),
            ),
        ];

        self.kv
            .atomic(vec![
                KvOp::HSet {
                    key: keys::session_key(id),
                    fields: session.to_fields(),
                    ttl: Some(session_ttl),
                },
                KvOp::HSet {
                    key: keys::meta_key(id),
                    fields: meta_fields,
                    ttl: Some(meta_ttl),
                },
                KvOp::SAdd {
                    key: keys::gc_active_key().to_string(),
                    member: id.to_string(),
                },
            ])
            .await?;

        self.chunks.ensure_upload_dir(id).await?;
        debug!(upload_id = %id, total_chunks = session.total_chunks, "upload session created");
        Ok(())
    }

    /// Load the session record. `Ok(None)` when the key is gone (expired,
    /// completed or canceled); terminal state then lives in meta.
    pub async fn get(&self, upload_id: &Uuid) -> SessionResult<Option<UploadSession>> {
        let fields = self.kv.hgetall(&keys::session_key(upload_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(UploadSession::from_fields(&fields)?))
    }

    pub async fn get_meta(&self, upload_id: &Uuid) -> SessionResult<UploadMeta> {
        let fields = self.kv.hgetall(&keys::meta_key(upload_id)).await?;
        Ok(UploadMeta::from_fields(&fields))
    }

    /// Merge fields into the meta hash without touching its TTL.
    pub async fn set_meta(&self, upload_id: &Uuid, fields: Vec<(String, String)>) -> SessionResult<()> {
        self.kv.hset(&keys::meta_key(upload_id), &fields).await?;
        Ok(())
    }

    pub async fn set_meta_status(
        &self,
        upload_id: &Uuid,
        status: UploadStatus,
        at_field: &str,
    ) -> SessionResult<()> {
        self.set_meta(
            upload_id,
            vec![
                ("status".to_string(), status.as_str().to_string()),
                (at_field.to_string(), now_millis().to_string()),
            ],
        )
        .await
    }

    pub async fn add_received(&self, upload_id: &Uuid, index: u64) -> SessionResult<()> {
        self.kv
            .sadd(&keys::chunks_key(upload_id), &index.to_string())
            .await?;
        Ok(())
    }

    pub async fn received_count(&self, upload_id: &Uuid) -> SessionResult<u64> {
        Ok(self.kv.scard(&keys::chunks_key(upload_id)).await?)
    }

    /// Received chunk indices, ascending.
    pub async fn received_indices(&self, upload_id: &Uuid) -> SessionResult<Vec<u64>> {
        let mut indices: Vec<u64> = self
            .kv
            .smembers(&keys::chunks_key(upload_id))
            .await?
            .iter()
            .filter_map(|m| m.parse().ok())
            .collect();
        indices.sort_unstable();
        Ok(indices)
    }

    pub async fn lock_held(&self, upload_id: &Uuid) -> SessionResult<bool> {
        Ok(self.kv.get(&keys::lock_key(upload_id)).await?.is_some())
    }
}
