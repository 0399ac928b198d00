//! Garbage collection of abandoned uploads.
//!
//! The reaper walks the GC index on a fixed interval. It never touches an
//! upload whose finalize lock exists, never collects outside the terminal
//! statuses {failed, expired, canceled}, and never deletes artifacts less
//! than the grace window after their last mtime. A session whose key has
//! expired while meta still says uploading/finalizing is first transitioned
//! to expired (a TTL elapsing is not a state transition by itself).
//!
//! The orphan reconciler runs once at startup and adopts on-disk leftovers
//! that the GC index has never heard of, so a crash between disk writes and
//! KV writes cannot strand artifacts forever.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use floe_base::config::GatewayConfig;
use floe_base::keys;
use floe_base::model::{UploadMeta, UploadStatus};
use floe_kv::{KvOp, KvStore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chunk_store::ChunkStore;
use crate::session::now_millis;

pub struct Reaper {
    kv: Arc<dyn KvStore>,
    chunks: Arc<ChunkStore>,
    config: Arc<GatewayConfig>,
    in_flight: AtomicBool,
}

impl Reaper {
    pub fn new(kv: Arc<dyn KvStore>, chunks: Arc<ChunkStore>, config: Arc<GatewayConfig>) -> Self {
        Self {
            kv,
            chunks,
            config,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Periodic loop. Ticks that overlap a still-running pass are skipped.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let reaper = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(reaper.config.gc.reaper_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                match reaper.run_once().await {
                    Ok(0) => {}
                    Ok(collected) => info!(collected, "reaper pass finished"),
                    Err(e) => warn!(error = %e, "reaper pass failed"),
                }
            }
        })
    }

    /// One full pass over the GC index. Returns how many uploads were
    /// collected.
    pub async fn run_once(&self) -> anyhow::Result<u64> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            debug!("previous reaper pass still running, skipping");
            return Ok(0);
        }
        let result = self.sweep().await;
        self.in_flight.store(false, Ordering::SeqCst);
        result
    }

    async fn sweep(&self) -> anyhow::Result<u64> {
        let members = self.kv.smembers(keys::gc_active_key()).await?;
        let mut collected = 0u64;
        for member in members {
            // Stay cooperative under a large backlog.
            tokio::task::yield_now().await;

            let Ok(upload_id) = member.parse::<Uuid>() else {
                warn!(member, "non-UUID entry in GC index, dropping");
                let _ = self.kv.srem(keys::gc_active_key(), &member).await;
                continue;
            };
            match self.inspect(&upload_id).await {
                Ok(true) => collected += 1,
                Ok(false) => {}
                Err(e) => warn!(%upload_id, error = %e, "failed to inspect upload"),
            }
        }
        Ok(collected)
    }

    /// Returns whether the upload's artifacts were collected.
    async fn inspect(&self, upload_id: &Uuid) -> anyhow::Result<bool> {
        // Hard safety: a held finalize lock freezes the upload entirely.
        if self.kv.get(&keys::lock_key(upload_id)).await?.is_some() {
            return Ok(false);
        }

        let session_fields = self.kv.hgetall(&keys::session_key(upload_id)).await?;
        let meta_fields = self.kv.hgetall(&keys::meta_key(upload_id)).await?;
        let meta = UploadMeta::from_fields(&meta_fields);

        let mut status = meta.status;
        let session_gone = session_fields.is_empty();
        if session_gone
            && matches!(
                status,
                Some(UploadStatus::Uploading) | Some(UploadStatus::Finalizing)
            )
        {
            self.kv
                .hset(
                    &keys::meta_key(upload_id),
                    &[
                        ("status".into(), UploadStatus::Expired.as_str().into()),
                        ("expired_at".into(), now_millis().to_string()),
                    ],
                )
                .await?;
            debug!(%upload_id, "session TTL elapsed, marked expired");
            status = Some(UploadStatus::Expired);
        }

        let collectible = status.is_some_and(|s| s.is_collectible());
        if !collectible {
            return Ok(false);
        }

        let Some(mtime) = self.chunks.artifact_mtime(upload_id).await else {
            // Nothing on disk: drop the bookkeeping right away.
            self.purge_keys(upload_id, false).await?;
            debug!(%upload_id, "no artifacts on disk, purged keys");
            return Ok(true);
        };

        let age = SystemTime::now()
            .duration_since(mtime)
            .unwrap_or_default();
        if age < self.config.gc.grace {
            return Ok(false);
        }

        self.chunks.cleanup(upload_id).await;
        self.purge_keys(upload_id, true).await?;
        info!(%upload_id, status = ?status, "collected abandoned upload");
        Ok(true)
    }

    async fn purge_keys(&self, upload_id: &Uuid, include_meta: bool) -> anyhow::Result<()> {
        let mut ops = vec![
            KvOp::Del {
                key: keys::session_key(upload_id),
            },
            KvOp::Del {
                key: keys::chunks_key(upload_id),
            },
            KvOp::SRem {
                key: keys::gc_active_key().to_string(),
                member: upload_id.to_string(),
            },
        ];
        if include_meta {
            ops.push(KvOp::Del {
                key: keys::meta_key(upload_id),
            });
        }
        self.kv.atomic(ops).await?;
        Ok(())
    }
}

/// Startup reconciliation: adopt staging-directory leftovers into the GC
/// index so the reaper can eventually collect them. Only names that parse
/// as UUID v4 (`<uuid>/` or `<uuid>.bin`) are considered.
pub async fn reconcile_orphans(
    kv: &Arc<dyn KvStore>,
    chunks: &ChunkStore,
    config: &GatewayConfig,
) -> anyhow::Result<u64> {
    let known: std::collections::HashSet<String> =
        kv.smembers(keys::gc_active_key()).await?.into_iter().collect();

    let mut dir = match tokio::fs::read_dir(chunks.root()).await {
        Ok(dir) => dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut adopted = 0u64;
    let meta_ttl = config.upload.session_ttl + config.upload.meta_ttl_slack;
    while let Some(entry) = dir.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let candidate = name.strip_suffix(".bin").unwrap_or(name);
        let Ok(upload_id) = candidate.parse::<Uuid>() else {
            continue;
        };
        if known.contains(&upload_id.to_string()) {
            continue;
        }

        kv.atomic(vec![
            KvOp::SAdd {
                key: keys::gc_active_key().to_string(),
                member: upload_id.to_string(),
            },
            KvOp::HSet {
                key: keys::meta_key(&upload_id),
                fields: vec![
                    ("status".into(), UploadStatus::Expired.as_str().into()),
                    ("recovered_at".into(), now_millis().to_string()),
                ],
                ttl: Some(meta_ttl),
            },
        ])
        .await?;
        info!(%upload_id, "adopted orphaned upload artifacts");
        adopted += 1;
    }
    Ok(adopted)
}
