//! Floe gateway: resumable chunked ingestion in front of the Walrus object
//! store and the on-chain asset registry, plus a range-compliant read proxy.

pub mod chunk_store;
pub mod error;
pub mod finalize;
pub mod read;
pub mod reaper;
pub mod routes;
pub mod session;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post, put};
use axum::Router;
use floe_base::config::{validate_tmp_dir, GatewayConfig, Network};
use floe_kv::{KvStore, RedisKv};
use floe_sui::{HttpRegistry, Registry, SuiSigner};
use floe_walrus::{AggregatorPool, PublishCoordinator, PublisherClient, SegmentSource};
use tracing::info;

use crate::chunk_store::ChunkStore;
use crate::finalize::FinalizeEngine;
use crate::reaper::{reconcile_orphans, Reaper};
use crate::session::SessionService;

/// Everything a request handler can reach. Cheap to clone; all fields are
/// shared handles.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<GatewayConfig>,
    pub kv: Arc<dyn KvStore>,
    pub chunks: Arc<ChunkStore>,
    pub sessions: Arc<SessionService>,
    pub engine: Arc<FinalizeEngine>,
    pub segments: Arc<dyn SegmentSource>,
    pub registry: Arc<dyn Registry>,
}

/// Mount every route onto a router. Body limit covers the largest allowed
/// chunk plus multipart framing overhead.
pub fn build_router(state: GatewayState) -> Router {
    let body_limit = (state.config.upload.chunk_size_max + 1024 * 1024) as usize;
    Router::new()
        .route("/v1/uploads/create", post(routes::create_upload))
        .route(
            "/v1/uploads/:upload_id/chunk/:index",
            put(routes::upload_chunk),
        )
        .route("/v1/uploads/:upload_id/status", get(routes::upload_status))
        .route(
            "/v1/uploads/:upload_id/complete",
            post(routes::complete_upload),
        )
        .route("/v1/uploads/:upload_id", delete(routes::cancel_upload))
        .route("/v1/files/:file_id/metadata", get(routes::file_metadata))
        .route("/v1/files/:file_id/manifest", get(routes::file_manifest))
        .route("/v1/files/:file_id/stream", get(routes::stream_file))
        .route("/health", get(routes::health))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(axum::middleware::from_fn(routes::request_context))
        .with_state(state)
}

/// Assemble shared components over an already-connected KV store and the
/// given upstream clients. Split out of [`run_gateway`] so test harnesses
/// can wire mock upstreams.
pub fn build_state(
    config: Arc<GatewayConfig>,
    kv: Arc<dyn KvStore>,
    coordinator: Arc<PublishCoordinator>,
    registry: Arc<dyn Registry>,
    segments: Arc<dyn SegmentSource>,
) -> GatewayState {
    let chunks = Arc::new(ChunkStore::new(&config.upload.tmp_dir));
    let sessions = Arc::new(SessionService::new(kv.clone(), chunks.clone(), config.clone()));
    let engine = Arc::new(FinalizeEngine::new(
        kv.clone(),
        sessions.clone(),
        chunks.clone(),
        coordinator,
        registry.clone(),
        config.clone(),
    ));
    GatewayState {
        config,
        kv,
        chunks,
        sessions,
        engine,
        segments,
        registry,
    }
}

/// Startup order: validate config → probe staging dir → connect KV →
/// reconcile orphans → start reaper → mount routes → listen.
pub async fn run_gateway(config: GatewayConfig) -> Result<()> {
    validate_tmp_dir(&config.upload.tmp_dir)?;
    let config = Arc::new(config);

    let chunks_probe = ChunkStore::new(&config.upload.tmp_dir);
    chunks_probe
        .probe_writable()
        .await
        .context("upload tmp dir is not writable")?;

    let kv: Arc<dyn KvStore> = Arc::new(
        RedisKv::connect(&config.kv.url, &config.kv.key_prefix)
            .await
            .context("failed to connect to the KV store")?,
    );

    let signer = match &config.sui.secret {
        Some(secret) => Some(Arc::new(
            SuiSigner::from_secret(secret).context("failed to load signing key")?,
        )),
        None if config.network == Network::Mainnet => {
            anyhow::bail!("mainnet profile requires signing key material")
        }
        None => None,
    };

    let registry: Arc<dyn Registry> = Arc::new(HttpRegistry::new(
        config.sui.registry_url.clone(),
        signer.clone(),
    ));

    let publisher = Arc::new(PublisherClient::new(
        config.walrus.publisher_url.clone(),
        config.network,
        signer,
        registry.clone(),
        config.sui.min_balance,
        config.walrus.publish_timeout,
    ));
    let coordinator = Arc::new(PublishCoordinator::new(
        publisher,
        config.walrus.publish_concurrency,
        config.walrus.publish_interval_cap,
        config.walrus.publish_interval,
        config.walrus.publish_max_retries,
        config.walrus.publish_retry_base_delay,
    ));

    let segments: Arc<dyn SegmentSource> = Arc::new(AggregatorPool::new(
        config.walrus.aggregator_urls.clone(),
        config.walrus.publish_max_retries,
        config.walrus.publish_retry_base_delay,
    ));

    let state = build_state(config.clone(), kv.clone(), coordinator, registry, segments);

    let adopted = reconcile_orphans(&kv, &state.chunks, &config).await?;
    if adopted > 0 {
        info!(adopted, "reconciled orphaned uploads into the GC index");
    }

    let reaper = Arc::new(Reaper::new(kv, state.chunks.clone(), config.clone()));
    let _reaper_handle = reaper.spawn();

    let app = build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.listen_port));
    info!(%addr, network = config.network.as_str(), "gateway listening");
    axum::serve(
        tokio::net::TcpListener::bind(addr)
            .await
            .context("failed to bind HTTP listener")?,
        app,
    )
    .await
    .context("HTTP server failed")?;

    Ok(())
}
