//! Single-shot publish to the Walrus publisher endpoint.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use floe_base::config::Network;
use floe_sui::{Registry, SuiSigner};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

/// Minimum wall time between two balance prechecks.
const BALANCE_CHECK_INTERVAL: Duration = Duration::from_secs(60);

pub type PublishResult<T> = Result<T, PublishError>;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("epochs must be greater than zero")]
    InvalidEpochs,
    #[error("PUBLISH_FAILED:{status}:{body}")]
    Failed { status: u16, body: String },
    #[error("publisher reply carries no blob id")]
    MissingBlobId,
    #[error("publish deadline exceeded")]
    Timeout,
    #[error("publish aborted")]
    Aborted,
    #[error("network error: {0}")]
    Network(String),
    #[error("account balance {balance} below required minimum {required}")]
    InsufficientBalance { balance: u64, required: u64 },
    #[error("balance precheck failed: {0}")]
    BalanceCheck(String),
    #[error("io error reading assembled file: {0}")]
    Io(#[from] std::io::Error),
}

/// One publish job: stream the assembled file at `file_path` for `epochs`.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub upload_id: Uuid,
    pub file_path: PathBuf,
    pub size_bytes: u64,
    pub epochs: u32,
}

/// Seam between the coordinator and the wire. The production implementation
/// is [`PublisherClient`]; tests substitute their own.
#[async_trait]
pub trait BlobPublisher: Send + Sync {
    async fn publish(&self, req: &PublishRequest, cancel: &CancellationToken)
        -> PublishResult<String>;
}

pub struct PublisherClient {
    http: reqwest::Client,
    base_url: Url,
    network: Network,
    signer: Option<Arc<SuiSigner>>,
    registry: Arc<dyn Registry>,
    min_balance: u64,
    timeout: Duration,
    last_balance_check: Mutex<Option<Instant>>,
}

impl PublisherClient {
    pub fn new(
        base_url: Url,
        network: Network,
        signer: Option<Arc<SuiSigner>>,
        registry: Arc<dyn Registry>,
        min_balance: u64,
        timeout: Duration,
    ) -> Self {
        let http = reqwest::Client::builder()
            .build()
            .expect("failed to build publisher http client");
        Self {
            http,
            base_url,
            network,
            signer,
            registry,
            min_balance,
            timeout,
            last_balance_check: Mutex::new(None),
        }
    }

    /// On mainnet, refuse to spend when the funding account is too low.
    /// The answer is memoized for a minute so a hot publish queue does not
    /// hammer the registry.
    async fn precheck_balance(&self) -> PublishResult<()> {
        let Some(signer) = &self.signer else {
            return Ok(());
        };
        let mut last = self.last_balance_check.lock().await;
        if let Some(at) = *last {
            if at.elapsed() < BALANCE_CHECK_INTERVAL {
                return Ok(());
            }
        }
        let balance = self
            .registry
            .check_balance(&signer.address())
            .await
            .map_err(|e| PublishError::BalanceCheck(e.to_string()))?;
        if balance < self.min_balance {
            return Err(PublishError::InsufficientBalance {
                balance,
                required: self.min_balance,
            });
        }
        *last = Some(Instant::now());
        Ok(())
    }

    fn signed(&self, req: reqwest::RequestBuilder, publish: &PublishRequest) -> reqwest::RequestBuilder {
        match &self.signer {
            Some(signer) => {
                let ts = Utc::now().timestamp_millis().to_string();
                let message = format!(
                    "{ts}:{}:{}:{}",
                    publish.upload_id, publish.size_bytes, publish.epochs
                );
                req.header("x-floe-timestamp", &ts)
                    .header("x-floe-public-key", signer.public_key_base64())
                    .header("x-floe-signature", signer.sign_base64(message.as_bytes()))
            }
            None => req,
        }
    }
}

/// The publisher reports the blob id in different places depending on
/// whether the blob is new or was already certified.
pub(crate) fn extract_blob_id(reply: &Value) -> Option<String> {
    let candidates = [
        reply
            .get("newlyCreated")
            .and_then(|v| v.get("blobObject"))
            .and_then(|v| v.get("blobId")),
        reply.get("alreadyCertified").and_then(|v| v.get("blobId")),
        reply.get("blobObject").and_then(|v| v.get("blobId")),
    ];
    candidates
        .into_iter()
        .flatten()
        .find_map(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl BlobPublisher for PublisherClient {
    async fn publish(
        &self,
        req: &PublishRequest,
        cancel: &CancellationToken,
    ) -> PublishResult<String> {
        if req.epochs == 0 {
            return Err(PublishError::InvalidEpochs);
        }

        if self.network == Network::Mainnet {
            self.precheck_balance().await?;
        }

        let mut url = self
            .base_url
            .join("v1/blobs")
            .map_err(|e| PublishError::Network(format!("bad publisher url: {e}")))?;
        url.query_pairs_mut()
            .append_pair("epochs", &req.epochs.to_string());

        // Fresh read stream per attempt; a retried job must never resume a
        // half-consumed body.
        let file = tokio::fs::File::open(&req.file_path).await?;
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));

        let request = self
            .signed(self.http.put(url), req)
            .header("content-length", req.size_bytes)
            .body(body);

        debug!(upload_id = %req.upload_id, size_bytes = req.size_bytes, epochs = req.epochs, "publishing blob");

        let send = async {
            let resp = request
                .send()
                .await
                .map_err(|e| PublishError::Network(format!("{e:#}")))?;
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(PublishError::Failed {
                    status: status.as_u16(),
                    body,
                });
            }
            resp.json::<Value>()
                .await
                .map_err(|e| PublishError::Network(format!("reading publisher reply: {e:#}")))
        };

        let reply = tokio::select! {
            _ = cancel.cancelled() => return Err(PublishError::Aborted),
            result = tokio::time::timeout(self.timeout, send) => match result {
                Ok(inner) => inner?,
                Err(_) => return Err(PublishError::Timeout),
            },
        };

        let blob_id = extract_blob_id(&reply).ok_or(PublishError::MissingBlobId)?;
        info!(upload_id = %req.upload_id, blob_id, "blob published");
        Ok(blob_id)
    }
}
