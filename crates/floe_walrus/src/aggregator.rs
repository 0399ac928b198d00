//! Bounded sub-range reads from the aggregator fleet.
//!
//! One logical segment fetch walks the ordered endpoint list starting at the
//! last index that worked, giving each endpoint a small retry budget with
//! linear backoff before failing over to the next. Short reads are not an
//! error here: whatever bytes arrived before the upstream hung up are handed
//! to the caller, which re-requests the remainder.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

pub type FetchResult<T> = Result<T, FetchError>;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("blob content not found upstream")]
    NotFound,
    #[error("aggregators unavailable (last upstream status: {status:?})")]
    Unavailable { status: Option<u16> },
    #[error("unexpected upstream status {status}")]
    Upstream { status: u16 },
    #[error("read canceled")]
    Cancelled,
}

/// Result of one upstream segment request. `status` is one of 200, 206 or
/// 416; every other status has already been converted into an error. On 206
/// and 200, `bytes` may be shorter than requested when the upstream closed
/// early.
#[derive(Debug)]
pub struct SegmentFetch {
    pub status: u16,
    pub bytes: Bytes,
}

/// Seam between the range stitcher and the wire. Production implementation
/// is [`AggregatorPool`]; tests substitute an in-memory source.
#[async_trait]
pub trait SegmentSource: Send + Sync {
    async fn fetch_segment(
        &self,
        blob_id: &str,
        start: u64,
        end: u64,
        cancel: &CancellationToken,
    ) -> FetchResult<SegmentFetch>;
}

pub struct AggregatorPool {
    http: reqwest::Client,
    endpoints: Vec<Url>,
    last_good: AtomicUsize,
    retry_budget: u32,
    retry_base_delay: Duration,
}

impl AggregatorPool {
    pub fn new(endpoints: Vec<Url>, retry_budget: u32, retry_base_delay: Duration) -> Self {
        assert!(!endpoints.is_empty(), "aggregator pool needs at least one endpoint");
        let http = reqwest::Client::builder()
            .build()
            .expect("failed to build aggregator http client");
        Self {
            http,
            endpoints,
            last_good: AtomicUsize::new(0),
            retry_budget: retry_budget.max(1),
            retry_base_delay,
        }
    }

    /// Index of the endpoint that served the most recent successful fetch.
    pub fn last_good_index(&self) -> usize {
        self.last_good.load(Ordering::Relaxed)
    }

    fn blob_url(&self, idx: usize, blob_id: &str) -> FetchResult<Url> {
        self.endpoints[idx]
            .join(&format!("v1/blobs/{blob_id}"))
            .map_err(|_| FetchError::Unavailable { status: None })
    }

    /// One wire attempt. `Err((err, retryable))` tells the caller whether
    /// the same endpoint is worth another try.
    async fn attempt(
        &self,
        url: Url,
        start: u64,
        end: u64,
        cancel: &CancellationToken,
    ) -> Result<SegmentFetch, (FetchError, bool)> {
        let send = self
            .http
            .get(url)
            .header("range", format!("bytes={start}-{end}"))
            .send();

        let resp = tokio::select! {
            _ = cancel.cancelled() => return Err((FetchError::Cancelled, false)),
            resp = send => resp.map_err(|e| {
                warn!(error = %e, "aggregator request failed");
                (FetchError::Unavailable { status: None }, true)
            })?,
        };

        let status = resp.status().as_u16();
        match status {
            206 | 200 => {}
            416 => {
                return Ok(SegmentFetch {
                    status,
                    bytes: Bytes::new(),
                })
            }
            404 => return Err((FetchError::NotFound, false)),
            429 | 500..=599 => return Err((FetchError::Unavailable { status: Some(status) }, true)),
            other => return Err((FetchError::Upstream { status: other }, false)),
        }

        let mut collected = BytesMut::new();
        let mut stream = resp.bytes_stream();
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err((FetchError::Cancelled, false)),
                next = stream.next() => next,
            };
            match next {
                Some(Ok(chunk)) => collected.extend_from_slice(&chunk),
                Some(Err(e)) if !collected.is_empty() => {
                    // Upstream hung up mid-body. Surface the prefix as a
                    // short read; the stitcher retries the remainder.
                    debug!(error = %e, read = collected.len(), "short read from aggregator");
                    break;
                }
                Some(Err(e)) => {
                    warn!(error = %e, "aggregator body failed before any bytes");
                    return Err((FetchError::Unavailable { status: None }, true));
                }
                None => break,
            }
        }

        Ok(SegmentFetch {
            status,
            bytes: collected.freeze(),
        })
    }
}

#[async_trait]
impl SegmentSource for AggregatorPool {
    async fn fetch_segment(
        &self,
        blob_id: &str,
        start: u64,
        end: u64,
        cancel: &CancellationToken,
    ) -> FetchResult<SegmentFetch> {
        let count = self.endpoints.len();
        let first = self.last_good.load(Ordering::Relaxed) % count;
        let mut last_err = FetchError::Unavailable { status: None };

        for hop in 0..count {
            let idx = (first + hop) % count;
            let url = self.blob_url(idx, blob_id)?;

            for attempt in 1..=self.retry_budget {
                if cancel.is_cancelled() {
                    return Err(FetchError::Cancelled);
                }
                match self.attempt(url.clone(), start, end, cancel).await {
                    Ok(fetch) => {
                        self.last_good.store(idx, Ordering::Relaxed);
                        return Ok(fetch);
                    }
                    Err((err, retryable)) => {
                        if !retryable {
                            return Err(err);
                        }
                        last_err = err;
                        if attempt < self.retry_budget {
                            let backoff = self.retry_base_delay * attempt;
                            tokio::select! {
                                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                                _ = tokio::time::sleep(backoff) => {}
                            }
                        }
                    }
                }
            }
            debug!(aggregator = idx, blob_id, "aggregator exhausted, failing over");
        }

        Err(last_err)
    }
}
