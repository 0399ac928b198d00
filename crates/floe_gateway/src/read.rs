//! Range-compliant read path.
//!
//! A requested span is served by stitching bounded sub-range fetches from
//! the aggregator pool. Segment size starts at the configured ceiling and
//! halves down to a floor whenever the upstream answers 416 or returns
//! fewer bytes than asked; short reads advance the offset by what actually
//! arrived and re-request the remainder. Bytes reach the client strictly in
//! ascending offset order. The first segment is fetched before response
//! headers are committed so upstream failures still map to real statuses.

use std::sync::Arc;

use axum::body::Body;
use axum::http::StatusCode;
use bytes::Bytes;
use floe_base::error::ErrorCode;
use floe_base::keys;
use floe_base::model::AssetFields;
use floe_kv::KvStore;
use floe_sui::{Registry, RegistryError};
use floe_walrus::{FetchError, SegmentFetch, SegmentSource};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::GatewayState;

/// Smallest segment the stitcher will degrade to.
pub const SEGMENT_FLOOR_BYTES: u64 = 256 * 1024;

const BODY_CHANNEL_DEPTH: usize = 8;

/// One parsed `Range` header value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedRange {
    /// `bytes=A-B`
    FromTo(u64, u64),
    /// `bytes=A-`
    From(u64),
    /// `bytes=-N`
    Suffix(u64),
}

/// Parse a `Range` header. Exactly one range in `bytes` units is accepted;
/// anything else is `None`, which the caller answers with 416.
pub fn parse_range_header(raw: &str) -> Option<ParsedRange> {
    let spec = raw.strip_prefix("bytes=")?.trim();
    if spec.contains(',') {
        return None;
    }
    let (first, second) = spec.split_once('-')?;
    match (first.is_empty(), second.is_empty()) {
        (true, true) => None,
        (true, false) => {
            let n: u64 = second.parse().ok()?;
            (n > 0).then_some(ParsedRange::Suffix(n))
        }
        (false, true) => first.parse().ok().map(ParsedRange::From),
        (false, false) => {
            let a: u64 = first.parse().ok()?;
            let b: u64 = second.parse().ok()?;
            (a <= b).then_some(ParsedRange::FromTo(a, b))
        }
    }
}

/// Clamp a parsed range against the object size. `None` means the range
/// cannot be satisfied (416).
pub fn resolve_range(range: ParsedRange, size: u64) -> Option<(u64, u64)> {
    if size == 0 {
        return None;
    }
    match range {
        ParsedRange::FromTo(start, end) => {
            (start < size).then(|| (start, end.min(size - 1)))
        }
        ParsedRange::From(start) => (start < size).then(|| (start, size - 1)),
        ParsedRange::Suffix(n) => {
            let start = size.saturating_sub(n);
            Some((start, size - 1))
        }
    }
}

/// Resolve `file_id` into normalized asset fields: cache hit if the cached
/// JSON still parses, otherwise registry fetch + cache refill.
pub async fn get_file_fields(state: &GatewayState, file_id: &str) -> Result<AssetFields, ApiError> {
    let cache_key = keys::file_fields_key(file_id);
    if let Some(cached) = state.kv.get(&cache_key).await? {
        match serde_json::from_str::<AssetFields>(&cached) {
            Ok(fields) => return Ok(fields),
            Err(e) => debug!(file_id, error = %e, "stale fields cache entry, refetching"),
        }
    }

    let fields = state
        .registry
        .get_asset_fields(file_id)
        .await
        .map_err(|e| registry_error(file_id, e))?;

    match serde_json::to_string(&fields) {
        Ok(json) => {
            if let Err(e) = state
                .kv
                .set_ex(&cache_key, &json, state.config.stream.fields_cache_ttl)
                .await
            {
                warn!(file_id, error = %e, "failed to write fields cache");
            }
        }
        Err(e) => warn!(file_id, error = %e, "failed to encode fields cache"),
    }

    Ok(fields)
}

fn registry_error(file_id: &str, e: RegistryError) -> ApiError {
    match e {
        RegistryError::NotFound => {
            ApiError::not_found(ErrorCode::FileNotFound, format!("file {file_id} not found"))
        }
        RegistryError::Unavailable(msg) => {
            warn!(file_id, error = %msg, "registry unavailable");
            ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorCode::SuiUnavailable,
                "registry is unavailable",
                true,
            )
        }
        RegistryError::InvalidObject(msg) => {
            warn!(file_id, error = %msg, "unnormalizable object data");
            ApiError::new(
                StatusCode::BAD_GATEWAY,
                ErrorCode::InvalidFileMetadata,
                "on-chain object data is invalid",
                false,
            )
        }
        RegistryError::Rejected { status, .. } => {
            warn!(file_id, status, "registry rejected read");
            ApiError::new(
                StatusCode::BAD_GATEWAY,
                ErrorCode::InvalidFileMetadata,
                "registry rejected the object read",
                false,
            )
        }
    }
}

#[derive(Debug, Error)]
enum StitchError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("aggregator does not honor range requests")]
    RangeUnsupported,
    #[error("aggregator returned an empty body")]
    EmptyRead,
    #[error("aggregator returned more bytes than requested")]
    OverRead,
    #[error("read canceled")]
    Canceled,
}

fn stitch_error(e: StitchError) -> ApiError {
    match e {
        StitchError::Fetch(FetchError::NotFound) => ApiError::not_found(
            ErrorCode::FileNotFound,
            "blob content not found on any aggregator",
        ),
        StitchError::Fetch(FetchError::Unavailable { .. }) => ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::WalrusReadFailed,
            "aggregators are unavailable",
            true,
        ),
        StitchError::Fetch(FetchError::Upstream { status }) => ApiError::new(
            StatusCode::BAD_GATEWAY,
            ErrorCode::WalrusReadFailed,
            format!("unexpected aggregator status {status}"),
            true,
        ),
        StitchError::Fetch(FetchError::Cancelled) | StitchError::Canceled => ApiError::new(
            StatusCode::BAD_GATEWAY,
            ErrorCode::WalrusReadFailed,
            "read canceled",
            true,
        ),
        StitchError::RangeUnsupported => ApiError::new(
            StatusCode::BAD_GATEWAY,
            ErrorCode::WalrusRangeUnsupported,
            "aggregator does not support the requested range",
            false,
        ),
        StitchError::EmptyRead | StitchError::OverRead => ApiError::new(
            StatusCode::BAD_GATEWAY,
            ErrorCode::WalrusReadFailed,
            "aggregator returned an invalid body",
            true,
        ),
    }
}

struct Stitcher {
    source: Arc<dyn SegmentSource>,
    blob_id: String,
    object_size: u64,
    end: u64,
    off: u64,
    seg_size: u64,
    floor: u64,
}

impl Stitcher {
    fn new(
        source: Arc<dyn SegmentSource>,
        blob_id: String,
        object_size: u64,
        start: u64,
        end: u64,
        max_range: u64,
    ) -> Self {
        let span = end - start + 1;
        let floor = SEGMENT_FLOOR_BYTES.min(max_range.max(1));
        Self {
            source,
            blob_id,
            object_size,
            end,
            off: start,
            seg_size: max_range.max(1).min(span),
            floor,
        }
    }

    fn done(&self) -> bool {
        self.off > self.end
    }

    fn halve(&mut self) {
        self.seg_size = (self.seg_size / 2).max(self.floor);
    }

    /// Fetch the next piece of the span. Handles 416 degradation and short
    /// reads; always returns bytes in ascending offset order.
    async fn next_piece(&mut self, cancel: &CancellationToken) -> Result<Bytes, StitchError> {
        loop {
            if cancel.is_cancelled() {
                return Err(StitchError::Canceled);
            }
            let seg_end = self.end.min(self.off + self.seg_size - 1);
            let expected = seg_end - self.off + 1;

            let SegmentFetch { status, bytes } = self
                .source
                .fetch_segment(&self.blob_id, self.off, seg_end, cancel)
                .await?;

            match status {
                206 => {}
                // A plain 200 is only acceptable when this single segment
                // covers the entire object.
                200 if self.off == 0 && seg_end + 1 == self.object_size => {}
                200 => return Err(StitchError::RangeUnsupported),
                416 => {
                    if self.seg_size > self.floor {
                        self.halve();
                        continue;
                    }
                    return Err(StitchError::RangeUnsupported);
                }
                _ => return Err(StitchError::RangeUnsupported),
            }

            if bytes.is_empty() {
                return Err(StitchError::EmptyRead);
            }
            if bytes.len() as u64 > expected {
                return Err(StitchError::OverRead);
            }
            if (bytes.len() as u64) < expected {
                // Upstream hung up early; take what arrived and retry the
                // remainder with a smaller segment.
                self.halve();
            }
            self.off += bytes.len() as u64;
            return Ok(bytes);
        }
    }
}

/// Open the response body for `[start, end]` of `fields`. The first segment
/// is fetched eagerly; failures there surface as proper error responses.
/// The remainder streams through a channel, and a client disconnect (the
/// receiver dropping) cancels all upstream work.
pub async fn open_stream(
    state: &GatewayState,
    fields: &AssetFields,
    start: u64,
    end: u64,
) -> Result<Body, ApiError> {
    let cancel = CancellationToken::new();

    // Hard deadline for the whole ranged read.
    {
        let cancel = cancel.clone();
        let deadline = state.config.stream.read_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            cancel.cancel();
        });
    }

    let mut stitcher = Stitcher::new(
        state.segments.clone(),
        fields.blob_id.clone(),
        fields.size_bytes,
        start,
        end,
        state.config.stream.max_range_bytes,
    );

    let first = stitcher.next_piece(&cancel).await.map_err(stitch_error)?;

    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(BODY_CHANNEL_DEPTH);
    tokio::spawn(async move {
        if tx.send(Ok(first)).await.is_err() {
            cancel.cancel();
            return;
        }
        while !stitcher.done() {
            match stitcher.next_piece(&cancel).await {
                Ok(piece) => {
                    if tx.send(Ok(piece)).await.is_err() {
                        // Client went away; stop fetching upstream.
                        cancel.cancel();
                        return;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "range stitch aborted mid-stream");
                    let _ = tx
                        .send(Err(std::io::Error::new(std::io::ErrorKind::Other, e)))
                        .await;
                    cancel.cancel();
                    return;
                }
            }
        }
    });

    Ok(Body::from_stream(ReceiverStream::new(rx)))
}
