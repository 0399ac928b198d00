//! HTTP handlers for the upload and read surfaces.

use std::collections::HashMap;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{Duration as ChronoDuration, Utc};
use floe_base::config as cfg;
use floe_base::error::ErrorCode;
use floe_base::model::{UploadSession, UploadStatus};
use floe_kv::KvStore;
use floe_sui::RegistryError;
use floe_walrus::coordinator;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};
use uuid::Uuid;

use crate::chunk_store::ChunkStoreError;
use crate::error::ApiError;
use crate::finalize::FinalizeError;
use crate::read;
use crate::session::{now_millis, SessionError};
use crate::GatewayState;

/// Request-scoped logging: every request gets an id and a completion line
/// with method, path, status and duration.
pub async fn request_context(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    let request_id = Uuid::new_v4();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = std::time::Instant::now();

    let response = next.run(req).await;

    info!(
        %request_id,
        %method,
        path,
        status = response.status().as_u16(),
        duration_ms = started.elapsed().as_millis() as u64,
        "request finished"
    );
    response
}

fn parse_upload_id(raw: &str) -> Result<Uuid, ApiError> {
    let id: Uuid = raw
        .parse()
        .map_err(|_| ApiError::bad_request(ErrorCode::InvalidUploadId, "uploadId must be a UUID"))?;
    if id.get_version_num() != 4 {
        return Err(ApiError::bad_request(
            ErrorCode::InvalidUploadId,
            "uploadId must be a v4 UUID",
        ));
    }
    Ok(id)
}

fn session_error(e: SessionError) -> ApiError {
    match e {
        SessionError::Corrupt(inner) => {
            error!(error = %inner, "corrupt upload session record");
            ApiError::internal("upload session record is corrupt")
        }
        SessionError::Kv(inner) => inner.into(),
        SessionError::Io(inner) => {
            error!(error = %inner, "session staging io failure");
            ApiError::internal("failed to prepare upload staging directory")
        }
    }
}

fn chunk_error(e: ChunkStoreError) -> ApiError {
    match e {
        ChunkStoreError::HashMismatch { .. }
        | ChunkStoreError::TooLarge { .. }
        | ChunkStoreError::SizeMismatch { .. }
        | ChunkStoreError::InvalidLastChunkSize { .. } => {
            ApiError::bad_request(ErrorCode::InvalidChunk, e.to_string())
        }
        ChunkStoreError::InProgress => ApiError::conflict(
            ErrorCode::ChunkInProgress,
            "another writer is persisting this chunk",
            true,
        ),
        ChunkStoreError::Stream(msg) => ApiError::new(
            StatusCode::BAD_REQUEST,
            ErrorCode::ChunkStreamError,
            msg,
            true,
        ),
        ChunkStoreError::Io(inner) => {
            error!(error = %inner, "chunk store io failure");
            ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorCode::ChunkUploadFailed,
                "failed to persist chunk",
                true,
            )
        }
    }
}

fn finalize_error(e: FinalizeError) -> ApiError {
    match e {
        FinalizeError::InProgress | FinalizeError::LockLost => ApiError::conflict(
            ErrorCode::UploadFinalizationInProgress,
            "finalization is already in progress",
            true,
        ),
        FinalizeError::Incomplete { expected, actual } => {
            ApiError::bad_request(ErrorCode::UploadIncomplete, "not all chunks were uploaded")
                .with_details(json!({ "expected": expected, "received": actual }))
        }
        FinalizeError::MissingChunk { index } => {
            ApiError::bad_request(ErrorCode::UploadIncomplete, "chunk data missing on disk")
                .with_details(json!({ "missingIndex": index }))
        }
        FinalizeError::CorruptCompleted => {
            ApiError::internal("completed upload is missing its commit record")
        }
        FinalizeError::Publish(inner) => {
            let retryable = coordinator::classify(&inner).is_retryable();
            ApiError::new(
                StatusCode::BAD_GATEWAY,
                ErrorCode::UploadFailed,
                "failed to publish blob to the object store",
                retryable,
            )
        }
        FinalizeError::Registry(RegistryError::Unavailable(_)) => ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::SuiUnavailable,
            "registry is unavailable",
            true,
        ),
        FinalizeError::Registry(_) => ApiError::new(
            StatusCode::BAD_GATEWAY,
            ErrorCode::UploadFailed,
            "failed to mint asset record",
            false,
        ),
        FinalizeError::Session(inner) => session_error(inner),
        FinalizeError::Kv(_) | FinalizeError::Chunks(_) | FinalizeError::Io(_) => {
            ApiError::internal("finalization failed")
        }
    }
}

fn include_blob_id(state: &GatewayState, params: &HashMap<String, String>) -> bool {
    if state.config.stream.expose_blob_id {
        return true;
    }
    params
        .get("includeBlobId")
        .is_some_and(|v| v == "1" || v == "true")
}

/// The metadata "container" is the mime subtype, e.g. `video/mp4` -> `mp4`.
fn container_from_mime(mime: &str) -> String {
    mime.split('/')
        .nth(1)
        .filter(|s| !s.is_empty())
        .unwrap_or("bin")
        .to_string()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUploadBody {
    filename: Option<String>,
    content_type: Option<String>,
    size_bytes: Option<i64>,
    chunk_size: Option<i64>,
    epochs: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUploadResponse {
    upload_id: Uuid,
    chunk_size: u64,
    total_chunks: u64,
    epochs: u32,
    expires_at: String,
}

pub async fn create_upload(
    State(state): State<GatewayState>,
    body: Result<Json<CreateUploadBody>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(body) = body.map_err(|e| {
        ApiError::bad_request(ErrorCode::InvalidRequestBody, format!("invalid JSON body: {e}"))
    })?;

    let filename = body.filename.as_deref().unwrap_or("").trim();
    if filename.is_empty() {
        return Err(ApiError::bad_request(
            ErrorCode::InvalidCreateUploadRequest,
            "filename is required",
        ));
    }
    if filename.len() > cfg::MAX_FILENAME_LEN {
        return Err(ApiError::bad_request(
            ErrorCode::InvalidFilename,
            format!("filename exceeds {} characters", cfg::MAX_FILENAME_LEN),
        ));
    }

    let content_type = body.content_type.as_deref().unwrap_or("").trim();
    if content_type.is_empty() {
        return Err(ApiError::bad_request(
            ErrorCode::InvalidCreateUploadRequest,
            "contentType is required",
        ));
    }
    if content_type.len() > cfg::MAX_CONTENT_TYPE_LEN {
        return Err(ApiError::bad_request(
            ErrorCode::InvalidContentType,
            format!("contentType exceeds {} characters", cfg::MAX_CONTENT_TYPE_LEN),
        ));
    }

    let upload_cfg = &state.config.upload;
    let size_bytes = match body.size_bytes {
        Some(n) if n > 0 => n as u64,
        Some(_) => {
            return Err(ApiError::bad_request(
                ErrorCode::InvalidFileSize,
                "sizeBytes must be positive",
            ))
        }
        None => {
            return Err(ApiError::bad_request(
                ErrorCode::InvalidCreateUploadRequest,
                "sizeBytes is required",
            ))
        }
    };
    if size_bytes > upload_cfg.max_file_size {
        return Err(ApiError::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            ErrorCode::FileTooLarge,
            format!("sizeBytes exceeds the {} byte limit", upload_cfg.max_file_size),
            false,
        ));
    }

    let chunk_size = match body.chunk_size {
        Some(n) if n > 0 => {
            (n as u64).clamp(upload_cfg.chunk_size_min, upload_cfg.chunk_size_max)
        }
        Some(_) => {
            return Err(ApiError::bad_request(
                ErrorCode::InvalidChunkSize,
                "chunkSize must be positive",
            ))
        }
        None => upload_cfg.chunk_size_default,
    };

    let epochs = match body.epochs {
        Some(n) if n > 0 => (n as u32).clamp(1, upload_cfg.epochs_max),
        Some(_) => {
            return Err(ApiError::bad_request(
                ErrorCode::InvalidEpochs,
                "epochs must be positive",
            ))
        }
        None => upload_cfg.epochs_default,
    };

    let total_chunks = size_bytes.div_ceil(chunk_size);
    if total_chunks == 0 {
        return Err(ApiError::bad_request(
            ErrorCode::InvalidTotalChunks,
            "upload would produce no chunks",
        ));
    }
    if total_chunks > upload_cfg.max_total_chunks {
        return Err(ApiError::bad_request(
            ErrorCode::TooManyChunks,
            format!("upload would need {total_chunks} chunks, limit is {}", upload_cfg.max_total_chunks),
        ));
    }

    let active = state.sessions.active_count().await.map_err(session_error)?;
    if active >= upload_cfg.max_active_uploads {
        return Err(ApiError::new(
            StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::UploadCapacityReached,
            "too many active uploads, retry later",
            true,
        ));
    }

    let created_at = Utc::now();
    let session = UploadSession {
        upload_id: Uuid::new_v4(),
        filename: filename.to_string(),
        content_type: content_type.to_string(),
        size_bytes,
        chunk_size,
        total_chunks,
        epochs,
        status: UploadStatus::Uploading,
        created_at,
        expires_at: created_at
            + ChronoDuration::milliseconds(upload_cfg.session_ttl.as_millis() as i64),
    };

    state.sessions.create(&session).await.map_err(|e| {
        error!(error = %e, "failed to create upload session");
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::SessionCreateFailed,
            "failed to create upload session",
            true,
        )
    })?;

    info!(upload_id = %session.upload_id, size_bytes, total_chunks, "upload session created");
    Ok((
        StatusCode::CREATED,
        Json(CreateUploadResponse {
            upload_id: session.upload_id,
            chunk_size,
            total_chunks,
            epochs,
            expires_at: session.expires_at.to_rfc3339(),
        }),
    ))
}

fn expected_hash(headers: &HeaderMap) -> Result<String, ApiError> {
    let raw = headers
        .get("x-chunk-sha256")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            ApiError::bad_request(ErrorCode::InvalidChunk, "x-chunk-sha256 header is required")
        })?;
    let ok = raw.len() == 64
        && raw
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if !ok {
        return Err(ApiError::bad_request(
            ErrorCode::InvalidChunk,
            "x-chunk-sha256 must be 64 lowercase hex characters",
        ));
    }
    Ok(raw.to_string())
}

pub async fn upload_chunk(
    State(state): State<GatewayState>,
    Path((upload_id, index)): Path<(String, String)>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let upload_id = parse_upload_id(&upload_id)?;
    let index: u64 = index
        .parse()
        .map_err(|_| ApiError::bad_request(ErrorCode::InvalidChunk, "chunk index must be an integer"))?;
    let hash = expected_hash(&headers)?;

    let session = match state.sessions.get(&upload_id).await.map_err(session_error)? {
        Some(session) => session,
        None => {
            let meta = state
                .sessions
                .get_meta(&upload_id)
                .await
                .map_err(session_error)?;
            if meta.status == Some(UploadStatus::Completed) {
                return Err(ApiError::conflict(
                    ErrorCode::UploadAlreadyCompleted,
                    "upload is already completed",
                    false,
                ));
            }
            return Err(ApiError::not_found(
                ErrorCode::UploadNotFound,
                "upload session not found",
            ));
        }
    };

    if index >= session.total_chunks {
        return Err(ApiError::bad_request(
            ErrorCode::InvalidChunk,
            format!("chunk index {index} out of range [0, {})", session.total_chunks),
        ));
    }

    let field = loop {
        match multipart.next_field().await {
            Ok(Some(field)) if field.name() == Some("file") => break field,
            Ok(Some(_)) => continue,
            Ok(None) => {
                return Err(ApiError::bad_request(
                    ErrorCode::InvalidRequestBody,
                    "multipart body must carry a single `file` part",
                ))
            }
            Err(e) => {
                return Err(ApiError::new(
                    StatusCode::BAD_REQUEST,
                    ErrorCode::ChunkStreamError,
                    format!("failed to read multipart body: {e}"),
                    true,
                ))
            }
        }
    };

    let expected_size = session.expected_chunk_size(index);
    state
        .chunks
        .write_chunk(
            &upload_id,
            index,
            Box::pin(field),
            &hash,
            expected_size,
            session.is_last_chunk(index),
        )
        .await
        .map_err(chunk_error)?;

    state
        .sessions
        .add_received(&upload_id, index)
        .await
        .map_err(session_error)?;

    Ok(Json(json!({ "ok": true, "chunkIndex": index })))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    upload_id: Uuid,
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    chunk_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    total_chunks: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    received_chunks: Option<Vec<u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    file_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    blob_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub async fn upload_status(
    State(state): State<GatewayState>,
    Path(upload_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiError> {
    let upload_id = parse_upload_id(&upload_id)?;
    let expose_blob = include_blob_id(&state, &params);

    let meta = state
        .sessions
        .get_meta(&upload_id)
        .await
        .map_err(session_error)?;

    if let Some(session) = state.sessions.get(&upload_id).await.map_err(session_error)? {
        let received = state
            .sessions
            .received_indices(&upload_id)
            .await
            .map_err(session_error)?;
        return Ok(Json(StatusResponse {
            upload_id,
            status: meta
                .status
                .unwrap_or(session.status)
                .as_str()
                .to_string(),
            chunk_size: Some(session.chunk_size),
            total_chunks: Some(session.total_chunks),
            received_chunks: Some(received),
            expires_at: Some(session.expires_at.to_rfc3339()),
            file_id: meta.file_id,
            blob_id: meta.blob_id.filter(|_| expose_blob),
            error: meta.error,
        }));
    }

    // Session expired or committed: answer from the durable meta record.
    if meta.is_empty() {
        return Err(ApiError::not_found(
            ErrorCode::UploadNotFound,
            "upload not found",
        ));
    }
    Ok(Json(StatusResponse {
        upload_id,
        status: meta
            .status
            .map(|s| s.as_str().to_string())
            .unwrap_or_else(|| "unknown".to_string()),
        chunk_size: None,
        total_chunks: None,
        received_chunks: None,
        expires_at: None,
        file_id: meta.file_id,
        blob_id: meta.blob_id.filter(|_| expose_blob),
        error: meta.error,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteResponse {
    file_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    blob_id: Option<String>,
    size_bytes: u64,
    status: &'static str,
}

pub async fn complete_upload(
    State(state): State<GatewayState>,
    Path(upload_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiError> {
    let upload_id = parse_upload_id(&upload_id)?;
    let expose_blob = include_blob_id(&state, &params);

    let respond = |outcome: crate::finalize::FinalizeOutcome| {
        Json(CompleteResponse {
            file_id: outcome.file_id,
            blob_id: expose_blob.then_some(outcome.blob_id),
            size_bytes: outcome.size_bytes,
            status: "ready",
        })
    };

    let session = match state.sessions.get(&upload_id).await.map_err(session_error)? {
        Some(session) => session,
        None => {
            // Post-commit replay: the session key is gone but meta holds
            // the committed triple.
            let outcome = state
                .engine
                .completed_outcome(&upload_id)
                .await
                .map_err(finalize_error)?;
            return match outcome {
                Some(outcome) => Ok(respond(outcome)),
                None => Err(ApiError::not_found(
                    ErrorCode::UploadNotFound,
                    "upload not found",
                )),
            };
        }
    };

    let received = state
        .sessions
        .received_count(&upload_id)
        .await
        .map_err(session_error)?;
    if received != session.total_chunks {
        return Err(ApiError::bad_request(
            ErrorCode::UploadIncomplete,
            "not all chunks were uploaded",
        )
        .with_details(json!({
            "expected": session.total_chunks,
            "received": received
        })));
    }

    let outcome = state
        .engine
        .complete(&session)
        .await
        .map_err(finalize_error)?;
    Ok(respond(outcome))
}

pub async fn cancel_upload(
    State(state): State<GatewayState>,
    Path(upload_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let upload_id = parse_upload_id(&upload_id)?;

    if state.sessions.lock_held(&upload_id).await.map_err(session_error)? {
        return Err(ApiError::conflict(
            ErrorCode::UploadFinalizationInProgress,
            "cannot cancel while finalization is in progress",
            true,
        ));
    }
    let meta = state
        .sessions
        .get_meta(&upload_id)
        .await
        .map_err(session_error)?;
    if meta.status == Some(UploadStatus::Completed) {
        return Err(ApiError::conflict(
            ErrorCode::UploadAlreadyCompleted,
            "upload is already completed",
            false,
        ));
    }

    state
        .kv
        .atomic(vec![
            floe_kv::KvOp::HSet {
                key: floe_base::keys::meta_key(&upload_id),
                fields: vec![
                    ("status".into(), UploadStatus::Canceled.as_str().into()),
                    ("canceled_at".into(), now_millis().to_string()),
                ],
                ttl: None,
            },
            floe_kv::KvOp::Del {
                key: floe_base::keys::session_key(&upload_id),
            },
            floe_kv::KvOp::Del {
                key: floe_base::keys::chunks_key(&upload_id),
            },
            floe_kv::KvOp::SRem {
                key: floe_base::keys::gc_active_key().to_string(),
                member: upload_id.to_string(),
            },
        ])
        .await?;

    state.chunks.cleanup(&upload_id).await;
    info!(%upload_id, "upload canceled");
    Ok(Json(json!({
        "ok": true,
        "uploadId": upload_id,
        "status": "canceled"
    })))
}

fn metadata_body(
    file_id: &str,
    fields: &floe_base::model::AssetFields,
    expose_blob: bool,
) -> serde_json::Value {
    let mut body = json!({
        "fileId": file_id,
        "manifestVersion": 1,
        "container": container_from_mime(&fields.mime),
        "sizeBytes": fields.size_bytes,
        "mimeType": fields.mime,
        "owner": fields.owner,
        "createdAt": fields.created_at,
    });
    if expose_blob {
        body["blobId"] = json!(fields.blob_id);
    }
    body
}

pub async fn file_metadata(
    State(state): State<GatewayState>,
    Path(file_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiError> {
    let fields = read::get_file_fields(&state, &file_id).await?;
    let expose_blob = include_blob_id(&state, &params);
    Ok(Json(metadata_body(&file_id, &fields, expose_blob)))
}

pub async fn file_manifest(
    State(state): State<GatewayState>,
    Path(file_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiError> {
    let fields = read::get_file_fields(&state, &file_id).await?;
    let expose_blob = include_blob_id(&state, &params);

    let mut body = metadata_body(&file_id, &fields, expose_blob);
    let mut segment = json!({
        "index": 0,
        "offsetBytes": 0,
        "sizeBytes": fields.size_bytes,
    });
    if expose_blob {
        segment["blobId"] = json!(fields.blob_id);
    }
    body["layout"] = json!({
        "type": "walrus_single_blob",
        "segments": [segment],
    });
    Ok(Json(body))
}

pub async fn stream_file(
    State(state): State<GatewayState>,
    method: Method,
    Path(file_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let fields = read::get_file_fields(&state, &file_id).await?;
    let size = fields.size_bytes;

    let range = match headers.get("range").and_then(|v| v.to_str().ok()) {
        Some(raw) => {
            let parsed = read::parse_range_header(raw).ok_or_else(|| {
                ApiError::new(
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    ErrorCode::InvalidRange,
                    format!("unsupported Range header: {raw}"),
                    false,
                )
            })?;
            Some(read::resolve_range(parsed, size).ok_or_else(|| {
                ApiError::new(
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    ErrorCode::InvalidRange,
                    "requested range is outside the object",
                    false,
                )
                .with_details(json!({ "sizeBytes": size }))
            })?)
        }
        None => None,
    };

    let (start, end, status) = match range {
        Some((start, end)) => (start, end, StatusCode::PARTIAL_CONTENT),
        None => (0, size - 1, StatusCode::OK),
    };
    let span = end - start + 1;

    let mut response = Response::builder()
        .status(status)
        .header("accept-ranges", "bytes")
        .header("etag", &fields.blob_id)
        .header("content-type", &fields.mime)
        .header("content-length", span);
    if status == StatusCode::PARTIAL_CONTENT {
        response = response.header("content-range", format!("bytes {start}-{end}/{size}"));
    }

    // HEAD answers from metadata alone; no upstream reads.
    let body = if method == Method::HEAD {
        axum::body::Body::empty()
    } else {
        read::open_stream(&state, &fields, start, end).await?
    };

    response
        .body(body)
        .map_err(|e| ApiError::internal(format!("failed to build response: {e}")))
}

pub async fn health(State(state): State<GatewayState>) -> Response {
    let started = std::time::Instant::now();
    match state.kv.ping().await {
        Ok(()) => Json(json!({
            "status": "ok",
            "kv": { "ok": true, "latencyMs": started.elapsed().as_millis() as u64 }
        }))
        .into_response(),
        Err(e) => {
            error!(error = %e, "health check failed");
            ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorCode::InternalError,
                "key-value store is unreachable",
                true,
            )
            .into_response()
        }
    }
}
