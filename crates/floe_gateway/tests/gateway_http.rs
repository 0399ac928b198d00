//! End-to-end exercises of the HTTP surface over the in-memory KV store and
//! mock upstreams. The mock publisher stores published bytes in a shared
//! blob map that the mock segment source serves ranges from, so a full
//! upload-then-read round trip runs without any network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use bytes::Bytes;
use floe_base::config::{
    FinalizeConfig, GatewayConfig, GcConfig, KvConfig, Network, StreamConfig, SuiConfig,
    UploadConfig, WalrusConfig,
};
use floe_base::model::AssetFields;
use floe_gateway::{build_router, build_state, GatewayState};
use floe_kv::{KvStore, MemoryKv};
use floe_sui::{MintRequest, MintedAsset, Registry, RegistryError};
use floe_walrus::{
    BlobPublisher, FetchError, PublishCoordinator, PublishError, PublishRequest, SegmentFetch,
    SegmentSource,
};
use http_body_util::BodyExt;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use uuid::Uuid;

type BlobMap = Arc<Mutex<HashMap<String, Vec<u8>>>>;

struct MockPublisher {
    blobs: BlobMap,
    calls: AtomicU32,
}

#[async_trait]
impl BlobPublisher for MockPublisher {
    async fn publish(
        &self,
        req: &PublishRequest,
        _cancel: &CancellationToken,
    ) -> Result<String, PublishError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let bytes = tokio::fs::read(&req.file_path).await?;
        assert_eq!(bytes.len() as u64, req.size_bytes, "assembly size law");
        let blob_id = format!("blob-{}", hex::encode(&Sha256::digest(&bytes)[..8]));
        self.blobs.lock().unwrap().insert(blob_id.clone(), bytes);
        Ok(blob_id)
    }
}

struct MockRegistry {
    minted: Mutex<HashMap<String, AssetFields>>,
    mints: AtomicU32,
}

#[async_trait]
impl Registry for MockRegistry {
    async fn mint_asset(&self, req: &MintRequest) -> Result<MintedAsset, RegistryError> {
        let n = self.mints.fetch_add(1, Ordering::SeqCst);
        let object_id = format!("0xfile{n:04}");
        self.minted.lock().unwrap().insert(
            object_id.clone(),
            AssetFields {
                blob_id: req.blob_id.clone(),
                size_bytes: req.size_bytes,
                mime: req.mime.clone(),
                created_at: Some(1_700_000_000_000),
                owner: req.owner.clone(),
            },
        );
        Ok(MintedAsset { object_id })
    }

    async fn get_asset_fields(&self, file_id: &str) -> Result<AssetFields, RegistryError> {
        self.minted
            .lock()
            .unwrap()
            .get(file_id)
            .cloned()
            .ok_or(RegistryError::NotFound)
    }

    async fn check_balance(&self, _address: &str) -> Result<u64, RegistryError> {
        Ok(u64::MAX)
    }
}

struct MockSegments {
    blobs: BlobMap,
}

#[async_trait]
impl SegmentSource for MockSegments {
    async fn fetch_segment(
        &self,
        blob_id: &str,
        start: u64,
        end: u64,
        _cancel: &CancellationToken,
    ) -> Result<SegmentFetch, FetchError> {
        let blobs = self.blobs.lock().unwrap();
        let Some(blob) = blobs.get(blob_id) else {
            return Err(FetchError::NotFound);
        };
        if start >= blob.len() as u64 {
            return Ok(SegmentFetch {
                status: 416,
                bytes: Bytes::new(),
            });
        }
        let end = (end as usize).min(blob.len() - 1);
        Ok(SegmentFetch {
            status: 206,
            bytes: Bytes::copy_from_slice(&blob[start as usize..=end]),
        })
    }
}

struct Harness {
    app: Router,
    state: GatewayState,
    publisher: Arc<MockPublisher>,
    tmp_dir: std::path::PathBuf,
}

fn test_config(tmp_dir: std::path::PathBuf) -> GatewayConfig {
    GatewayConfig {
        network: Network::Testnet,
        listen_port: 0,
        kv: KvConfig {
            url: "redis://localhost".into(),
            key_prefix: "floe:v1".into(),
        },
        upload: UploadConfig {
            tmp_dir,
            ..UploadConfig::default()
        },
        finalize: FinalizeConfig::default(),
        walrus: WalrusConfig {
            publisher_url: "http://localhost:9001/".parse().unwrap(),
            aggregator_urls: vec!["http://localhost:9002/".parse().unwrap()],
            publish_timeout: Duration::from_secs(300),
            publish_concurrency: 2,
            publish_interval_cap: 100,
            publish_interval: Duration::from_millis(10),
            publish_max_retries: 2,
            publish_retry_base_delay: Duration::from_millis(1),
        },
        sui: SuiConfig {
            registry_url: "http://localhost:9003/".parse().unwrap(),
            secret: None,
            min_balance: 0,
            owner_address: Some("0xowner".into()),
        },
        stream: StreamConfig {
            // Small segments so multi-segment stitching is exercised.
            max_range_bytes: 64 * 1024,
            ..StreamConfig::default()
        },
        gc: GcConfig::default(),
    }
}

fn harness() -> Harness {
    let tmp_dir = std::env::temp_dir().join(format!("floe-gateway-it-{}", Uuid::new_v4()));
    let config = Arc::new(test_config(tmp_dir.clone()));
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let blobs: BlobMap = Arc::new(Mutex::new(HashMap::new()));

    let publisher = Arc::new(MockPublisher {
        blobs: blobs.clone(),
        calls: AtomicU32::new(0),
    });
    let registry = Arc::new(MockRegistry {
        minted: Mutex::new(HashMap::new()),
        mints: AtomicU32::new(0),
    });
    let coordinator = Arc::new(PublishCoordinator::new(
        publisher.clone(),
        2,
        100,
        Duration::from_millis(10),
        2,
        Duration::from_millis(1),
    ));
    let segments = Arc::new(MockSegments { blobs });

    let state = build_state(config, kv, coordinator, registry, segments);
    Harness {
        app: build_router(state.clone()),
        state,
        publisher,
        tmp_dir,
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.tmp_dir);
    }
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value, axum::http::HeaderMap) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json, headers)
}

async fn send_raw(app: &Router, req: Request<Body>) -> (StatusCode, Vec<u8>, axum::http::HeaderMap) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, bytes.to_vec(), headers)
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn multipart_chunk(upload_id: &str, index: u64, data: &[u8], hash: &str) -> Request<Body> {
    let boundary = "floe-test-boundary";
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(
        b"Content-Disposition: form-data; name=\"file\"; filename=\"chunk\"\r\n",
    );
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

    Request::builder()
        .method("PUT")
        .uri(format!("/v1/uploads/{upload_id}/chunk/{index}"))
        .header(
            "content-type",
            format!("multipart/form-data; boundary={boundary}"),
        )
        .header("x-chunk-sha256", hash)
        .body(Body::from(body))
        .unwrap()
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn deterministic_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

async fn create_upload(app: &Router, size: usize, chunk_size: u64) -> (String, u64) {
    let (status, body, _) = send(
        app,
        json_request(
            "POST",
            "/v1/uploads/create",
            serde_json::json!({
                "filename": "asset.bin",
                "contentType": "application/octet-stream",
                "sizeBytes": size,
                "chunkSize": chunk_size,
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "create failed: {body}");
    let upload_id = body["uploadId"].as_str().unwrap().to_string();
    let total = body["totalChunks"].as_u64().unwrap();
    (upload_id, total)
}

fn chunk_of(data: &[u8], index: u64, chunk_size: u64) -> &[u8] {
    let start = (index * chunk_size) as usize;
    let end = ((index + 1) * chunk_size as u64) as usize;
    &data[start..end.min(data.len())]
}

async fn upload_chunk_ok(app: &Router, upload_id: &str, index: u64, data: &[u8]) {
    let (status, body, _) =
        send(app, multipart_chunk(upload_id, index, data, &sha256_hex(data))).await;
    assert_eq!(status, StatusCode::OK, "chunk {index} failed: {body}");
    assert_eq!(body["ok"], true);
    assert_eq!(body["chunkIndex"], index);
}

// Scenario: chunks uploaded out of order [2, 0, 1]; status tracks exactly
// the received indices; complete finalizes and answers with a file id.
#[tokio::test]
async fn out_of_order_upload_completes() {
    let hx = harness();
    const CHUNK: u64 = 256 * 1024;
    let data = deterministic_bytes((2 * CHUNK + CHUNK / 2) as usize);
    let (upload_id, total) = create_upload(&hx.app, data.len(), CHUNK).await;
    assert_eq!(total, 3);

    let mut expected_received: Vec<u64> = Vec::new();
    for index in [2u64, 0, 1] {
        upload_chunk_ok(&hx.app, &upload_id, index, chunk_of(&data, index, CHUNK)).await;
        expected_received.push(index);
        expected_received.sort_unstable();

        let (status, body, _) = send(
            &hx.app,
            Request::builder()
                .uri(format!("/v1/uploads/{upload_id}/status"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "uploading");
        let received: Vec<u64> = body["receivedChunks"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_u64().unwrap())
            .collect();
        assert_eq!(received, expected_received);
    }

    let (status, body, _) = send(
        &hx.app,
        json_request(
            "POST",
            &format!("/v1/uploads/{upload_id}/complete?includeBlobId=1"),
            serde_json::json!({}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "complete failed: {body}");
    assert_eq!(body["status"], "ready");
    assert!(!body["fileId"].as_str().unwrap().is_empty());
    assert!(!body["blobId"].as_str().unwrap().is_empty());
    assert_eq!(body["sizeBytes"].as_u64().unwrap(), data.len() as u64);
    assert_eq!(hx.publisher.calls.load(Ordering::SeqCst), 1);
}

// Scenario: client crashes after two chunks, resumes from status, and the
// bytes served back equal the original file.
#[tokio::test]
async fn resume_then_read_back_round_trip() {
    let hx = harness();
    const CHUNK: u64 = 256 * 1024;
    let data = deterministic_bytes((2 * CHUNK + 1024) as usize);
    let (upload_id, total) = create_upload(&hx.app, data.len(), CHUNK).await;
    assert_eq!(total, 3);

    upload_chunk_ok(&hx.app, &upload_id, 0, chunk_of(&data, 0, CHUNK)).await;
    upload_chunk_ok(&hx.app, &upload_id, 1, chunk_of(&data, 1, CHUNK)).await;

    // "Crash": a fresh client asks where things stand.
    let (status, body, _) = send(
        &hx.app,
        Request::builder()
            .uri(format!("/v1/uploads/{upload_id}/status"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "uploading");
    assert_eq!(
        body["receivedChunks"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_u64().unwrap())
            .collect::<Vec<_>>(),
        vec![0, 1]
    );

    upload_chunk_ok(&hx.app, &upload_id, 2, chunk_of(&data, 2, CHUNK)).await;

    let (status, body, _) = send(
        &hx.app,
        json_request(
            "POST",
            &format!("/v1/uploads/{upload_id}/complete"),
            serde_json::json!({}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let file_id = body["fileId"].as_str().unwrap().to_string();

    // Full-body read equals the original upload.
    let (status, bytes, headers) = send_raw(
        &hx.app,
        Request::builder()
            .uri(format!("/v1/files/{file_id}/stream"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["accept-ranges"], "bytes");
    assert_eq!(
        headers["content-length"],
        data.len().to_string().as_str()
    );
    assert_eq!(bytes, data);
}

// Scenario: corrupted body with a truthful header hash is rejected without
// leaving a final file; a correct retry succeeds.
#[tokio::test]
async fn hash_mismatch_then_successful_retry() {
    let hx = harness();
    const CHUNK: u64 = 256 * 1024;
    let data = deterministic_bytes((CHUNK + 17) as usize);
    let (upload_id, _) = create_upload(&hx.app, data.len(), CHUNK).await;

    let good = chunk_of(&data, 0, CHUNK);
    let mut corrupted = good.to_vec();
    corrupted[0] ^= 0xFF;

    let (status, body, _) = send(
        &hx.app,
        multipart_chunk(&upload_id, 0, &corrupted, &sha256_hex(good)),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_CHUNK");
    assert_eq!(body["error"]["retryable"], false);
    assert!(!hx.state.chunks.has_chunk(&upload_id.parse().unwrap(), 0).await);

    upload_chunk_ok(&hx.app, &upload_id, 0, good).await;
}

// Scenario: two concurrent completes; exactly one wins, the other answers
// 409 or replays the committed result.
#[tokio::test]
async fn concurrent_finalize_is_exclusive() {
    let hx = harness();
    const CHUNK: u64 = 256 * 1024;
    let data = deterministic_bytes(CHUNK as usize + 5);
    let (upload_id, total) = create_upload(&hx.app, data.len(), CHUNK).await;
    for index in 0..total {
        upload_chunk_ok(&hx.app, &upload_id, index, chunk_of(&data, index, CHUNK)).await;
    }

    let uri = format!("/v1/uploads/{upload_id}/complete");
    let (a, b) = tokio::join!(
        send(&hx.app, json_request("POST", &uri, serde_json::json!({}))),
        send(&hx.app, json_request("POST", &uri, serde_json::json!({}))),
    );

    let mut oks = Vec::new();
    let mut conflicts = 0;
    for (status, body, _) in [a, b] {
        match status {
            StatusCode::OK => oks.push(body["fileId"].as_str().unwrap().to_string()),
            StatusCode::CONFLICT => {
                assert_eq!(body["error"]["code"], "UPLOAD_FINALIZATION_IN_PROGRESS");
                conflicts += 1;
            }
            other => panic!("unexpected status {other}"),
        }
    }
    assert!(!oks.is_empty());
    if oks.len() == 2 {
        assert_eq!(oks[0], oks[1]);
    } else {
        assert_eq!(conflicts, 1);
    }
    // Publish happened exactly once regardless of the race outcome.
    assert_eq!(hx.publisher.calls.load(Ordering::SeqCst), 1);

    // A later replay returns the same result without re-publishing.
    let (status, body, _) = send(&hx.app, json_request("POST", &uri, serde_json::json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["fileId"].as_str().unwrap(), oks[0]);
    assert_eq!(hx.publisher.calls.load(Ordering::SeqCst), 1);
}

// Scenario: ranged reads return exactly the requested slice with correct
// headers, across multiple stitched segments; the suffix form returns the
// trailing bytes.
#[tokio::test]
async fn range_reads_return_exact_slices() {
    let hx = harness();
    const CHUNK: u64 = 1024 * 1024;
    let data = deterministic_bytes(2 * CHUNK as usize); // 2 MiB, 64 KiB segments
    let (upload_id, total) = create_upload(&hx.app, data.len(), CHUNK).await;
    for index in 0..total {
        upload_chunk_ok(&hx.app, &upload_id, index, chunk_of(&data, index, CHUNK)).await;
    }
    let (_, body, _) = send(
        &hx.app,
        json_request(
            "POST",
            &format!("/v1/uploads/{upload_id}/complete"),
            serde_json::json!({}),
        ),
    )
    .await;
    let file_id = body["fileId"].as_str().unwrap().to_string();

    // Middle 512 KiB spanning several 64 KiB upstream segments.
    let (start, end) = (300_000u64, 300_000u64 + 512 * 1024 - 1);
    let (status, bytes, headers) = send_raw(
        &hx.app,
        Request::builder()
            .uri(format!("/v1/files/{file_id}/stream"))
            .header("range", format!("bytes={start}-{end}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        headers["content-range"],
        format!("bytes {start}-{end}/{}", data.len())
    );
    assert_eq!(headers["content-length"], (end - start + 1).to_string().as_str());
    assert_eq!(bytes, &data[start as usize..=end as usize]);

    // Suffix form: the trailing KiB.
    let (status, bytes, headers) = send_raw(
        &hx.app,
        Request::builder()
            .uri(format!("/v1/files/{file_id}/stream"))
            .header("range", "bytes=-1024")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(headers["content-length"], "1024");
    assert_eq!(bytes, &data[data.len() - 1024..]);

    // Unsatisfiable range.
    let (status, body, _) = send(
        &hx.app,
        Request::builder()
            .uri(format!("/v1/files/{file_id}/stream"))
            .header("range", format!("bytes={}-", data.len()))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(body["error"]["code"], "INVALID_RANGE");

    // HEAD answers from metadata alone.
    let (status, bytes, headers) = send_raw(
        &hx.app,
        Request::builder()
            .method("HEAD")
            .uri(format!("/v1/files/{file_id}/stream"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(bytes.is_empty());
    assert_eq!(headers["content-length"], data.len().to_string().as_str());
}

#[tokio::test]
async fn create_validates_inputs() {
    let hx = harness();

    // Oversized file.
    let (status, body, _) = send(
        &hx.app,
        json_request(
            "POST",
            "/v1/uploads/create",
            serde_json::json!({
                "filename": "big.bin",
                "contentType": "application/octet-stream",
                "sizeBytes": 16_u64 * 1024 * 1024 * 1024,
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["error"]["code"], "FILE_TOO_LARGE");

    // Missing fields.
    let (status, body, _) = send(
        &hx.app,
        json_request("POST", "/v1/uploads/create", serde_json::json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_CREATE_UPLOAD_REQUEST");

    // Non-positive size.
    let (status, body, _) = send(
        &hx.app,
        json_request(
            "POST",
            "/v1/uploads/create",
            serde_json::json!({
                "filename": "x",
                "contentType": "text/plain",
                "sizeBytes": 0,
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_FILE_SIZE");

    // Chunk size is clamped, not rejected.
    let (status, body, _) = send(
        &hx.app,
        json_request(
            "POST",
            "/v1/uploads/create",
            serde_json::json!({
                "filename": "x",
                "contentType": "text/plain",
                "sizeBytes": 1024,
                "chunkSize": 1,
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["chunkSize"].as_u64().unwrap(), 256 * 1024);
    assert_eq!(body["totalChunks"].as_u64().unwrap(), 1);
}

#[tokio::test]
async fn cancel_is_idempotent_and_blocks_further_chunks() {
    let hx = harness();
    const CHUNK: u64 = 256 * 1024;
    let data = deterministic_bytes(CHUNK as usize + 1);
    let (upload_id, _) = create_upload(&hx.app, data.len(), CHUNK).await;
    upload_chunk_ok(&hx.app, &upload_id, 0, chunk_of(&data, 0, CHUNK)).await;

    let (status, body, _) = send(
        &hx.app,
        Request::builder()
            .method("DELETE")
            .uri(format!("/v1/uploads/{upload_id}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "canceled");
    assert_eq!(body["ok"], true);

    // Status now sourced from meta.
    let (status, body, _) = send(
        &hx.app,
        Request::builder()
            .uri(format!("/v1/uploads/{upload_id}/status"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "canceled");

    // Further chunk uploads see a missing session.
    let chunk = chunk_of(&data, 1, CHUNK);
    let (status, body, _) = send(
        &hx.app,
        multipart_chunk(&upload_id, 1, chunk, &sha256_hex(chunk)),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "UPLOAD_NOT_FOUND");

    // Cancel replays cleanly.
    let (status, body, _) = send(
        &hx.app,
        Request::builder()
            .method("DELETE")
            .uri(format!("/v1/uploads/{upload_id}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "canceled");
}

#[tokio::test]
async fn metadata_and_manifest_withhold_blob_id_by_default() {
    let hx = harness();
    const CHUNK: u64 = 256 * 1024;
    let data = deterministic_bytes(CHUNK as usize / 2);
    let (upload_id, _) = create_upload(&hx.app, data.len(), CHUNK).await;
    upload_chunk_ok(&hx.app, &upload_id, 0, &data).await;
    let (_, body, _) = send(
        &hx.app,
        json_request(
            "POST",
            &format!("/v1/uploads/{upload_id}/complete"),
            serde_json::json!({}),
        ),
    )
    .await;
    let file_id = body["fileId"].as_str().unwrap().to_string();
    assert!(body.get("blobId").is_none(), "blobId must be withheld by default");

    let (status, body, _) = send(
        &hx.app,
        Request::builder()
            .uri(format!("/v1/files/{file_id}/metadata"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["fileId"], file_id.as_str());
    assert_eq!(body["manifestVersion"], 1);
    assert_eq!(body["mimeType"], "application/octet-stream");
    assert_eq!(body["sizeBytes"].as_u64().unwrap(), data.len() as u64);
    assert!(body.get("blobId").is_none());

    let (status, body, _) = send(
        &hx.app,
        Request::builder()
            .uri(format!("/v1/files/{file_id}/manifest?includeBlobId=true"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["layout"]["type"], "walrus_single_blob");
    let segment = &body["layout"]["segments"][0];
    assert_eq!(segment["index"], 0);
    assert_eq!(segment["offsetBytes"], 0);
    assert_eq!(segment["sizeBytes"].as_u64().unwrap(), data.len() as u64);
    assert!(segment["blobId"].as_str().is_some());
}

#[tokio::test]
async fn unknown_file_and_upload_are_not_found() {
    let hx = harness();

    let (status, body, _) = send(
        &hx.app,
        Request::builder()
            .uri("/v1/files/0xmissing/metadata")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "FILE_NOT_FOUND");

    let missing = Uuid::new_v4();
    let (status, body, _) = send(
        &hx.app,
        Request::builder()
            .uri(format!("/v1/uploads/{missing}/status"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "UPLOAD_NOT_FOUND");

    let (status, body, _) = send(
        &hx.app,
        Request::builder()
            .uri("/v1/uploads/not-a-uuid/status")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_UPLOAD_ID");
}

#[tokio::test]
async fn incomplete_upload_cannot_complete() {
    let hx = harness();
    const CHUNK: u64 = 256 * 1024;
    let data = deterministic_bytes((CHUNK * 2) as usize);
    let (upload_id, _) = create_upload(&hx.app, data.len(), CHUNK).await;
    upload_chunk_ok(&hx.app, &upload_id, 0, chunk_of(&data, 0, CHUNK)).await;

    let (status, body, _) = send(
        &hx.app,
        json_request(
            "POST",
            &format!("/v1/uploads/{upload_id}/complete"),
            serde_json::json!({}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "UPLOAD_INCOMPLETE");
    assert_eq!(body["error"]["details"]["received"], 1);
    assert_eq!(body["error"]["details"]["expected"], 2);
}

#[tokio::test]
async fn health_reports_kv_round_trip() {
    let hx = harness();
    let (status, body, _) = send(
        &hx.app,
        Request::builder().uri("/health").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["kv"]["ok"], true);
}
