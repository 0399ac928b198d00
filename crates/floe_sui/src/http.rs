//! HTTP implementation of [`Registry`] against the registry RPC bridge.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use floe_base::model::AssetFields;
use serde_json::{json, Value};
use tracing::{debug, warn};
use url::Url;

use crate::signer::SuiSigner;
use crate::{MintRequest, MintedAsset, Registry, RegistryError, RegistryResult};

const REGISTRY_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpRegistry {
    http: reqwest::Client,
    base_url: Url,
    signer: Option<Arc<SuiSigner>>,
}

impl HttpRegistry {
    pub fn new(base_url: Url, signer: Option<Arc<SuiSigner>>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REGISTRY_TIMEOUT)
            .build()
            .expect("failed to build registry http client");
        Self {
            http,
            base_url,
            signer,
        }
    }

    fn endpoint(&self, path: &str) -> RegistryResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| RegistryError::Unavailable(format!("bad registry url: {e}")))
    }

    fn signed(&self, req: reqwest::RequestBuilder, payload: &[u8]) -> reqwest::RequestBuilder {
        match &self.signer {
            Some(signer) => {
                let ts = Utc::now().timestamp_millis().to_string();
                let mut message = ts.as_bytes().to_vec();
                message.push(b':');
                message.extend_from_slice(payload);
                req.header("x-floe-timestamp", &ts)
                    .header("x-floe-public-key", signer.public_key_base64())
                    .header("x-floe-signature", signer.sign_base64(&message))
            }
            None => req,
        }
    }

    async fn read_json(resp: reqwest::Response) -> RegistryResult<Value> {
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(RegistryError::NotFound);
        }
        if status.is_server_error() {
            return Err(RegistryError::Unavailable(format!(
                "registry answered {status}"
            )));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RegistryError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        resp.json::<Value>()
            .await
            .map_err(|e| RegistryError::InvalidObject(format!("non-JSON registry reply: {e}")))
    }
}

fn transport_err(e: reqwest::Error) -> RegistryError {
    RegistryError::Unavailable(format!("{e:#}"))
}

/// Pick the first present key out of snake_case / camelCase spellings.
fn pick<'a>(obj: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| {
        let v = obj.get(k)?;
        (!v.is_null()).then_some(v)
    })
}

/// Turn a raw registry object payload into a strict [`AssetFields`] record.
///
/// The bridge forwards whatever shape the chain query produced, so we accept
/// either a top-level object or one wrapped in `fields`/`content.fields`,
/// with snake_case or camelCase keys. Anything that cannot be normalized is
/// an error, never a guess.
pub fn normalize_object(value: &Value) -> RegistryResult<AssetFields> {
    let obj = value
        .get("content")
        .and_then(|c| c.get("fields"))
        .or_else(|| value.get("fields"))
        .unwrap_or(value);

    let blob_id = pick(obj, &["blob_id", "blobId"])
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| RegistryError::InvalidObject("missing blob_id".into()))?;

    let size_bytes = pick(obj, &["size_bytes", "sizeBytes", "size"])
        .and_then(|v| {
            v.as_u64()
                .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
        })
        .filter(|n| *n > 0)
        .ok_or_else(|| RegistryError::InvalidObject("missing or non-positive size_bytes".into()))?;

    let mime = pick(obj, &["mime", "mime_type", "mimeType"])
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("application/octet-stream")
        .to_string();

    let created_at = pick(obj, &["created_at", "createdAt"]).and_then(|v| {
        v.as_i64()
            .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
    });

    let owner = pick(obj, &["owner"])
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(AssetFields {
        blob_id: blob_id.to_string(),
        size_bytes,
        mime,
        created_at,
        owner,
    })
}

#[async_trait]
impl Registry for HttpRegistry {
    async fn mint_asset(&self, req: &MintRequest) -> RegistryResult<MintedAsset> {
        let body = json!({
            "blobId": req.blob_id,
            "sizeBytes": req.size_bytes,
            "mime": req.mime,
            "owner": req.owner,
        });
        let payload = serde_json::to_vec(&body)
            .map_err(|e| RegistryError::InvalidObject(format!("mint body: {e}")))?;

        let url = self.endpoint("v1/assets")?;
        let request = self.signed(self.http.post(url), &payload).json(&body);
        let resp = request.send().await.map_err(transport_err)?;
        let reply = Self::read_json(resp).await?;

        let object_id = pick(&reply, &["objectId", "object_id", "id"])
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| RegistryError::InvalidObject("mint reply has no object id".into()))?;

        debug!(object_id, blob_id = %req.blob_id, "minted asset object");
        Ok(MintedAsset {
            object_id: object_id.to_string(),
        })
    }

    async fn get_asset_fields(&self, file_id: &str) -> RegistryResult<AssetFields> {
        let url = self.endpoint(&format!("v1/objects/{file_id}"))?;
        let resp = self.http.get(url).send().await.map_err(transport_err)?;
        let reply = Self::read_json(resp).await?;
        normalize_object(&reply)
    }

    async fn check_balance(&self, address: &str) -> RegistryResult<u64> {
        let url = self.endpoint(&format!("v1/accounts/{address}/balance"))?;
        let resp = self.http.get(url).send().await.map_err(transport_err)?;
        let reply = Self::read_json(resp).await?;
        pick(&reply, &["balance"])
            .and_then(|v| {
                v.as_u64()
                    .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
            })
            .ok_or_else(|| {
                warn!(address, "balance reply missing balance field");
                RegistryError::InvalidObject("balance reply missing balance".into())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_snake_case_fields() {
        let value = json!({
            "blob_id": "  abc  ",
            "size_bytes": 1024,
            "mime": "video/mp4",
            "created_at": 1700000000000i64,
            "owner": "0xowner"
        });
        let fields = normalize_object(&value).unwrap();
        assert_eq!(fields.blob_id, "abc");
        assert_eq!(fields.size_bytes, 1024);
        assert_eq!(fields.mime, "video/mp4");
        assert_eq!(fields.created_at, Some(1700000000000));
        assert_eq!(fields.owner.as_deref(), Some("0xowner"));
    }

    #[test]
    fn normalizes_nested_camel_case_fields() {
        let value = json!({
            "content": {
                "fields": {
                    "blobId": "xyz",
                    "sizeBytes": "2048"
                }
            }
        });
        let fields = normalize_object(&value).unwrap();
        assert_eq!(fields.blob_id, "xyz");
        assert_eq!(fields.size_bytes, 2048);
        assert_eq!(fields.mime, "application/octet-stream");
    }

    #[test]
    fn rejects_missing_blob_id() {
        let value = json!({ "size_bytes": 10 });
        assert!(matches!(
            normalize_object(&value),
            Err(RegistryError::InvalidObject(_))
        ));
    }

    #[test]
    fn rejects_non_positive_size() {
        let value = json!({ "blob_id": "abc", "size_bytes": 0 });
        assert!(matches!(
            normalize_object(&value),
            Err(RegistryError::InvalidObject(_))
        ));
        let value = json!({ "blob_id": "abc" });
        assert!(normalize_object(&value).is_err());
    }

    #[test]
    fn blank_blob_id_is_rejected() {
        let value = json!({ "blob_id": "   ", "size_bytes": 10 });
        assert!(normalize_object(&value).is_err());
    }
}
