//! Domain records shared across the gateway: upload sessions, the durable
//! meta sibling that outlives them, and the normalized on-chain asset fields.
//!
//! Sessions and meta records live in KV hashes, so every field round-trips
//! through `(String, String)` pairs. Numeric fields are parsed defensively:
//! a hash with a missing or garbled integer is reported as corrupt rather
//! than silently defaulted.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("session record is missing field `{0}`")]
    MissingField(&'static str),
    #[error("session record field `{0}` is not a valid integer")]
    BadInteger(&'static str),
    #[error("session record field `{0}` is malformed")]
    BadField(&'static str),
}

/// Lifecycle state of an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    Uploading,
    Finalizing,
    Completed,
    Failed,
    Canceled,
    Expired,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploading => "uploading",
            Self::Finalizing => "finalizing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "uploading" => Some(Self::Uploading),
            "finalizing" => Some(Self::Finalizing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "canceled" => Some(Self::Canceled),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    /// Terminal states are never resurrected into an uploading session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Canceled | Self::Expired
        )
    }

    /// States the reaper is allowed to collect artifacts for.
    pub fn is_collectible(&self) -> bool {
        matches!(self, Self::Failed | Self::Canceled | Self::Expired)
    }
}

impl std::fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Control-plane record for one in-progress upload.
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub upload_id: Uuid,
    pub filename: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub chunk_size: u64,
    pub total_chunks: u64,
    pub epochs: u32,
    pub status: UploadStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl UploadSession {
    /// Expected byte length of the chunk at `index`. The last chunk carries
    /// the remainder when `size_bytes` is not a multiple of `chunk_size`.
    pub fn expected_chunk_size(&self, index: u64) -> u64 {
        if index + 1 == self.total_chunks {
            self.size_bytes - self.chunk_size * (self.total_chunks - 1)
        } else {
            self.chunk_size
        }
    }

    pub fn is_last_chunk(&self, index: u64) -> bool {
        index + 1 == self.total_chunks
    }

    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("upload_id".into(), self.upload_id.to_string()),
            ("filename".into(), self.filename.clone()),
            ("content_type".into(), self.content_type.clone()),
            ("size_bytes".into(), self.size_bytes.to_string()),
            ("chunk_size".into(), self.chunk_size.to_string()),
            ("total_chunks".into(), self.total_chunks.to_string()),
            ("epochs".into(), self.epochs.to_string()),
            ("status".into(), self.status.as_str().into()),
            (
                "created_at".into(),
                self.created_at.timestamp_millis().to_string(),
            ),
            (
                "expires_at".into(),
                self.expires_at.timestamp_millis().to_string(),
            ),
        ]
    }

    pub fn from_fields(fields: &[(String, String)]) -> Result<Self, ModelError> {
        let get = |name: &'static str| -> Result<&str, ModelError> {
            fields
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
                .ok_or(ModelError::MissingField(name))
        };
        let int = |name: &'static str| -> Result<u64, ModelError> {
            get(name)?
                .parse::<u64>()
                .map_err(|_| ModelError::BadInteger(name))
        };
        let ts = |name: &'static str| -> Result<DateTime<Utc>, ModelError> {
            let millis = get(name)?
                .parse::<i64>()
                .map_err(|_| ModelError::BadInteger(name))?;
            Utc.timestamp_millis_opt(millis)
                .single()
                .ok_or(ModelError::BadField(name))
        };

        Ok(Self {
            upload_id: get("upload_id")?
                .parse()
                .map_err(|_| ModelError::BadField("upload_id"))?,
            filename: get("filename")?.to_string(),
            content_type: get("content_type")?.to_string(),
            size_bytes: int("size_bytes")?,
            chunk_size: int("chunk_size")?,
            total_chunks: int("total_chunks")?,
            epochs: int("epochs")? as u32,
            status: UploadStatus::parse(get("status")?).ok_or(ModelError::BadField("status"))?,
            created_at: ts("created_at")?,
            expires_at: ts("expires_at")?,
        })
    }
}

/// Durable sibling of [`UploadSession`]. Written sparsely: only the fields
/// that have happened exist in the hash.
#[derive(Debug, Clone, Default)]
pub struct UploadMeta {
    pub status: Option<UploadStatus>,
    pub created_at: Option<i64>,
    pub finalizing_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub failed_at: Option<i64>,
    pub canceled_at: Option<i64>,
    pub expired_at: Option<i64>,
    pub recovered_at: Option<i64>,
    pub walrus_uploaded_at: Option<i64>,
    pub metadata_finalized_at: Option<i64>,
    pub file_id: Option<String>,
    pub blob_id: Option<String>,
    pub size_bytes: Option<u64>,
    pub error: Option<String>,
}

impl UploadMeta {
    pub fn from_fields(fields: &[(String, String)]) -> Self {
        let mut meta = Self::default();
        for (k, v) in fields {
            match k.as_str() {
                "status" => meta.status = UploadStatus::parse(v),
                "created_at" => meta.created_at = v.parse().ok(),
                "finalizing_at" => meta.finalizing_at = v.parse().ok(),
                "completed_at" => meta.completed_at = v.parse().ok(),
                "failed_at" => meta.failed_at = v.parse().ok(),
                "canceled_at" => meta.canceled_at = v.parse().ok(),
                "expired_at" => meta.expired_at = v.parse().ok(),
                "recovered_at" => meta.recovered_at = v.parse().ok(),
                "walrus_uploaded_at" => meta.walrus_uploaded_at = v.parse().ok(),
                "metadata_finalized_at" => meta.metadata_finalized_at = v.parse().ok(),
                "file_id" => meta.file_id = Some(v.clone()),
                "blob_id" => meta.blob_id = Some(v.clone()),
                "size_bytes" => meta.size_bytes = v.parse().ok(),
                "error" => meta.error = Some(v.clone()),
                _ => {}
            }
        }
        meta
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.created_at.is_none()
    }
}

/// Normalized snapshot of the on-chain asset object, as cached in KV and as
/// served by the read path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssetFields {
    pub blob_id: String,
    pub size_bytes: u64,
    pub mime: String,
    pub created_at: Option<i64>,
    pub owner: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_session() -> UploadSession {
        UploadSession {
            upload_id: Uuid::new_v4(),
            filename: "clip.mp4".into(),
            content_type: "video/mp4".into(),
            size_bytes: 5 * 1024 * 1024,
            chunk_size: 2 * 1024 * 1024,
            total_chunks: 3,
            epochs: 5,
            status: UploadStatus::Uploading,
            created_at: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
            expires_at: Utc.timestamp_millis_opt(1_700_021_600_000).unwrap(),
        }
    }

    #[test]
    fn session_round_trips_through_fields() {
        let session = sample_session();
        let parsed = UploadSession::from_fields(&session.to_fields()).unwrap();
        assert_eq!(parsed.upload_id, session.upload_id);
        assert_eq!(parsed.size_bytes, session.size_bytes);
        assert_eq!(parsed.total_chunks, 3);
        assert_eq!(parsed.status, UploadStatus::Uploading);
        assert_eq!(parsed.expires_at, session.expires_at);
    }

    #[test]
    fn garbled_integer_is_rejected() {
        let mut fields = sample_session().to_fields();
        for (k, v) in fields.iter_mut() {
            if k == "size_bytes" {
                *v = "NaN".into();
            }
        }
        let err = UploadSession::from_fields(&fields).unwrap_err();
        assert!(matches!(err, ModelError::BadInteger("size_bytes")));
    }

    #[test]
    fn missing_field_is_rejected() {
        let fields: Vec<(String, String)> = sample_session()
            .to_fields()
            .into_iter()
            .filter(|(k, _)| k != "chunk_size")
            .collect();
        let err = UploadSession::from_fields(&fields).unwrap_err();
        assert!(matches!(err, ModelError::MissingField("chunk_size")));
    }

    #[test]
    fn last_chunk_carries_remainder() {
        let session = sample_session();
        assert_eq!(session.expected_chunk_size(0), 2 * 1024 * 1024);
        assert_eq!(session.expected_chunk_size(1), 2 * 1024 * 1024);
        assert_eq!(session.expected_chunk_size(2), 1024 * 1024);
        assert!(session.is_last_chunk(2));
        assert!(!session.is_last_chunk(1));
    }

    #[test]
    fn meta_parses_sparse_fields() {
        let fields = vec![
            ("status".to_string(), "completed".to_string()),
            ("file_id".to_string(), "0xfeed".to_string()),
            ("blob_id".to_string(), "abc123".to_string()),
            ("size_bytes".to_string(), "42".to_string()),
        ];
        let meta = UploadMeta::from_fields(&fields);
        assert_eq!(meta.status, Some(UploadStatus::Completed));
        assert_eq!(meta.file_id.as_deref(), Some("0xfeed"));
        assert_eq!(meta.size_bytes, Some(42));
        assert!(meta.failed_at.is_none());
    }

    #[test]
    fn collectible_statuses() {
        assert!(UploadStatus::Failed.is_collectible());
        assert!(UploadStatus::Expired.is_collectible());
        assert!(UploadStatus::Canceled.is_collectible());
        assert!(!UploadStatus::Uploading.is_collectible());
        assert!(!UploadStatus::Finalizing.is_collectible());
        assert!(!UploadStatus::Completed.is_collectible());
    }
}
