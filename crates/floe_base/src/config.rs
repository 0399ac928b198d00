//! Validated runtime configuration.
//!
//! The binary deserializes loose settings (file + environment) and converts
//! them into this strict record once at startup. Anything invalid fails fast
//! with a message naming the offending knob; the rest of the codebase only
//! ever sees values that already passed validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use url::Url;

pub const MIN_CHUNK_BYTES: u64 = 256 * 1024;
pub const MAX_CHUNK_BYTES: u64 = 20 * 1024 * 1024;
pub const DEFAULT_CHUNK_BYTES: u64 = 8 * 1024 * 1024;
pub const MAX_FILE_BYTES: u64 = 15 * 1024 * 1024 * 1024;
pub const MAX_TOTAL_CHUNKS: u64 = 200_000;
pub const MAX_ACTIVE_UPLOADS: u64 = 100;
pub const MAX_EPOCHS: u32 = 90;
pub const DEFAULT_EPOCHS: u32 = 5;
pub const MAX_FILENAME_LEN: usize = 512;
pub const MAX_CONTENT_TYPE_LEN: usize = 128;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid network `{0}`: expected mainnet or testnet")]
    InvalidNetwork(String),
    #[error("upload tmp dir must be an absolute path, got `{0}`")]
    TmpDirNotAbsolute(String),
    #[error("upload tmp dir `{0}` is not allowed")]
    TmpDirForbidden(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
}

impl Network {
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s {
            "mainnet" => Ok(Self::Mainnet),
            "testnet" => Ok(Self::Testnet),
            other => Err(ConfigError::InvalidNetwork(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
        }
    }
}

#[derive(Debug, Clone)]
pub struct KvConfig {
    /// Redis connection URL.
    pub url: String,
    /// Namespace prepended to every key.
    pub key_prefix: String,
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Staging directory for chunk files and assembled files.
    pub tmp_dir: PathBuf,
    /// Session hash TTL.
    pub session_ttl: Duration,
    /// Extra TTL the meta hash gets on top of the session TTL, so terminal
    /// state stays observable after the session key expires.
    pub meta_ttl_slack: Duration,
    pub max_file_size: u64,
    pub chunk_size_default: u64,
    pub chunk_size_min: u64,
    pub chunk_size_max: u64,
    pub max_total_chunks: u64,
    pub max_active_uploads: u64,
    pub epochs_default: u32,
    pub epochs_max: u32,
}

#[derive(Debug, Clone)]
pub struct FinalizeConfig {
    /// TTL of the per-session finalize lock lease.
    pub lock_ttl: Duration,
    /// How often the lock owner refreshes the lease.
    pub lock_refresh: Duration,
}

#[derive(Debug, Clone)]
pub struct WalrusConfig {
    pub publisher_url: Url,
    /// Ordered aggregator endpoints: primary first, then fallbacks.
    pub aggregator_urls: Vec<Url>,
    pub publish_timeout: Duration,
    pub publish_concurrency: usize,
    pub publish_interval_cap: u32,
    pub publish_interval: Duration,
    pub publish_max_retries: u32,
    pub publish_retry_base_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct SuiConfig {
    pub registry_url: Url,
    /// Signing key material; required on mainnet.
    pub secret: Option<String>,
    /// Minimum account balance required before a publish is attempted.
    pub min_balance: u64,
    /// Owner recorded on minted assets.
    pub owner_address: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Upper bound on a single upstream range request.
    pub max_range_bytes: u64,
    /// Hard deadline for serving one ranged read.
    pub read_timeout: Duration,
    /// TTL of the asset-fields cache entry.
    pub fields_cache_ttl: Duration,
    /// Whether responses include `blobId` without the query opt-in.
    pub expose_blob_id: bool,
}

#[derive(Debug, Clone)]
pub struct GcConfig {
    pub reaper_interval: Duration,
    /// Minimum quiet period between an artifact's last mtime and deletion.
    pub grace: Duration,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub network: Network,
    pub listen_port: u16,
    pub kv: KvConfig,
    pub upload: UploadConfig,
    pub finalize: FinalizeConfig,
    pub walrus: WalrusConfig,
    pub sui: SuiConfig,
    pub stream: StreamConfig,
    pub gc: GcConfig,
}

/// Static checks on the staging directory. Writability is probed separately
/// at startup by the chunk store.
pub fn validate_tmp_dir(path: &Path) -> Result<(), ConfigError> {
    if !path.is_absolute() {
        return Err(ConfigError::TmpDirNotAbsolute(path.display().to_string()));
    }
    let display = path.display().to_string();
    let mut forbidden = vec!["/".to_string(), "/home".to_string()];
    if let Ok(home) = std::env::var("HOME") {
        if !home.is_empty() {
            forbidden.push(home);
        }
    }
    if forbidden.iter().any(|f| f.trim_end_matches('/') == display.trim_end_matches('/')) {
        return Err(ConfigError::TmpDirForbidden(display));
    }
    Ok(())
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            tmp_dir: PathBuf::from("/var/tmp/floe-uploads"),
            session_ttl: Duration::from_secs(6 * 60 * 60),
            meta_ttl_slack: Duration::from_secs(30 * 60),
            max_file_size: MAX_FILE_BYTES,
            chunk_size_default: DEFAULT_CHUNK_BYTES,
            chunk_size_min: MIN_CHUNK_BYTES,
            chunk_size_max: MAX_CHUNK_BYTES,
            max_total_chunks: MAX_TOTAL_CHUNKS,
            max_active_uploads: MAX_ACTIVE_UPLOADS,
            epochs_default: DEFAULT_EPOCHS,
            epochs_max: MAX_EPOCHS,
        }
    }
}

impl Default for FinalizeConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(15 * 60),
            lock_refresh: Duration::from_secs(60),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_range_bytes: 16 * 1024 * 1024,
            read_timeout: Duration::from_secs(10 * 60),
            fields_cache_ttl: Duration::from_secs(24 * 60 * 60),
            expose_blob_id: false,
        }
    }
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            reaper_interval: Duration::from_secs(5 * 60),
            grace: Duration::from_secs(15 * 60),
        }
    }
}
