//! Settings for Floe, defined in the settings.toml file and overridable via
//! `FLOE_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use floe_base::config::{
    FinalizeConfig, GatewayConfig, GcConfig, KvConfig, Network, StreamConfig, SuiConfig,
    UploadConfig, WalrusConfig,
};
use serde::Deserialize;
use url::Url;

#[derive(Debug, Deserialize)]
pub struct Kv {
    pub url: String,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_key_prefix() -> String {
    "floe:v1".to_string()
}

#[derive(Debug, Deserialize)]
pub struct Upload {
    pub tmp_dir: String,
    #[serde(default = "default_session_ttl_ms")]
    pub session_ttl_ms: u64,
    #[serde(default = "default_max_file_size")]
    pub max_file_size_bytes: u64,
    #[serde(default)]
    pub chunk_size_default_bytes: Option<u64>,
    #[serde(default = "default_max_active_uploads")]
    pub max_active_uploads: u64,
    #[serde(default = "default_epochs")]
    pub epochs_default: u32,
}

fn default_session_ttl_ms() -> u64 {
    6 * 60 * 60 * 1000
}

fn default_max_file_size() -> u64 {
    floe_base::config::MAX_FILE_BYTES
}

fn default_max_active_uploads() -> u64 {
    floe_base::config::MAX_ACTIVE_UPLOADS
}

fn default_epochs() -> u32 {
    floe_base::config::DEFAULT_EPOCHS
}

#[derive(Debug, Deserialize)]
pub struct Finalize {
    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,
    #[serde(default = "default_lock_refresh_ms")]
    pub lock_refresh_ms: u64,
}

fn default_lock_ttl_ms() -> u64 {
    15 * 60 * 1000
}

fn default_lock_refresh_ms() -> u64 {
    60 * 1000
}

impl Default for Finalize {
    fn default() -> Self {
        Self {
            lock_ttl_ms: default_lock_ttl_ms(),
            lock_refresh_ms: default_lock_refresh_ms(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Walrus {
    pub publisher_url: String,
    /// Primary aggregator endpoint.
    pub aggregator_url: String,
    /// Comma-separated fallback aggregator endpoints.
    #[serde(default)]
    pub aggregator_fallbacks: Option<String>,
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
    #[serde(default = "default_publish_concurrency")]
    pub publish_concurrency: usize,
    #[serde(default = "default_interval_cap")]
    pub publish_interval_cap: u32,
    #[serde(default = "default_interval_ms")]
    pub publish_interval_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

fn default_publish_timeout_ms() -> u64 {
    5 * 60 * 1000
}

fn default_publish_concurrency() -> usize {
    2
}

fn default_interval_cap() -> u32 {
    4
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

#[derive(Debug, Deserialize)]
pub struct Sui {
    pub registry_url: String,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub min_balance: u64,
    #[serde(default)]
    pub owner_address: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct Stream {
    #[serde(default)]
    pub max_range_bytes: Option<u64>,
    #[serde(default)]
    pub read_timeout_ms: Option<u64>,
    #[serde(default)]
    pub fields_cache_ttl_ms: Option<u64>,
    #[serde(default)]
    pub expose_blob_id: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct Gc {
    #[serde(default = "default_reaper_interval_ms")]
    pub reaper_interval_ms: u64,
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
}

fn default_reaper_interval_ms() -> u64 {
    5 * 60 * 1000
}

fn default_grace_ms() -> u64 {
    15 * 60 * 1000
}

impl Default for Gc {
    fn default() -> Self {
        Self {
            reaper_interval_ms: default_reaper_interval_ms(),
            grace_ms: default_grace_ms(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub network: String,
    pub listen_port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,

    pub kv: Kv,
    pub upload: Upload,
    #[serde(default)]
    pub finalize: Finalize,
    pub walrus: Walrus,
    pub sui: Sui,
    #[serde(default)]
    pub stream: Stream,
    #[serde(default)]
    pub gc: Gc,
}

fn default_log_level() -> String {
    "INFO".to_string()
}

impl Settings {
    /// Load settings and create a new `Settings` instance. `FLOE_*`
    /// environment variables override the file (nested keys use `__`).
    pub(crate) fn new(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let file: &str = config_file.unwrap_or("settings.toml");

        let s = Config::builder()
            .add_source(File::with_name(file))
            .add_source(Environment::with_prefix("FLOE").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}

fn parse_url(name: &'static str, raw: &str) -> anyhow::Result<Url> {
    Url::parse(raw).map_err(|e| anyhow::anyhow!("invalid URL for {name} (`{raw}`): {e}"))
}

/// Flat, documented environment overrides that don't follow the nested
/// `FLOE_section__key` convention.
fn flat_env_overrides(settings: &mut Settings) {
    if let Ok(v) = std::env::var("FLOE_NETWORK") {
        settings.network = v;
    }
    if let Ok(v) = std::env::var("FLOE_STREAM_MAX_RANGE_BYTES") {
        if let Ok(n) = v.parse() {
            settings.stream.max_range_bytes = Some(n);
        }
    }
    if let Ok(v) = std::env::var("FLOE_FILE_FIELDS_CACHE_TTL_MS") {
        if let Ok(n) = v.parse() {
            settings.stream.fields_cache_ttl_ms = Some(n);
        }
    }
    if let Ok(v) = std::env::var("FLOE_EXPOSE_BLOB_ID") {
        settings.stream.expose_blob_id = Some(v == "1" || v == "true");
    }
}

/// Validate loose settings into the strict runtime config.
pub fn gateway_config(mut settings: Settings) -> anyhow::Result<GatewayConfig> {
    flat_env_overrides(&mut settings);

    let network = Network::parse(&settings.network)?;

    let mut aggregator_urls = vec![parse_url("walrus.aggregator_url", &settings.walrus.aggregator_url)?];
    if let Some(fallbacks) = &settings.walrus.aggregator_fallbacks {
        for raw in fallbacks.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            aggregator_urls.push(parse_url("walrus.aggregator_fallbacks", raw)?);
        }
    }

    let upload_defaults = UploadConfig::default();
    let stream_defaults = StreamConfig::default();

    let upload = UploadConfig {
        tmp_dir: PathBuf::from(&settings.upload.tmp_dir),
        session_ttl: Duration::from_millis(settings.upload.session_ttl_ms),
        max_file_size: settings.upload.max_file_size_bytes,
        chunk_size_default: settings
            .upload
            .chunk_size_default_bytes
            .unwrap_or(upload_defaults.chunk_size_default)
            .clamp(upload_defaults.chunk_size_min, upload_defaults.chunk_size_max),
        max_active_uploads: settings.upload.max_active_uploads,
        epochs_default: settings.upload.epochs_default.clamp(1, upload_defaults.epochs_max),
        ..upload_defaults
    };

    Ok(GatewayConfig {
        network,
        listen_port: settings.listen_port,
        kv: KvConfig {
            url: settings.kv.url,
            key_prefix: settings.kv.key_prefix,
        },
        upload,
        finalize: FinalizeConfig {
            lock_ttl: Duration::from_millis(settings.finalize.lock_ttl_ms),
            lock_refresh: Duration::from_millis(settings.finalize.lock_refresh_ms),
        },
        walrus: WalrusConfig {
            publisher_url: parse_url("walrus.publisher_url", &settings.walrus.publisher_url)?,
            aggregator_urls,
            publish_timeout: Duration::from_millis(settings.walrus.publish_timeout_ms),
            publish_concurrency: settings.walrus.publish_concurrency,
            publish_interval_cap: settings.walrus.publish_interval_cap,
            publish_interval: Duration::from_millis(settings.walrus.publish_interval_ms),
            publish_max_retries: settings.walrus.max_retries,
            publish_retry_base_delay: Duration::from_millis(settings.walrus.retry_base_delay_ms),
        },
        sui: SuiConfig {
            registry_url: parse_url("sui.registry_url", &settings.sui.registry_url)?,
            secret: settings.sui.secret,
            min_balance: settings.sui.min_balance,
            owner_address: settings.sui.owner_address,
        },
        stream: StreamConfig {
            max_range_bytes: settings
                .stream
                .max_range_bytes
                .unwrap_or(stream_defaults.max_range_bytes),
            read_timeout: settings
                .stream
                .read_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(stream_defaults.read_timeout),
            fields_cache_ttl: settings
                .stream
                .fields_cache_ttl_ms
                .map(Duration::from_millis)
                .unwrap_or(stream_defaults.fields_cache_ttl),
            expose_blob_id: settings.stream.expose_blob_id.unwrap_or(false),
        },
        gc: GcConfig {
            reaper_interval: Duration::from_millis(settings.gc.reaper_interval_ms),
            grace: Duration::from_millis(settings.gc.grace_ms),
        },
    })
}
