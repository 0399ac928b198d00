//! On-chain registry client.
//!
//! The gateway never assembles transactions itself; it talks to the registry
//! RPC bridge over a narrow surface: mint an asset object for a published
//! blob, read an asset object's fields, and check the signer account's
//! balance. Everything chain-specific stays behind [`Registry`].

use async_trait::async_trait;
use floe_base::model::AssetFields;
use thiserror::Error;

pub mod http;
pub mod signer;

pub use http::HttpRegistry;
pub use signer::SuiSigner;

pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Debug, Error)]
pub enum RegistryError {
    /// The registry endpoint could not be reached or answered 5xx.
    #[error("registry unavailable: {0}")]
    Unavailable(String),
    /// The registry answered, but the object payload cannot be normalized.
    #[error("invalid object data: {0}")]
    InvalidObject(String),
    #[error("object not found")]
    NotFound,
    #[error("registry rejected request: status {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Request to mint an immutable asset record for a published blob.
#[derive(Debug, Clone)]
pub struct MintRequest {
    pub blob_id: String,
    pub size_bytes: u64,
    pub mime: String,
    pub owner: Option<String>,
}

/// The minted object's on-chain identifier: the long-lived asset handle.
#[derive(Debug, Clone)]
pub struct MintedAsset {
    pub object_id: String,
}

#[async_trait]
pub trait Registry: Send + Sync {
    async fn mint_asset(&self, req: &MintRequest) -> RegistryResult<MintedAsset>;

    async fn get_asset_fields(&self, file_id: &str) -> RegistryResult<AssetFields>;

    /// Current balance of the signer account, in the registry's base unit.
    async fn check_balance(&self, address: &str) -> RegistryResult<u64>;
}
