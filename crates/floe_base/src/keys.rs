//! Canonical KV keyspace layout.
//!
//! Every key the gateway touches is built here so the schema lives in one
//! place. The store-level prefix (`floe:v1`) is applied by the KV client;
//! these helpers produce the suffix after that prefix.

use uuid::Uuid;

/// Store-level namespace prepended to every key by the KV client.
pub const KEY_PREFIX: &str = "floe:v1";

/// Session hash for an in-progress upload. TTL: session TTL.
pub fn session_key(upload_id: &Uuid) -> String {
    format!("upload:{upload_id}:session")
}

/// Meta hash that outlives the session. TTL: session TTL + 30 min.
pub fn meta_key(upload_id: &Uuid) -> String {
    format!("upload:{upload_id}:meta")
}

/// Set of received chunk indices (decimal strings).
pub fn chunks_key(upload_id: &Uuid) -> String {
    format!("upload:{upload_id}:chunks")
}

/// Finalize lock string. Holds the owner's random token. TTL: lock TTL.
pub fn lock_key(upload_id: &Uuid) -> String {
    format!("upload:{upload_id}:meta:lock")
}

/// Process-wide set of upload IDs known to the lifecycle. The reaper only
/// ever considers members of this set.
pub fn gc_active_key() -> &'static str {
    "upload:gc:active"
}

/// Cached JSON snapshot of on-chain asset fields. TTL: fields cache TTL.
pub fn file_fields_key(file_id: &str) -> String {
    format!("file:{file_id}:fields")
}
