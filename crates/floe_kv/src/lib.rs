//! Key-value store abstraction for the gateway.
//!
//! The control plane needs hashes (session/meta records), sets (received
//! chunks, GC index), plain strings with conditional SET (finalize lock,
//! fields cache), TTLs on everything, and all-or-nothing multi-operations
//! for the create/commit/purge transitions. [`KvStore`] is that contract;
//! [`redis::RedisKv`] is the production backend and [`memory::MemoryKv`]
//! backs the test suites.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub mod memory;
pub mod redis;

pub use memory::MemoryKv;
pub use redis::RedisKv;

pub type KvResult<T> = Result<T, KvError>;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("kv backend error: {0}")]
    Backend(String),
}

impl From<::redis::RedisError> for KvError {
    fn from(e: ::redis::RedisError) -> Self {
        Self::Backend(e.to_string())
    }
}

/// One step of an atomic multi-operation.
#[derive(Debug, Clone)]
pub enum KvOp {
    HSet {
        key: String,
        fields: Vec<(String, String)>,
        ttl: Option<Duration>,
    },
    SetEx {
        key: String,
        value: String,
        ttl: Duration,
    },
    SAdd {
        key: String,
        member: String,
    },
    SRem {
        key: String,
        member: String,
    },
    Del {
        key: String,
    },
}

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Set hash fields, leaving the key's TTL untouched.
    async fn hset(&self, key: &str, fields: &[(String, String)]) -> KvResult<()>;

    /// Set hash fields and (re)arm the key's TTL.
    async fn hset_with_ttl(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Duration,
    ) -> KvResult<()>;

    async fn hgetall(&self, key: &str) -> KvResult<Vec<(String, String)>>;

    async fn get(&self, key: &str) -> KvResult<Option<String>>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> KvResult<()>;

    /// Conditional SET: only writes if the key is absent. Returns whether
    /// the write happened. This is the finalize-lock primitive.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> KvResult<bool>;

    async fn del(&self, key: &str) -> KvResult<()>;

    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<()>;

    async fn sadd(&self, key: &str, member: &str) -> KvResult<()>;

    async fn srem(&self, key: &str, member: &str) -> KvResult<()>;

    async fn smembers(&self, key: &str) -> KvResult<Vec<String>>;

    async fn scard(&self, key: &str) -> KvResult<u64>;

    async fn sismember(&self, key: &str, member: &str) -> KvResult<bool>;

    /// Execute every operation or none of them.
    async fn atomic(&self, ops: Vec<KvOp>) -> KvResult<()>;

    /// Round-trip health probe.
    async fn ping(&self) -> KvResult<()>;
}
