//! In-memory backend used by the test suites.
//!
//! Behaves like the Redis backend for the operations the gateway uses:
//! NX semantics, per-key TTLs (checked lazily against the tokio clock so
//! paused-time tests can drive expiry), and multi-ops applied under a single
//! lock so they are observably atomic.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::{KvOp, KvResult, KvStore};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        match self.expires_at {
            Some(deadline) => Instant::now() < deadline,
            None => true,
        }
    }
}

#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

fn live_entry<'a>(map: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
    drop_if_expired(map, key);
    map.get_mut(key)
}

fn drop_if_expired(map: &mut HashMap<String, Entry>, key: &str) {
    if map.get(key).is_some_and(|e| !e.live()) {
        map.remove(key);
    }
}

fn apply_op(map: &mut HashMap<String, Entry>, op: &KvOp) {
    match op {
        KvOp::HSet { key, fields, ttl } => {
            drop_if_expired(map, key);
            let entry = map.entry(key.clone()).or_insert_with(|| Entry {
                value: Value::Hash(HashMap::new()),
                expires_at: None,
            });
            if let Value::Hash(hash) = &mut entry.value {
                for (f, v) in fields {
                    hash.insert(f.clone(), v.clone());
                }
            }
            if let Some(ttl) = ttl {
                entry.expires_at = Some(Instant::now() + *ttl);
            }
        }
        KvOp::SetEx { key, value, ttl } => {
            map.insert(
                key.clone(),
                Entry {
                    value: Value::Str(value.clone()),
                    expires_at: Some(Instant::now() + *ttl),
                },
            );
        }
        KvOp::SAdd { key, member } => {
            drop_if_expired(map, key);
            let entry = map.entry(key.clone()).or_insert_with(|| Entry {
                value: Value::Set(HashSet::new()),
                expires_at: None,
            });
            if let Value::Set(set) = &mut entry.value {
                set.insert(member.clone());
            }
        }
        KvOp::SRem { key, member } => {
            if let Some(e) = live_entry(map, key) {
                if let Value::Set(set) = &mut e.value {
                    set.remove(member);
                }
            }
        }
        KvOp::Del { key } => {
            map.remove(key);
        }
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn hset(&self, key: &str, fields: &[(String, String)]) -> KvResult<()> {
        let mut map = self.entries.lock().await;
        apply_op(
            &mut map,
            &KvOp::HSet {
                key: key.to_string(),
                fields: fields.to_vec(),
                ttl: None,
            },
        );
        Ok(())
    }

    async fn hset_with_ttl(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Duration,
    ) -> KvResult<()> {
        let mut map = self.entries.lock().await;
        apply_op(
            &mut map,
            &KvOp::HSet {
                key: key.to_string(),
                fields: fields.to_vec(),
                ttl: Some(ttl),
            },
        );
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> KvResult<Vec<(String, String)>> {
        let mut map = self.entries.lock().await;
        let Some(entry) = live_entry(&mut map, key) else {
            return Ok(Vec::new());
        };
        match &entry.value {
            Value::Hash(hash) => Ok(hash.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
            _ => Ok(Vec::new()),
        }
    }

    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        let mut map = self.entries.lock().await;
        let Some(entry) = live_entry(&mut map, key) else {
            return Ok(None);
        };
        match &entry.value {
            Value::Str(s) => Ok(Some(s.clone())),
            _ => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> KvResult<()> {
        let mut map = self.entries.lock().await;
        apply_op(
            &mut map,
            &KvOp::SetEx {
                key: key.to_string(),
                value: value.to_string(),
                ttl,
            },
        );
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> KvResult<bool> {
        let mut map = self.entries.lock().await;
        if live_entry(&mut map, key).is_some() {
            return Ok(false);
        }
        map.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> KvResult<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<()> {
        let mut map = self.entries.lock().await;
        if let Some(entry) = live_entry(&mut map, key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> KvResult<()> {
        let mut map = self.entries.lock().await;
        apply_op(
            &mut map,
            &KvOp::SAdd {
                key: key.to_string(),
                member: member.to_string(),
            },
        );
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> KvResult<()> {
        let mut map = self.entries.lock().await;
        apply_op(
            &mut map,
            &KvOp::SRem {
                key: key.to_string(),
                member: member.to_string(),
            },
        );
        Ok(())
    }

    async fn smembers(&self, key: &str) -> KvResult<Vec<String>> {
        let mut map = self.entries.lock().await;
        let Some(entry) = live_entry(&mut map, key) else {
            return Ok(Vec::new());
        };
        match &entry.value {
            Value::Set(set) => Ok(set.iter().cloned().collect()),
            _ => Ok(Vec::new()),
        }
    }

    async fn scard(&self, key: &str) -> KvResult<u64> {
        Ok(self.smembers(key).await?.len() as u64)
    }

    async fn sismember(&self, key: &str, member: &str) -> KvResult<bool> {
        Ok(self.smembers(key).await?.iter().any(|m| m == member))
    }

    async fn atomic(&self, ops: Vec<KvOp>) -> KvResult<()> {
        let mut map = self.entries.lock().await;
        for op in &ops {
            apply_op(&mut map, op);
        }
        Ok(())
    }

    async fn ping(&self) -> KvResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_set_and_get() {
        let kv = MemoryKv::new();
        kv.hset("h", &[("a".into(), "1".into()), ("b".into(), "2".into())])
            .await
            .unwrap();
        let mut fields = kv.hgetall("h").await.unwrap();
        fields.sort();
        assert_eq!(
            fields,
            vec![("a".into(), "1".into()), ("b".into(), "2".into())]
        );
    }

    #[tokio::test]
    async fn set_nx_respects_existing_key() {
        let kv = MemoryKv::new();
        assert!(kv
            .set_nx_ex("lock", "tok-1", Duration::from_secs(60))
            .await
            .unwrap());
        assert!(!kv
            .set_nx_ex("lock", "tok-2", Duration::from_secs(60))
            .await
            .unwrap());
        assert_eq!(kv.get("lock").await.unwrap().as_deref(), Some("tok-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expiry_frees_the_key() {
        let kv = MemoryKv::new();
        kv.set_ex("k", "v", Duration::from_secs(10)).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
        assert!(kv
            .set_nx_ex("k", "fresh", Duration::from_secs(10))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn sets_behave_like_sets() {
        let kv = MemoryKv::new();
        kv.sadd("s", "0").await.unwrap();
        kv.sadd("s", "1").await.unwrap();
        kv.sadd("s", "1").await.unwrap();
        assert_eq!(kv.scard("s").await.unwrap(), 2);
        assert!(kv.sismember("s", "1").await.unwrap());
        kv.srem("s", "1").await.unwrap();
        assert!(!kv.sismember("s", "1").await.unwrap());
    }

    #[tokio::test]
    async fn atomic_applies_every_op() {
        let kv = MemoryKv::new();
        kv.sadd("gc", "id-1").await.unwrap();
        kv.atomic(vec![
            KvOp::HSet {
                key: "meta".into(),
                fields: vec![("status".into(), "completed".into())],
                ttl: None,
            },
            KvOp::Del { key: "sess".into() },
            KvOp::SRem {
                key: "gc".into(),
                member: "id-1".into(),
            },
        ])
        .await
        .unwrap();
        assert_eq!(
            kv.hgetall("meta").await.unwrap(),
            vec![("status".into(), "completed".into())]
        );
        assert_eq!(kv.scard("gc").await.unwrap(), 0);
    }
}
