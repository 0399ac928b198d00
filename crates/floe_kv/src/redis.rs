//! Redis backend over a multiplexed [`ConnectionManager`].

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::{KvError, KvOp, KvResult, KvStore};

pub struct RedisKv {
    prefix: String,
    manager: ConnectionManager,
}

impl RedisKv {
    /// Connect to the store at `url`. The manager reconnects on its own, so
    /// transient broker restarts surface as per-call errors, not a dead
    /// client.
    pub async fn connect(url: &str, prefix: &str) -> KvResult<Self> {
        let client = redis::Client::open(url).map_err(KvError::from)?;
        let manager = ConnectionManager::new(client).await.map_err(KvError::from)?;
        Ok(Self {
            prefix: prefix.to_string(),
            manager,
        })
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{suffix}", self.prefix)
    }

    fn apply_op(&self, pipe: &mut redis::Pipeline, op: &KvOp) {
        match op {
            KvOp::HSet { key, fields, ttl } => {
                let key = self.key(key);
                let mut cmd = redis::cmd("HSET");
                cmd.arg(&key);
                for (field, value) in fields {
                    cmd.arg(field).arg(value);
                }
                pipe.add_command(cmd);
                if let Some(ttl) = ttl {
                    pipe.cmd("PEXPIRE").arg(&key).arg(ttl.as_millis() as u64);
                }
            }
            KvOp::SetEx { key, value, ttl } => {
                pipe.cmd("SET")
                    .arg(self.key(key))
                    .arg(value)
                    .arg("PX")
                    .arg(ttl.as_millis() as u64);
            }
            KvOp::SAdd { key, member } => {
                pipe.cmd("SADD").arg(self.key(key)).arg(member);
            }
            KvOp::SRem { key, member } => {
                pipe.cmd("SREM").arg(self.key(key)).arg(member);
            }
            KvOp::Del { key } => {
                pipe.cmd("DEL").arg(self.key(key));
            }
        }
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn hset(&self, key: &str, fields: &[(String, String)]) -> KvResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("HSET");
        cmd.arg(self.key(key));
        for (field, value) in fields {
            cmd.arg(field).arg(value);
        }
        cmd.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn hset_with_ttl(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Duration,
    ) -> KvResult<()> {
        self.atomic(vec![KvOp::HSet {
            key: key.to_string(),
            fields: fields.to_vec(),
            ttl: Some(ttl),
        }])
        .await
    }

    async fn hgetall(&self, key: &str) -> KvResult<Vec<(String, String)>> {
        let mut conn = self.manager.clone();
        let entries: Vec<(String, String)> = conn.hgetall(self.key(key)).await?;
        Ok(entries)
    }

    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        let mut conn = self.manager.clone();
        let value: Option<String> = conn.get(self.key(key)).await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> KvResult<()> {
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(self.key(key))
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> KvResult<bool> {
        let mut conn = self.manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key(key))
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> KvResult<()> {
        let mut conn = self.manager.clone();
        redis::cmd("DEL")
            .arg(self.key(key))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<()> {
        let mut conn = self.manager.clone();
        redis::cmd("PEXPIRE")
            .arg(self.key(key))
            .arg(ttl.as_millis() as u64)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> KvResult<()> {
        let mut conn = self.manager.clone();
        conn.sadd::<_, _, ()>(self.key(key), member).await?;
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> KvResult<()> {
        let mut conn = self.manager.clone();
        conn.srem::<_, _, ()>(self.key(key), member).await?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> KvResult<Vec<String>> {
        let mut conn = self.manager.clone();
        let members: Vec<String> = conn.smembers(self.key(key)).await?;
        Ok(members)
    }

    async fn scard(&self, key: &str) -> KvResult<u64> {
        let mut conn = self.manager.clone();
        let count: u64 = conn.scard(self.key(key)).await?;
        Ok(count)
    }

    async fn sismember(&self, key: &str, member: &str) -> KvResult<bool> {
        let mut conn = self.manager.clone();
        let hit: bool = conn.sismember(self.key(key), member).await?;
        Ok(hit)
    }

    async fn atomic(&self, ops: Vec<KvOp>) -> KvResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut conn = self.manager.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in &ops {
            self.apply_op(&mut pipe, op);
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn ping(&self) -> KvResult<()> {
        let mut conn = self.manager.clone();
        redis::cmd("PING").query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}
