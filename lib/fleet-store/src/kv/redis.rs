// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Redis-backed implementation of the store's command surface.
//!
//! Connections come from a bounded, lazily populated deadpool pool shared by
//! every store operation; a checked-out connection returns to the pool when
//! its handle drops. The compare-and-delete primitive is a server-side
//! script, so release-after-expiry can never delete another holder's lock.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use redis::Script;

use super::{KvBackend, KvConnection};
use crate::error::{StoreError, StoreResult};

const DEL_IF_EQ_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

/// Pooled Redis [`KvBackend`].
#[derive(Clone)]
pub struct RedisBackend {
    pool: Pool,
}

impl RedisBackend {
    /// Connect to `redis://host:port/db`.
    pub fn new(url: &str) -> StoreResult<Self> {
        let pool = PoolConfig::from_url(url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(StoreError::backend)?;
        Ok(Self { pool })
    }

    /// Use an externally configured pool (size, timeouts, TLS).
    pub fn from_pool(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl KvBackend for RedisBackend {
    async fn acquire(&self) -> StoreResult<Box<dyn KvConnection>> {
        let conn = self.pool.get().await.map_err(StoreError::backend)?;
        Ok(Box::new(RedisConnection {
            conn,
            del_if_eq: Script::new(DEL_IF_EQ_SCRIPT),
        }))
    }
}

struct RedisConnection {
    conn: deadpool_redis::Connection,
    del_if_eq: Script,
}

#[async_trait]
impl KvConnection for RedisConnection {
    async fn get(&mut self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let value: Option<Vec<u8>> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut self.conn)
            .await
            .map_err(StoreError::backend)?;
        Ok(value)
    }

    async fn set(&mut self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async(&mut self.conn)
            .await
            .map_err(StoreError::backend)?;
        Ok(())
    }

    async fn getset(&mut self, key: &[u8], value: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let prior: Option<Vec<u8>> = redis::cmd("GETSET")
            .arg(key)
            .arg(value)
            .query_async(&mut self.conn)
            .await
            .map_err(StoreError::backend)?;
        Ok(prior)
    }

    async fn set_nx_px(&mut self, key: &[u8], value: &[u8], ttl: Duration) -> StoreResult<bool> {
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut self.conn)
            .await
            .map_err(StoreError::backend)?;
        Ok(reply.is_some())
    }

    async fn del(&mut self, key: &[u8]) -> StoreResult<bool> {
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut self.conn)
            .await
            .map_err(StoreError::backend)?;
        Ok(removed > 0)
    }

    async fn del_if_eq(&mut self, key: &[u8], expected: &[u8]) -> StoreResult<bool> {
        let removed: i64 = self
            .del_if_eq
            .key(key)
            .arg(expected)
            .invoke_async(&mut self.conn)
            .await
            .map_err(StoreError::backend)?;
        Ok(removed > 0)
    }

    async fn exists(&mut self, key: &[u8]) -> StoreResult<bool> {
        let found: bool = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut self.conn)
            .await
            .map_err(StoreError::backend)?;
        Ok(found)
    }

    async fn mget(&mut self, keys: &[Vec<u8>]) -> StoreResult<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut cmd = redis::cmd("MGET");
        for key in keys {
            cmd.arg(key.as_slice());
        }
        let values: Vec<Option<Vec<u8>>> = cmd
            .query_async(&mut self.conn)
            .await
            .map_err(StoreError::backend)?;
        Ok(values)
    }

    async fn lpush(&mut self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        let _: () = redis::cmd("LPUSH")
            .arg(key)
            .arg(value)
            .query_async(&mut self.conn)
            .await
            .map_err(StoreError::backend)?;
        Ok(())
    }

    async fn lrange(&mut self, key: &[u8]) -> StoreResult<Vec<Vec<u8>>> {
        let items: Vec<Vec<u8>> = redis::cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .query_async(&mut self.conn)
            .await
            .map_err(StoreError::backend)?;
        Ok(items)
    }

    async fn lrem(&mut self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        let _: () = redis::cmd("LREM")
            .arg(key)
            .arg(0)
            .arg(value)
            .query_async(&mut self.conn)
            .await
            .map_err(StoreError::backend)?;
        Ok(())
    }

    async fn zadd(&mut self, key: &[u8], member: &[u8], score: f64) -> StoreResult<()> {
        let _: () = redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async(&mut self.conn)
            .await
            .map_err(StoreError::backend)?;
        Ok(())
    }

    async fn zrem(&mut self, key: &[u8], member: &[u8]) -> StoreResult<()> {
        let _: () = redis::cmd("ZREM")
            .arg(key)
            .arg(member)
            .query_async(&mut self.conn)
            .await
            .map_err(StoreError::backend)?;
        Ok(())
    }

    async fn zrangebyscore(
        &mut self,
        key: &[u8],
        max: f64,
        limit: usize,
    ) -> StoreResult<Vec<Vec<u8>>> {
        let members: Vec<Vec<u8>> = redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(max)
            .arg("LIMIT")
            .arg(0)
            .arg(limit as i64)
            .query_async(&mut self.conn)
            .await
            .map_err(StoreError::backend)?;
        Ok(members)
    }

    async fn scan(
        &mut self,
        cursor: u64,
        pattern: &[u8],
        count: usize,
    ) -> StoreResult<(u64, Vec<Vec<u8>>)> {
        let (next, keys): (u64, Vec<Vec<u8>>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count as i64)
            .query_async(&mut self.conn)
            .await
            .map_err(StoreError::backend)?;
        Ok((next, keys))
    }
}
