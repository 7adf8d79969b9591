// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Backing key/value service abstraction.
//!
//! The store touches its backing service exclusively through these traits:
//! a [`KvBackend`] hands out pooled connections, and a [`KvConnection`]
//! exposes exactly the command surface the store consumes (strings, lists,
//! one sorted set, incremental scan, and the two conditional primitives the
//! peer lock is built on). Each command is atomic on the server side.
//!
//! [`memory::MemoryBackend`] is the in-process implementation used by tests
//! and single-node deployments; [`redis::RedisBackend`] is the shared,
//! networked one.

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreResult;

/// Connection source for the backing service.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Check a connection out of the pool.
    ///
    /// The connection is returned to the pool when the handle drops, on
    /// every exit path.
    async fn acquire(&self) -> StoreResult<Box<dyn KvConnection>>;
}

/// A checked-out connection to the backing service.
#[async_trait]
pub trait KvConnection: Send {
    async fn get(&mut self, key: &[u8]) -> StoreResult<Option<Vec<u8>>>;

    async fn set(&mut self, key: &[u8], value: &[u8]) -> StoreResult<()>;

    /// Atomically write `value` and return the prior value.
    async fn getset(&mut self, key: &[u8], value: &[u8]) -> StoreResult<Option<Vec<u8>>>;

    /// Set `key` only if absent, with a server-side expiry. Returns whether
    /// the write happened.
    async fn set_nx_px(&mut self, key: &[u8], value: &[u8], ttl: Duration) -> StoreResult<bool>;

    /// Delete `key`, reporting whether it existed.
    async fn del(&mut self, key: &[u8]) -> StoreResult<bool>;

    /// Atomically delete `key` only if it currently holds `expected`.
    async fn del_if_eq(&mut self, key: &[u8], expected: &[u8]) -> StoreResult<bool>;

    async fn exists(&mut self, key: &[u8]) -> StoreResult<bool>;

    /// Fetch several keys in one round trip; absent keys yield `None`.
    async fn mget(&mut self, keys: &[Vec<u8>]) -> StoreResult<Vec<Option<Vec<u8>>>>;

    async fn lpush(&mut self, key: &[u8], value: &[u8]) -> StoreResult<()>;

    /// The full list, head first.
    async fn lrange(&mut self, key: &[u8]) -> StoreResult<Vec<Vec<u8>>>;

    /// Remove every occurrence of `value` from the list.
    async fn lrem(&mut self, key: &[u8], value: &[u8]) -> StoreResult<()>;

    async fn zadd(&mut self, key: &[u8], member: &[u8], score: f64) -> StoreResult<()>;

    async fn zrem(&mut self, key: &[u8], member: &[u8]) -> StoreResult<()>;

    /// Members with score in `(-inf, max]`, ascending, at most `limit`.
    async fn zrangebyscore(&mut self, key: &[u8], max: f64, limit: usize)
        -> StoreResult<Vec<Vec<u8>>>;

    /// One page of an incremental keyspace scan. Returns the next cursor
    /// (0 when the iteration is complete) and the matching keys of this
    /// page, which may be empty on a non-final page.
    async fn scan(
        &mut self,
        cursor: u64,
        pattern: &[u8],
        count: usize,
    ) -> StoreResult<(u64, Vec<Vec<u8>>)>;
}
