// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-process backing store.
//!
//! Implements the full [`KvConnection`] command surface over process-local
//! maps. Suitable for tests and single-node deployments; expiry is honored
//! lazily on access, and the scan cursor is an index into the sorted key
//! set, so concurrent writers can cause the same duplicates or skips a
//! networked non-snapshot cursor would.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{KvBackend, KvConnection};
use crate::error::StoreResult;

struct StringEntry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StringEntry {
    fn live(&self) -> bool {
        self.expires_at.map(|at| Instant::now() < at).unwrap_or(true)
    }
}

#[derive(Default)]
struct MemoryState {
    strings: HashMap<Vec<u8>, StringEntry>,
    lists: HashMap<Vec<u8>, Vec<Vec<u8>>>,
    zsets: HashMap<Vec<u8>, HashMap<Vec<u8>, f64>>,
}

impl MemoryState {
    fn get_live(&self, key: &[u8]) -> Option<&StringEntry> {
        self.strings.get(key).filter(|entry| entry.live())
    }
}

/// In-process [`KvBackend`].
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn acquire(&self) -> StoreResult<Box<dyn KvConnection>> {
        Ok(Box::new(MemoryConnection {
            state: Arc::clone(&self.state),
        }))
    }
}

struct MemoryConnection {
    state: Arc<Mutex<MemoryState>>,
}

fn matches(pattern: &[u8], key: &[u8]) -> bool {
    match pattern.split_last() {
        Some((b'*', prefix)) => key.starts_with(prefix),
        _ => key == pattern,
    }
}

#[async_trait]
impl KvConnection for MemoryConnection {
    async fn get(&mut self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let state = self.state.lock();
        Ok(state.get_live(key).map(|entry| entry.value.clone()))
    }

    async fn set(&mut self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        let mut state = self.state.lock();
        state.strings.insert(
            key.to_vec(),
            StringEntry {
                value: value.to_vec(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn getset(&mut self, key: &[u8], value: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let mut state = self.state.lock();
        let prior = state.get_live(key).map(|entry| entry.value.clone());
        state.strings.insert(
            key.to_vec(),
            StringEntry {
                value: value.to_vec(),
                expires_at: None,
            },
        );
        Ok(prior)
    }

    async fn set_nx_px(&mut self, key: &[u8], value: &[u8], ttl: Duration) -> StoreResult<bool> {
        let mut state = self.state.lock();
        if state.get_live(key).is_some() {
            return Ok(false);
        }
        state.strings.insert(
            key.to_vec(),
            StringEntry {
                value: value.to_vec(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn del(&mut self, key: &[u8]) -> StoreResult<bool> {
        let mut state = self.state.lock();
        let existed = state.get_live(key).is_some();
        state.strings.remove(key);
        Ok(existed)
    }

    async fn del_if_eq(&mut self, key: &[u8], expected: &[u8]) -> StoreResult<bool> {
        let mut state = self.state.lock();
        let held = state
            .get_live(key)
            .map(|entry| entry.value == expected)
            .unwrap_or(false);
        if held {
            state.strings.remove(key);
        }
        Ok(held)
    }

    async fn exists(&mut self, key: &[u8]) -> StoreResult<bool> {
        let state = self.state.lock();
        Ok(state.get_live(key).is_some())
    }

    async fn mget(&mut self, keys: &[Vec<u8>]) -> StoreResult<Vec<Option<Vec<u8>>>> {
        let state = self.state.lock();
        Ok(keys
            .iter()
            .map(|key| state.get_live(key).map(|entry| entry.value.clone()))
            .collect())
    }

    async fn lpush(&mut self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        let mut state = self.state.lock();
        state
            .lists
            .entry(key.to_vec())
            .or_default()
            .insert(0, value.to_vec());
        Ok(())
    }

    async fn lrange(&mut self, key: &[u8]) -> StoreResult<Vec<Vec<u8>>> {
        let state = self.state.lock();
        Ok(state.lists.get(key).cloned().unwrap_or_default())
    }

    async fn lrem(&mut self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        let mut state = self.state.lock();
        if let Some(list) = state.lists.get_mut(key) {
            list.retain(|item| item != value);
            if list.is_empty() {
                state.lists.remove(key);
            }
        }
        Ok(())
    }

    async fn zadd(&mut self, key: &[u8], member: &[u8], score: f64) -> StoreResult<()> {
        let mut state = self.state.lock();
        state
            .zsets
            .entry(key.to_vec())
            .or_default()
            .insert(member.to_vec(), score);
        Ok(())
    }

    async fn zrem(&mut self, key: &[u8], member: &[u8]) -> StoreResult<()> {
        let mut state = self.state.lock();
        if let Some(zset) = state.zsets.get_mut(key) {
            zset.remove(member);
            if zset.is_empty() {
                state.zsets.remove(key);
            }
        }
        Ok(())
    }

    async fn zrangebyscore(
        &mut self,
        key: &[u8],
        max: f64,
        limit: usize,
    ) -> StoreResult<Vec<Vec<u8>>> {
        let state = self.state.lock();
        let Some(zset) = state.zsets.get(key) else {
            return Ok(Vec::new());
        };
        let mut in_range: Vec<(&Vec<u8>, f64)> = zset
            .iter()
            .filter(|(_, score)| **score <= max)
            .map(|(member, score)| (member, *score))
            .collect();
        in_range.sort_by(|(ma, sa), (mb, sb)| {
            sa.partial_cmp(sb)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| ma.cmp(mb))
        });
        Ok(in_range
            .into_iter()
            .take(limit)
            .map(|(member, _)| member.clone())
            .collect())
    }

    async fn scan(
        &mut self,
        cursor: u64,
        pattern: &[u8],
        count: usize,
    ) -> StoreResult<(u64, Vec<Vec<u8>>)> {
        let state = self.state.lock();
        let mut keys: Vec<&Vec<u8>> = state
            .strings
            .iter()
            .filter(|(key, entry)| entry.live() && matches(pattern, key))
            .map(|(key, _)| key)
            .collect();
        keys.sort();

        let start = cursor as usize;
        if start >= keys.len() {
            return Ok((0, Vec::new()));
        }
        let page: Vec<Vec<u8>> = keys[start..]
            .iter()
            .take(count.max(1))
            .map(|key| (*key).clone())
            .collect();
        let next = start + page.len();
        let next_cursor = if next >= keys.len() { 0 } else { next as u64 };
        Ok((next_cursor, page))
    }
}
