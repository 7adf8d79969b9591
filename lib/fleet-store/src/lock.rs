// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-endpoint advisory lock over the backing store.
//!
//! Mutations touching one endpoint span several keys, and several server
//! processes share the backing store, so exclusion has to live in the store
//! itself. Acquisition is a conditional set of a random token with a short
//! expiry; the expiry is the backstop if a holder dies before releasing.
//! Release is a compare-and-delete, so a holder that outlived its TTL cannot
//! delete the lock a successor now owns.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::kv::KvConnection;

/// Cumulative retry budget, as a multiple of the lock TTL.
const RETRY_BUDGET_FACTOR: u32 = 10;

/// Block until the lock at `key` is held; returns the token to release with.
///
/// Fails with [`StoreError::LockAcquisition`] once the retry budget
/// (10x the TTL) is exhausted.
pub(crate) async fn acquire(
    conn: &mut dyn KvConnection,
    key: &[u8],
    ttl: Duration,
) -> StoreResult<Vec<u8>> {
    let token = Uuid::new_v4().into_bytes().to_vec();
    let deadline = Instant::now() + ttl * RETRY_BUDGET_FACTOR;

    loop {
        if conn.set_nx_px(key, &token, ttl).await? {
            return Ok(token);
        }
        if Instant::now() >= deadline {
            return Err(StoreError::LockAcquisition {
                key: String::from_utf8_lossy(key).into_owned(),
            });
        }
        let backoff = rand::thread_rng().gen_range(10..=50);
        tokio::time::sleep(Duration::from_millis(backoff)).await;
    }
}

/// Release the lock at `key` iff `token` still holds it.
pub(crate) async fn release(
    conn: &mut dyn KvConnection,
    key: &[u8],
    token: &[u8],
) -> StoreResult<()> {
    conn.del_if_eq(key, token).await?;
    Ok(())
}
