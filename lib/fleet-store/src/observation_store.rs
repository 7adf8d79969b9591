// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Observation CRUD over the backing store.
//!
//! Two surfaces share the same storage. The upper surface serves the
//! protocol handlers and speaks registration ids and domain observations.
//! The lower surface serves the transport layer as it manages long-lived
//! message tokens: it speaks raw tokens and stores the transport record
//! verbatim, interpreting nothing beyond the owning registration id and
//! endpoint. The transport layer inserts records via `put`; the upper
//! surface's `add_observation` only prunes superseded observations on the
//! same (registration, path).

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::warn;

use crate::codec;
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::keys;
use crate::kv::{KvBackend, KvConnection};
use crate::lock;
use crate::observation::{Observation, ObservationRecord, Token};

/// Store of observations indexed by token and grouped by registration.
#[derive(Clone)]
pub struct ObservationStore {
    kv: Arc<dyn KvBackend>,
    config: StoreConfig,
}

impl ObservationStore {
    pub fn new(kv: Arc<dyn KvBackend>, config: StoreConfig) -> Self {
        Self { kv, config }
    }

    /* *************** upper surface (protocol handlers) **************** */

    /// Cancel observations superseded by `record`: any stored observation of
    /// the same registration on the same path under a different token.
    ///
    /// Returns the evicted set. The record itself is not inserted here; the
    /// transport layer has already done so via [`put`](Self::put) when it
    /// registered the message token.
    pub async fn add_observation(
        &self,
        registration_id: &str,
        record: &ObservationRecord,
    ) -> StoreResult<Vec<Observation>> {
        let mut conn = self.kv.acquire().await?;
        let endpoint = self
            .require_endpoint(&mut *conn, registration_id)
            .await?;

        let lock_key = keys::lock_key(&endpoint);
        let token = lock::acquire(&mut *conn, &lock_key, self.config.lock_acquire_timeout).await?;

        let result: StoreResult<Vec<Observation>> = async {
            let mut removed = Vec::new();
            for stored in read_all_records(&mut *conn, registration_id).await? {
                if stored.path == record.path && stored.token != record.token {
                    remove_one(&mut *conn, registration_id, stored.token.as_bytes()).await?;
                    removed.push(stored.build());
                }
            }
            Ok(removed)
        }
        .await;
        let released = lock::release(&mut *conn, &lock_key, &token).await;

        let removed = result?;
        released?;
        Ok(removed)
    }

    /// Remove one observation, iff it belongs to `registration_id`.
    ///
    /// The ownership guard protects against a token reused by another
    /// registration since the caller looked it up.
    pub async fn remove_observation(
        &self,
        registration_id: &str,
        token: &Token,
    ) -> StoreResult<Option<Observation>> {
        let mut conn = self.kv.acquire().await?;
        let Some(endpoint) = resolve_endpoint(&mut *conn, registration_id).await? else {
            return Ok(None);
        };

        let lock_key = keys::lock_key(&endpoint);
        let lock_token =
            lock::acquire(&mut *conn, &lock_key, self.config.lock_acquire_timeout).await?;

        let result: StoreResult<Option<Observation>> = async {
            let Some(stored) = read_record(&mut *conn, token.as_bytes()).await? else {
                return Ok(None);
            };
            if stored.registration_id != registration_id {
                return Ok(None);
            }
            remove_one(&mut *conn, registration_id, token.as_bytes()).await?;
            Ok(Some(stored.build()))
        }
        .await;
        let released = lock::release(&mut *conn, &lock_key, &lock_token).await;

        let removed = result?;
        released?;
        Ok(removed)
    }

    /// Read one observation of `registration_id`, or `None` when the token
    /// is unknown or owned by another registration.
    pub async fn get_observation(
        &self,
        registration_id: &str,
        token: &Token,
    ) -> StoreResult<Option<Observation>> {
        let mut conn = self.kv.acquire().await?;
        Ok(read_record(&mut *conn, token.as_bytes())
            .await?
            .filter(|stored| stored.registration_id == registration_id)
            .map(|stored| stored.build()))
    }

    /// All observations of a registration.
    pub async fn get_observations(&self, registration_id: &str) -> StoreResult<Vec<Observation>> {
        let mut conn = self.kv.acquire().await?;
        Ok(read_all_records(&mut *conn, registration_id)
            .await?
            .iter()
            .map(ObservationRecord::build)
            .collect())
    }

    /// Remove every observation of a registration.
    pub async fn remove_observations(&self, registration_id: &str) -> StoreResult<Vec<Observation>> {
        let mut conn = self.kv.acquire().await?;
        let Some(endpoint) = resolve_endpoint(&mut *conn, registration_id).await? else {
            return Ok(Vec::new());
        };

        let lock_key = keys::lock_key(&endpoint);
        let token = lock::acquire(&mut *conn, &lock_key, self.config.lock_acquire_timeout).await?;

        let result = remove_all_for(&mut *conn, registration_id).await;
        let released = lock::release(&mut *conn, &lock_key, &token).await;

        let removed = result?;
        released?;
        Ok(removed)
    }

    /* *************** lower surface (transport layer) **************** */

    /// Store a record under its token, overwriting any prior one.
    ///
    /// Returns the replaced record. A collision is logged: tokens are meant
    /// to be unique across the server while in use.
    pub async fn put(&self, record: &ObservationRecord) -> StoreResult<Option<ObservationRecord>> {
        self.insert(record, false).await
    }

    /// Store a record under its token unless one exists; the existing record
    /// is returned untouched on collision.
    pub async fn put_if_absent(
        &self,
        record: &ObservationRecord,
    ) -> StoreResult<Option<ObservationRecord>> {
        self.insert(record, true).await
    }

    async fn insert(
        &self,
        record: &ObservationRecord,
        if_absent: bool,
    ) -> StoreResult<Option<ObservationRecord>> {
        let mut conn = self.kv.acquire().await?;
        let lock_key = keys::lock_key(&record.endpoint);
        let token = lock::acquire(&mut *conn, &lock_key, self.config.lock_acquire_timeout).await?;

        let result = self.insert_locked(&mut *conn, record, if_absent).await;
        let released = lock::release(&mut *conn, &lock_key, &token).await;

        let prior = result?;
        released?;
        Ok(prior)
    }

    async fn insert_locked(
        &self,
        conn: &mut dyn KvConnection,
        record: &ObservationRecord,
        if_absent: bool,
    ) -> StoreResult<Option<ObservationRecord>> {
        if !conn
            .exists(&keys::registration_id_key(&record.registration_id))
            .await?
        {
            return Err(StoreError::NoSuchRegistration {
                registration_id: record.registration_id.clone(),
            });
        }

        let observation_key = keys::observation_key(record.token.as_bytes());
        let encoded = codec::encode_observation(record)?;

        let prior = if if_absent {
            // a row that no longer decodes counts as absent and is replaced
            match conn.get(&observation_key).await?.as_deref().and_then(codec::decode_observation) {
                Some(existing) => return Ok(Some(existing)),
                None => {
                    conn.set(&observation_key, &encoded).await?;
                    None
                }
            }
        } else {
            conn.getset(&observation_key, &encoded)
                .await?
                .as_deref()
                .and_then(codec::decode_observation)
        };

        if let Some(prior) = &prior {
            // heal the stale index entry a cross-registration collision
            // would otherwise leave behind
            if prior.registration_id != record.registration_id {
                conn.lrem(
                    &keys::token_list_key(&prior.registration_id),
                    prior.token.as_bytes(),
                )
                .await?;
            }
            warn!(
                token = %record.token,
                previous_registration = %prior.registration_id,
                registration = %record.registration_id,
                "Token collision? prior observation replaced"
            );
        }
        // keep the per-registration list duplicate-free across overwrites
        conn.lrem(
            &keys::token_list_key(&record.registration_id),
            record.token.as_bytes(),
        )
        .await?;
        conn.lpush(
            &keys::token_list_key(&record.registration_id),
            record.token.as_bytes(),
        )
        .await?;

        Ok(prior)
    }

    /// Read a record by raw token. No lock.
    pub async fn get(&self, token: &Token) -> StoreResult<Option<ObservationRecord>> {
        let mut conn = self.kv.acquire().await?;
        read_record(&mut *conn, token.as_bytes()).await
    }

    /// Delete a record by raw token, along with its index entry.
    ///
    /// The owning registration and endpoint are resolved from the stored
    /// record itself; an unknown token is a no-op.
    pub async fn remove(&self, token: &Token) -> StoreResult<()> {
        let mut conn = self.kv.acquire().await?;
        let Some(stored) = read_record(&mut *conn, token.as_bytes()).await? else {
            return Ok(());
        };

        let lock_key = keys::lock_key(&stored.endpoint);
        let lock_token =
            lock::acquire(&mut *conn, &lock_key, self.config.lock_acquire_timeout).await?;

        let result = remove_one(&mut *conn, &stored.registration_id, token.as_bytes()).await;
        let released = lock::release(&mut *conn, &lock_key, &lock_token).await;

        result?;
        released?;
        Ok(())
    }

    /// Replace the transport correlation context of a stored observation.
    ///
    /// Keeps notification delivery working when a secure peer's address
    /// rebinds. Unknown tokens are a no-op.
    pub async fn set_context(
        &self,
        token: &Token,
        context: BTreeMap<String, String>,
    ) -> StoreResult<()> {
        let mut conn = self.kv.acquire().await?;
        let Some(stored) = read_record(&mut *conn, token.as_bytes()).await? else {
            return Ok(());
        };

        let lock_key = keys::lock_key(&stored.endpoint);
        let lock_token =
            lock::acquire(&mut *conn, &lock_key, self.config.lock_acquire_timeout).await?;

        let result: StoreResult<()> = async {
            // reload under the lock; the record may have moved meanwhile
            let Some(mut stored) = read_record(&mut *conn, token.as_bytes()).await? else {
                return Ok(());
            };
            stored.context = context;
            let encoded = codec::encode_observation(&stored)?;
            conn.set(&keys::observation_key(token.as_bytes()), &encoded)
                .await
        }
        .await;
        let released = lock::release(&mut *conn, &lock_key, &lock_token).await;

        result?;
        released?;
        Ok(())
    }

    async fn require_endpoint(
        &self,
        conn: &mut dyn KvConnection,
        registration_id: &str,
    ) -> StoreResult<String> {
        resolve_endpoint(conn, registration_id)
            .await?
            .ok_or_else(|| StoreError::NoSuchRegistration {
                registration_id: registration_id.to_string(),
            })
    }
}

async fn resolve_endpoint(
    conn: &mut dyn KvConnection,
    registration_id: &str,
) -> StoreResult<Option<String>> {
    let Some(bytes) = conn.get(&keys::registration_id_key(registration_id)).await? else {
        return Ok(None);
    };
    Ok(keys::endpoint_from_bytes(bytes))
}

async fn read_record(
    conn: &mut dyn KvConnection,
    token: &[u8],
) -> StoreResult<Option<ObservationRecord>> {
    let Some(data) = conn.get(&keys::observation_key(token)).await? else {
        return Ok(None);
    };
    Ok(codec::decode_observation(&data))
}

async fn read_all_records(
    conn: &mut dyn KvConnection,
    registration_id: &str,
) -> StoreResult<Vec<ObservationRecord>> {
    let tokens = conn.lrange(&keys::token_list_key(registration_id)).await?;
    let mut records = Vec::with_capacity(tokens.len());
    for token in tokens {
        if let Some(record) = read_record(conn, &token).await? {
            records.push(record);
        }
    }
    Ok(records)
}

/// Delete one observation and its list entry. Caller holds the peer lock.
async fn remove_one(
    conn: &mut dyn KvConnection,
    registration_id: &str,
    token: &[u8],
) -> StoreResult<()> {
    if conn.del(&keys::observation_key(token)).await? {
        conn.lrem(&keys::token_list_key(registration_id), token)
            .await?;
    }
    Ok(())
}

/// Delete every observation of a registration, returning the removed set.
/// Caller holds the peer lock (or is removing the registration itself).
pub(crate) async fn remove_all_for(
    conn: &mut dyn KvConnection,
    registration_id: &str,
) -> StoreResult<Vec<Observation>> {
    let list_key = keys::token_list_key(registration_id);
    let mut removed = Vec::new();
    for token in conn.lrange(&list_key).await? {
        if let Some(record) = read_record(conn, &token).await? {
            removed.push(record.build());
        }
        conn.del(&keys::observation_key(&token)).await?;
    }
    conn.del(&list_key).await?;
    Ok(removed)
}
