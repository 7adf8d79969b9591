// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Registration CRUD over the backing store.
//!
//! The primary record lives at the endpoint key; the registration-id index,
//! the address index, and the expiration queue are maintained alongside it.
//! All mutations for one endpoint run under the peer lock, so cooperating
//! server processes see each operation atomically. Lookups take no lock:
//! records are replaced wholesale, so a reader sees the pre- or post-state,
//! never a torn row.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::codec;
use crate::config::StoreConfig;
use crate::error::StoreResult;
use crate::keys;
use crate::kv::{KvBackend, KvConnection};
use crate::lock;
use crate::observation_store;
use crate::registration::{Deregistration, Registration, RegistrationUpdate, UpdatedRegistration};

/// Store of device registrations with their secondary indexes.
#[derive(Clone)]
pub struct RegistrationStore {
    kv: Arc<dyn KvBackend>,
    config: StoreConfig,
}

impl RegistrationStore {
    pub fn new(kv: Arc<dyn KvBackend>, config: StoreConfig) -> Self {
        Self { kv, config }
    }

    pub(crate) fn backend(&self) -> &Arc<dyn KvBackend> {
        &self.kv
    }

    pub(crate) fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Write a registration, replacing any prior one at the same endpoint.
    ///
    /// Returns the replaced registration and the observations removed with
    /// it, or `None` when the endpoint was new.
    pub async fn add(&self, registration: &Registration) -> StoreResult<Option<Deregistration>> {
        let mut conn = self.kv.acquire().await?;
        let lock_key = keys::lock_key(&registration.endpoint);
        let token = lock::acquire(&mut *conn, &lock_key, self.config.lock_acquire_timeout).await?;

        let result = self.add_locked(&mut *conn, registration).await;
        let released = lock::release(&mut *conn, &lock_key, &token).await;

        let deregistration = result?;
        released?;
        Ok(deregistration)
    }

    async fn add_locked(
        &self,
        conn: &mut dyn KvConnection,
        registration: &Registration,
    ) -> StoreResult<Option<Deregistration>> {
        let encoded = codec::encode_registration(registration)?;
        let prior = conn
            .getset(&keys::endpoint_key(&registration.endpoint), &encoded)
            .await?;

        conn.set(
            &keys::registration_id_key(&registration.id),
            registration.endpoint.as_bytes(),
        )
        .await?;
        conn.set(
            &keys::address_key(&registration.address),
            registration.endpoint.as_bytes(),
        )
        .await?;
        self.upsert_expiration(conn, registration).await?;

        let Some(prior) = prior else {
            return Ok(None);
        };
        let Some(prior) = codec::decode_registration(&prior) else {
            // corrupt prior row: nothing left to clean up from it
            return Ok(None);
        };

        if prior.id != registration.id {
            conn.del(&keys::registration_id_key(&prior.id)).await?;
        }
        if prior.address != registration.address {
            self.remove_address_index(conn, &prior).await?;
        }
        let observations = observation_store::remove_all_for(conn, &prior.id).await?;

        Ok(Some(Deregistration {
            registration: prior,
            observations,
        }))
    }

    /// Apply an update patch to the registration the patch names.
    ///
    /// Returns `None` when the registration id is unknown or the record
    /// vanished between index resolution and the locked reload.
    pub async fn update(
        &self,
        update: &RegistrationUpdate,
    ) -> StoreResult<Option<UpdatedRegistration>> {
        let mut conn = self.kv.acquire().await?;

        let Some(endpoint) = self
            .resolve_endpoint(&mut *conn, &update.registration_id)
            .await?
        else {
            return Ok(None);
        };

        let lock_key = keys::lock_key(&endpoint);
        let token = lock::acquire(&mut *conn, &lock_key, self.config.lock_acquire_timeout).await?;

        let result = self.update_locked(&mut *conn, &endpoint, update).await;
        let released = lock::release(&mut *conn, &lock_key, &token).await;

        let updated = result?;
        released?;
        Ok(updated)
    }

    async fn update_locked(
        &self,
        conn: &mut dyn KvConnection,
        endpoint: &str,
        update: &RegistrationUpdate,
    ) -> StoreResult<Option<UpdatedRegistration>> {
        let Some(data) = conn.get(&keys::endpoint_key(endpoint)).await? else {
            return Ok(None);
        };
        let Some(current) = codec::decode_registration(&data) else {
            return Ok(None);
        };

        let updated = update.apply(&current);
        let encoded = codec::encode_registration(&updated)?;
        conn.set(&keys::endpoint_key(&updated.endpoint), &encoded)
            .await?;
        self.upsert_expiration(conn, &updated).await?;

        // newest binding wins: write ours, then drop the old one only if it
        // still names this endpoint
        conn.set(
            &keys::address_key(&updated.address),
            updated.endpoint.as_bytes(),
        )
        .await?;
        if current.address != updated.address {
            self.remove_address_index(conn, &current).await?;
        }

        Ok(Some(UpdatedRegistration {
            previous: current,
            updated,
        }))
    }

    /// Look up a registration by its server-assigned id.
    pub async fn get(&self, registration_id: &str) -> StoreResult<Option<Registration>> {
        let mut conn = self.kv.acquire().await?;
        self.get_with(&mut *conn, registration_id).await
    }

    pub(crate) async fn get_with(
        &self,
        conn: &mut dyn KvConnection,
        registration_id: &str,
    ) -> StoreResult<Option<Registration>> {
        let Some(endpoint) = conn.get(&keys::registration_id_key(registration_id)).await? else {
            return Ok(None);
        };
        let Some(data) = conn.get(&keys::endpoint_key_raw(&endpoint)).await? else {
            return Ok(None);
        };
        Ok(codec::decode_registration(&data))
    }

    /// Look up a registration by its endpoint name.
    pub async fn get_by_endpoint(&self, endpoint: &str) -> StoreResult<Option<Registration>> {
        let mut conn = self.kv.acquire().await?;
        let Some(data) = conn.get(&keys::endpoint_key(endpoint)).await? else {
            return Ok(None);
        };
        Ok(codec::decode_registration(&data))
    }

    /// Look up a registration by the peer socket address it last used.
    pub async fn get_by_address(&self, address: &SocketAddr) -> StoreResult<Option<Registration>> {
        let mut conn = self.kv.acquire().await?;
        let Some(endpoint) = conn.get(&keys::address_key(address)).await? else {
            return Ok(None);
        };
        let Some(data) = conn.get(&keys::endpoint_key_raw(&endpoint)).await? else {
            return Ok(None);
        };
        Ok(codec::decode_registration(&data))
    }

    /// Lazily iterate every registration via the backing store's scan cursor.
    ///
    /// The sequence is finite and not restartable. It tolerates keys removed
    /// mid-scan and may expose the duplicates or skips inherent to
    /// non-snapshot cursor iteration.
    pub fn all(&self) -> RegistrationScan {
        RegistrationScan {
            kv: Arc::clone(&self.kv),
            cursor: 0,
            exhausted: false,
            buffered: VecDeque::new(),
        }
    }

    /// Remove a registration and everything attached to it.
    pub async fn remove(&self, registration_id: &str) -> StoreResult<Option<Deregistration>> {
        self.remove_with(registration_id, false).await
    }

    /// Sweeper variant of [`remove`](Self::remove): only removes the
    /// registration if it is expired once the lock is held, so a racing
    /// fresh update wins.
    pub(crate) async fn remove_if_expired(
        &self,
        registration_id: &str,
    ) -> StoreResult<Option<Deregistration>> {
        self.remove_with(registration_id, true).await
    }

    async fn remove_with(
        &self,
        registration_id: &str,
        only_if_expired: bool,
    ) -> StoreResult<Option<Deregistration>> {
        let mut conn = self.kv.acquire().await?;

        let Some(endpoint) = self.resolve_endpoint(&mut *conn, registration_id).await? else {
            return Ok(None);
        };

        let lock_key = keys::lock_key(&endpoint);
        let token = lock::acquire(&mut *conn, &lock_key, self.config.lock_acquire_timeout).await?;

        let result = self
            .remove_locked(&mut *conn, &endpoint, only_if_expired)
            .await;
        let released = lock::release(&mut *conn, &lock_key, &token).await;

        let deregistration = result?;
        released?;
        Ok(deregistration)
    }

    async fn remove_locked(
        &self,
        conn: &mut dyn KvConnection,
        endpoint: &str,
        only_if_expired: bool,
    ) -> StoreResult<Option<Deregistration>> {
        let Some(data) = conn.get(&keys::endpoint_key(endpoint)).await? else {
            return Ok(None);
        };
        let Some(registration) = codec::decode_registration(&data) else {
            return Ok(None);
        };

        if only_if_expired && registration.is_alive(self.config.grace_period) {
            return Ok(None);
        }

        if !conn
            .del(&keys::registration_id_key(&registration.id))
            .await?
        {
            // someone else finished the removal first
            return Ok(None);
        }
        conn.del(&keys::endpoint_key(&registration.endpoint)).await?;
        let observations = observation_store::remove_all_for(conn, &registration.id).await?;
        self.remove_address_index(conn, &registration).await?;
        conn.zrem(keys::EXP_EP, registration.endpoint.as_bytes())
            .await?;

        Ok(Some(Deregistration {
            registration,
            observations,
        }))
    }

    async fn resolve_endpoint(
        &self,
        conn: &mut dyn KvConnection,
        registration_id: &str,
    ) -> StoreResult<Option<String>> {
        let Some(bytes) = conn.get(&keys::registration_id_key(registration_id)).await? else {
            return Ok(None);
        };
        Ok(keys::endpoint_from_bytes(bytes))
    }

    /// Delete the address index entry of `registration`, but only while it
    /// still names that endpoint. Another endpoint may have taken the
    /// binding since; the newest binding must not be undone.
    async fn remove_address_index(
        &self,
        conn: &mut dyn KvConnection,
        registration: &Registration,
    ) -> StoreResult<()> {
        let address_key = keys::address_key(&registration.address);
        let current = conn.get(&address_key).await?;
        if current.as_deref() == Some(registration.endpoint.as_bytes()) {
            conn.del(&address_key).await?;
        }
        Ok(())
    }

    async fn upsert_expiration(
        &self,
        conn: &mut dyn KvConnection,
        registration: &Registration,
    ) -> StoreResult<()> {
        conn.zadd(
            keys::EXP_EP,
            registration.endpoint.as_bytes(),
            registration.expiration_timestamp(self.config.grace_period) as f64,
        )
        .await
    }
}

/// Pull iterator over every stored registration.
///
/// Scans the primary keyspace in pages of 100 keys, resolving each page with
/// a single multi-get. `next` distinguishes end of iteration (`Ok(None)`)
/// from backend failure.
pub struct RegistrationScan {
    kv: Arc<dyn KvBackend>,
    cursor: u64,
    exhausted: bool,
    buffered: VecDeque<Registration>,
}

const SCAN_PAGE: usize = 100;

impl RegistrationScan {
    pub async fn next(&mut self) -> StoreResult<Option<Registration>> {
        loop {
            if let Some(registration) = self.buffered.pop_front() {
                return Ok(Some(registration));
            }
            if self.exhausted {
                return Ok(None);
            }
            self.fill().await?;
        }
    }

    /// Drain the remainder of the scan into a vector.
    pub async fn collect(mut self) -> StoreResult<Vec<Registration>> {
        let mut registrations = Vec::new();
        while let Some(registration) = self.next().await? {
            registrations.push(registration);
        }
        Ok(registrations)
    }

    async fn fill(&mut self) -> StoreResult<()> {
        let mut conn = self.kv.acquire().await?;
        let pattern = keys::registration_scan_pattern();

        // keep scanning until a page yields records or the cursor completes;
        // rows deleted mid-scan or failing to decode are skipped
        loop {
            let (next, page) = conn.scan(self.cursor, &pattern, SCAN_PAGE).await?;
            if !page.is_empty() {
                for data in conn.mget(&page).await?.into_iter().flatten() {
                    if let Some(registration) = codec::decode_registration(&data) {
                        self.buffered.push_back(registration);
                    }
                }
            }
            self.cursor = next;
            if next == 0 {
                self.exhausted = true;
                return Ok(());
            }
            if !self.buffered.is_empty() {
                return Ok(());
            }
        }
    }
}
