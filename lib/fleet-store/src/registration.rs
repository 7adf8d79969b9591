// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Registration records and the value objects returned by mutations.

use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::observation::Observation;

/// Current wall-clock time in milliseconds since the epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A device that has announced itself to the server.
///
/// The endpoint name is the client-chosen identity and the primary key; the
/// registration id is server-assigned and unique per registration session.
/// The payload (object links, attributes, protocol version) is opaque to the
/// store and round-trips verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub id: String,
    pub endpoint: String,
    #[serde(with = "addr_text")]
    pub address: SocketAddr,
    /// Milliseconds since the epoch.
    pub registered_at: u64,
    pub lifetime: Duration,
    /// Milliseconds since the epoch.
    pub last_update: u64,
    pub payload: Bytes,
}

impl Registration {
    /// Create a registration stamped with the current time.
    pub fn new(
        id: impl Into<String>,
        endpoint: impl Into<String>,
        address: SocketAddr,
        lifetime: Duration,
        payload: Bytes,
    ) -> Self {
        let now = now_ms();
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            address,
            registered_at: now,
            lifetime,
            last_update: now,
            payload,
        }
    }

    /// The instant (ms since epoch) past which this registration is gone,
    /// lifetime and grace included.
    pub fn expiration_timestamp(&self, grace: Duration) -> u64 {
        self.last_update + self.lifetime.as_millis() as u64 + grace.as_millis() as u64
    }

    /// Whether the registration is still within its lifetime plus grace.
    pub fn is_alive(&self, grace: Duration) -> bool {
        now_ms() <= self.expiration_timestamp(grace)
    }
}

/// Patch applied to an existing registration by an update request.
///
/// Unset fields keep the current value. Applying an update always refreshes
/// the last-update timestamp.
#[derive(Debug, Clone, Default)]
pub struct RegistrationUpdate {
    pub registration_id: String,
    pub address: Option<SocketAddr>,
    pub lifetime: Option<Duration>,
    pub payload: Option<Bytes>,
}

impl RegistrationUpdate {
    pub fn new(registration_id: impl Into<String>) -> Self {
        Self {
            registration_id: registration_id.into(),
            ..Default::default()
        }
    }

    pub fn with_address(mut self, address: SocketAddr) -> Self {
        self.address = Some(address);
        self
    }

    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = Some(lifetime);
        self
    }

    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Produce the updated registration from the current one.
    pub fn apply(&self, current: &Registration) -> Registration {
        Registration {
            id: current.id.clone(),
            endpoint: current.endpoint.clone(),
            address: self.address.unwrap_or(current.address),
            registered_at: current.registered_at,
            lifetime: self.lifetime.unwrap_or(current.lifetime),
            last_update: now_ms(),
            payload: self.payload.clone().unwrap_or_else(|| current.payload.clone()),
        }
    }
}

/// A removed registration together with the observations removed with it.
#[derive(Debug, Clone)]
pub struct Deregistration {
    pub registration: Registration,
    pub observations: Vec<Observation>,
}

/// The prior and new records produced by an update.
#[derive(Debug, Clone)]
pub struct UpdatedRegistration {
    pub previous: Registration,
    pub updated: Registration,
}

/// Socket addresses serialize through their textual form so that IPv6 scope
/// ids survive the round trip.
mod addr_text {
    use std::net::SocketAddr;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SocketAddr, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}
