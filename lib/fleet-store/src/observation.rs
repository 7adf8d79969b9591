// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Observation records, tokens, and resource paths.
//!
//! The store keeps only the transport form ([`ObservationRecord`]); the
//! domain form ([`Observation`]) is a projection derived on read via
//! [`ObservationRecord::build`].

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Opaque request/response correlation token, unique across the server.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Token(Bytes);

impl Token {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&[u8]> for Token {
    fn from(bytes: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(bytes))
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({})", self)
    }
}

/// An object/instance/resource tuple, e.g. `/3/0/1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourcePath {
    pub object_id: u16,
    pub instance_id: Option<u16>,
    pub resource_id: Option<u16>,
}

impl ResourcePath {
    pub fn object(object_id: u16) -> Self {
        Self {
            object_id,
            instance_id: None,
            resource_id: None,
        }
    }

    pub fn instance(object_id: u16, instance_id: u16) -> Self {
        Self {
            object_id,
            instance_id: Some(instance_id),
            resource_id: None,
        }
    }

    pub fn resource(object_id: u16, instance_id: u16, resource_id: u16) -> Self {
        Self {
            object_id,
            instance_id: Some(instance_id),
            resource_id: Some(resource_id),
        }
    }

    /// Parse a `/3/0/1`-style path. A resource id requires an instance id.
    pub fn parse(text: &str) -> Option<Self> {
        let mut segments = text.strip_prefix('/').unwrap_or(text).split('/');
        let object_id = segments.next()?.parse().ok()?;
        let instance_id = match segments.next() {
            Some(s) => Some(s.parse().ok()?),
            None => None,
        };
        let resource_id = match segments.next() {
            Some(s) => Some(s.parse().ok()?),
            None => None,
        };
        if segments.next().is_some() {
            return None;
        }
        Some(Self {
            object_id,
            instance_id,
            resource_id,
        })
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.object_id)?;
        if let Some(instance_id) = self.instance_id {
            write!(f, "/{}", instance_id)?;
        }
        if let Some(resource_id) = self.resource_id {
            write!(f, "/{}", resource_id)?;
        }
        Ok(())
    }
}

/// Transport-layer observation record, stored verbatim keyed by token.
///
/// `payload` carries the serialized protocol request and content format;
/// `context` carries the transport correlation attributes of the peer. The
/// store interprets neither beyond `registration_id` and `endpoint`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservationRecord {
    pub token: Token,
    pub registration_id: String,
    pub endpoint: String,
    pub path: ResourcePath,
    pub payload: Bytes,
    pub context: BTreeMap<String, String>,
}

impl ObservationRecord {
    /// Project the domain form served to the protocol layer.
    pub fn build(&self) -> Observation {
        Observation {
            token: self.token.clone(),
            registration_id: self.registration_id.clone(),
            path: self.path,
            context: self.context.clone(),
        }
    }
}

/// A long-lived subscription to a resource path on a device, as seen by the
/// protocol layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub token: Token,
    pub registration_id: String,
    pub path: ResourcePath,
    pub context: BTreeMap<String, String>,
}
