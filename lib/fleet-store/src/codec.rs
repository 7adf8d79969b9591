// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Opaque serialization of stored records.
//!
//! The wire format is private to this module; the only contract is a
//! byte-for-byte round trip. `decode_*` returns `None` on malformed input
//! (read paths log and treat the row as absent); the `_result` variants
//! raise, for write paths that must not proceed on bad data.

use bincode::config;
use tracing::warn;

use crate::error::{StoreError, StoreResult};
use crate::observation::ObservationRecord;
use crate::registration::Registration;

pub(crate) fn encode_registration(registration: &Registration) -> StoreResult<Vec<u8>> {
    bincode::serde::encode_to_vec(registration, config::standard()).map_err(|e| {
        StoreError::Codec {
            context: "registration encode",
            message: e.to_string(),
        }
    })
}

pub(crate) fn decode_registration(data: &[u8]) -> Option<Registration> {
    match decode_registration_result(data) {
        Ok(registration) => Some(registration),
        Err(e) => {
            warn!(error = %e, "Skipping malformed registration record");
            None
        }
    }
}

pub(crate) fn decode_registration_result(data: &[u8]) -> StoreResult<Registration> {
    bincode::serde::decode_from_slice(data, config::standard())
        .map(|(registration, _)| registration)
        .map_err(|e| StoreError::Codec {
            context: "registration decode",
            message: e.to_string(),
        })
}

pub(crate) fn encode_observation(record: &ObservationRecord) -> StoreResult<Vec<u8>> {
    bincode::serde::encode_to_vec(record, config::standard()).map_err(|e| StoreError::Codec {
        context: "observation encode",
        message: e.to_string(),
    })
}

pub(crate) fn decode_observation(data: &[u8]) -> Option<ObservationRecord> {
    match decode_observation_result(data) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!(error = %e, "Skipping malformed observation record");
            None
        }
    }
}

pub(crate) fn decode_observation_result(data: &[u8]) -> StoreResult<ObservationRecord> {
    bincode::serde::decode_from_slice(data, config::standard())
        .map(|(record, _)| record)
        .map_err(|e| StoreError::Codec {
            context: "observation decode",
            message: e.to_string(),
        })
}
