// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Error types for store operations.
//!
//! Absent records are `Option::None`, never an error. Everything that can
//! actually fail an operation is a `StoreError`.

use std::fmt;

/// Errors raised by store operations.
#[derive(Debug)]
pub enum StoreError {
    /// An observation operation referenced a registration id with no live
    /// id-index entry.
    NoSuchRegistration { registration_id: String },

    /// The per-endpoint lock could not be acquired within the retry budget.
    LockAcquisition { key: String },

    /// Transport or server-side failure from the backing key/value service.
    Backend { message: String },

    /// Serialization produced or met malformed data on a write path.
    /// Read paths log and treat malformed rows as absent instead.
    Codec {
        context: &'static str,
        message: String,
    },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSuchRegistration { registration_id } => {
                write!(f, "no registration for id {}", registration_id)
            }
            Self::LockAcquisition { key } => {
                write!(f, "could not acquire peer lock {}", key)
            }
            Self::Backend { message } => {
                write!(f, "backing store failure: {}", message)
            }
            Self::Codec { context, message } => {
                write!(f, "codec failure in {}: {}", context, message)
            }
        }
    }
}

impl std::error::Error for StoreError {}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    /// Wrap a backend transport/server error.
    pub(crate) fn backend(err: impl fmt::Display) -> Self {
        Self::Backend {
            message: err.to_string(),
        }
    }
}
