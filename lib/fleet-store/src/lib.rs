// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Distributed registration and observation store for a lightweight
//! device-management server.
//!
//! The store is the authoritative record of which devices are currently
//! registered and which long-lived observe subscriptions the server holds
//! toward them. It is backed by a Redis-shaped key/value service shared by
//! every server instance managing the same fleet: registrations are kept
//! under three secondary indexes plus an expiration queue, per-endpoint
//! mutations are serialized across processes by an advisory lock, and a
//! background sweeper evicts registrations whose lifetime has lapsed.
//!
//! # Wiring
//!
//! ```ignore
//! let backend: Arc<dyn KvBackend> = Arc::new(RedisBackend::new("redis://cache:6379")?);
//! let config = StoreConfig::from_env();
//!
//! let registrations = RegistrationStore::new(Arc::clone(&backend), config.clone());
//! let observations = ObservationStore::new(backend, config);
//!
//! let sweeper = ExpirationSweeper::new(registrations.clone(), listener);
//! sweeper.start();
//! // ...
//! sweeper.stop().await;
//! ```

pub mod config;
pub mod error;
pub mod kv;
pub mod observation;
pub mod observation_store;
pub mod registration;
pub mod registration_store;
pub mod sweeper;

mod codec;
mod keys;
mod lock;

// Configuration & errors
pub use config::StoreConfig;
pub use error::{StoreError, StoreResult};

// Data model
pub use observation::{Observation, ObservationRecord, ResourcePath, Token};
pub use registration::{Deregistration, Registration, RegistrationUpdate, UpdatedRegistration};

// Stores
pub use observation_store::ObservationStore;
pub use registration_store::{RegistrationScan, RegistrationStore};

// Backing service
pub use kv::memory::MemoryBackend;
pub use kv::redis::RedisBackend;
pub use kv::{KvBackend, KvConnection};

// Expiration
pub use sweeper::{ExpirationListener, ExpirationSweeper, SweeperStats};
