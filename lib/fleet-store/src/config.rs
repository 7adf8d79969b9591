// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Store configuration.

use std::time::Duration;

/// Configuration shared by the stores and the expiration sweeper.
///
/// # Example
/// ```ignore
/// let config = StoreConfig::default()
///     .with_clean_period(Duration::from_secs(30))
///     .with_grace_period(Duration::from_secs(5));
/// ```
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Time between two expiration sweeps.
    ///
    /// Larger values tolerate stale rows longer but put less load on the
    /// backing store. Default: 60 seconds.
    pub clean_period: Duration,

    /// Maximum number of endpoints processed per sweep tick.
    ///
    /// Caps worst-case sweep latency so a backlog accumulated during
    /// downtime cannot monopolize the shared backing store. Default: 500.
    pub clean_limit: usize,

    /// Extra time added to every registration lifetime, for both the
    /// expiration-queue score and liveness checks.
    ///
    /// Forgiveness for late updates at the cost of delayed eviction.
    /// Default: 0 seconds.
    pub grace_period: Duration,

    /// TTL of the per-endpoint lock entry.
    ///
    /// Serves as the deadlock backstop if a holder dies between acquire and
    /// release. Must be at least 500 ms. Default: 500 ms.
    pub lock_acquire_timeout: Duration,

    /// Diagnostic name for the sweeper task, used in log output only.
    pub scheduler_thread_name: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            clean_period: Duration::from_secs(60),
            clean_limit: 500,
            grace_period: Duration::ZERO,
            lock_acquire_timeout: Duration::from_millis(500),
            scheduler_thread_name: "fleet-store-sweeper".to_string(),
        }
    }
}

impl StoreConfig {
    /// Create config from environment variables.
    ///
    /// Environment variables:
    /// - `FLEET_STORE_CLEAN_PERIOD_SECS`: Seconds between sweeps (default: 60)
    /// - `FLEET_STORE_CLEAN_LIMIT`: Max endpoints per sweep (default: 500)
    /// - `FLEET_STORE_GRACE_PERIOD_SECS`: Lifetime grace in seconds (default: 0)
    /// - `FLEET_STORE_LOCK_TIMEOUT_MS`: Peer lock TTL in ms (default: 500)
    /// - `FLEET_STORE_SWEEPER_NAME`: Sweeper task name
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            clean_period: Duration::from_secs(
                std::env::var("FLEET_STORE_CLEAN_PERIOD_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(60),
            ),
            clean_limit: std::env::var("FLEET_STORE_CLEAN_LIMIT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(500),
            grace_period: Duration::from_secs(
                std::env::var("FLEET_STORE_GRACE_PERIOD_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0),
            ),
            lock_acquire_timeout: Duration::from_millis(
                std::env::var("FLEET_STORE_LOCK_TIMEOUT_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(500),
            )
            .max(Duration::from_millis(500)),
            scheduler_thread_name: std::env::var("FLEET_STORE_SWEEPER_NAME")
                .unwrap_or(defaults.scheduler_thread_name),
        }
    }

    /// Set the sweep cadence.
    pub fn with_clean_period(mut self, period: Duration) -> Self {
        self.clean_period = period;
        self
    }

    /// Set the per-sweep endpoint limit.
    pub fn with_clean_limit(mut self, limit: usize) -> Self {
        self.clean_limit = limit;
        self
    }

    /// Set the lifetime grace period.
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Set the peer lock TTL. Values under 500 ms are clamped up.
    pub fn with_lock_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.lock_acquire_timeout = timeout.max(Duration::from_millis(500));
        self
    }

    /// Set the diagnostic sweeper task name.
    pub fn with_scheduler_thread_name(mut self, name: impl Into<String>) -> Self {
        self.scheduler_thread_name = name.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.clean_period, Duration::from_secs(60));
        assert_eq!(config.clean_limit, 500);
        assert_eq!(config.grace_period, Duration::ZERO);
        assert_eq!(config.lock_acquire_timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_builder() {
        let config = StoreConfig::default()
            .with_clean_period(Duration::from_secs(5))
            .with_clean_limit(10)
            .with_grace_period(Duration::from_secs(2))
            .with_scheduler_thread_name("test-sweeper");

        assert_eq!(config.clean_period, Duration::from_secs(5));
        assert_eq!(config.clean_limit, 10);
        assert_eq!(config.grace_period, Duration::from_secs(2));
        assert_eq!(config.scheduler_thread_name, "test-sweeper");
    }

    #[test]
    fn test_lock_timeout_clamped() {
        let config = StoreConfig::default().with_lock_acquire_timeout(Duration::from_millis(10));
        assert_eq!(config.lock_acquire_timeout, Duration::from_millis(500));
    }
}
