// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Background eviction of expired registrations.
//!
//! A single task wakes every `clean_period`, pulls at most `clean_limit`
//! endpoints whose expiration score has passed, and removes each one that is
//! still expired once its peer lock is held (a racing fresh update wins).
//! Each eviction is delivered to the listener. A tick never overlaps its
//! successor, and any error inside a tick is logged and swallowed so the
//! next tick runs regardless.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::StoreResult;
use crate::keys;
use crate::observation::Observation;
use crate::registration::{now_ms, Registration};
use crate::registration_store::RegistrationStore;

/// How long `stop` waits for an in-flight tick before giving up.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Receives each registration the sweeper evicts.
///
/// Errors are logged and swallowed; they abort neither the tick nor the
/// sweeper.
#[async_trait]
pub trait ExpirationListener: Send + Sync {
    async fn registration_expired(
        &self,
        registration: Registration,
        observations: Vec<Observation>,
    ) -> anyhow::Result<()>;
}

/// Counters of sweeper activity.
#[derive(Debug, Clone, Default)]
pub struct SweeperStats {
    /// Completed ticks.
    pub ticks: u64,
    /// Registrations evicted.
    pub expired: u64,
    /// Ticks that failed with a backend error.
    pub errors: u64,
}

#[derive(Default)]
struct SweeperState {
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

/// Periodic task evicting expired registrations.
///
/// Created stopped. `start` and `stop` are idempotent; dropping the sweeper
/// cancels the task.
pub struct ExpirationSweeper {
    store: RegistrationStore,
    listener: Arc<dyn ExpirationListener>,
    stats: Arc<RwLock<SweeperStats>>,
    state: Mutex<SweeperState>,
}

impl ExpirationSweeper {
    pub fn new(store: RegistrationStore, listener: Arc<dyn ExpirationListener>) -> Self {
        Self {
            store,
            listener,
            stats: Arc::new(RwLock::new(SweeperStats::default())),
            state: Mutex::new(SweeperState::default()),
        }
    }

    /// Start the periodic sweep. No-op when already running.
    pub fn start(&self) {
        let mut state = self.state.lock();
        if state.task.is_some() {
            return;
        }

        let config = self.store.config().clone();
        info!(
            task = %config.scheduler_thread_name,
            period_secs = config.clean_period.as_secs(),
            limit = config.clean_limit,
            "Starting expiration sweeper"
        );

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_loop(
            self.store.clone(),
            Arc::clone(&self.listener),
            Arc::clone(&self.stats),
            cancel.clone(),
            config.scheduler_thread_name,
        ));
        state.cancel = Some(cancel);
        state.task = Some(task);
    }

    /// Request termination and wait up to five seconds for the in-flight
    /// tick. No-op when already stopped; on timeout the task is considered
    /// orphaned and logged.
    pub async fn stop(&self) {
        let (cancel, task) = {
            let mut state = self.state.lock();
            (state.cancel.take(), state.task.take())
        };
        let Some(task) = task else {
            return;
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if tokio::time::timeout(STOP_TIMEOUT, task).await.is_err() {
            warn!("Expiration sweeper did not stop in time; leaving it orphaned");
        }
    }

    /// Run a single sweep immediately, outside the schedule.
    pub async fn run_once(&self) -> StoreResult<usize> {
        sweep_once(&self.store, &self.listener, &self.stats).await
    }

    /// Current counters.
    pub fn stats(&self) -> SweeperStats {
        self.stats.read().clone()
    }
}

impl Drop for ExpirationSweeper {
    fn drop(&mut self) {
        if let Some(cancel) = self.state.lock().cancel.take() {
            cancel.cancel();
        }
    }
}

async fn run_loop(
    store: RegistrationStore,
    listener: Arc<dyn ExpirationListener>,
    stats: Arc<RwLock<SweeperStats>>,
    cancel: CancellationToken,
    task_name: String,
) {
    let period = store.config().clean_period;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(task = %task_name, "Expiration sweeper shutting down");
                break;
            }
            _ = ticker.tick() => {
                match sweep_once(&store, &listener, &stats).await {
                    Ok(expired) if expired > 0 => {
                        debug!(expired, "Evicted expired registrations");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "Unexpected error while sweeping registrations");
                        stats.write().errors += 1;
                    }
                }
            }
        }
    }
}

async fn sweep_once(
    store: &RegistrationStore,
    listener: &Arc<dyn ExpirationListener>,
    stats: &Arc<RwLock<SweeperStats>>,
) -> StoreResult<usize> {
    let config = store.config();

    let due = {
        let mut conn = store.backend().acquire().await?;
        conn.zrangebyscore(keys::EXP_EP, now_ms() as f64, config.clean_limit)
            .await?
    };

    let mut expired = 0;
    for endpoint in due {
        let Some(endpoint) = keys::endpoint_from_bytes(endpoint) else {
            continue;
        };
        let Some(registration) = store.get_by_endpoint(&endpoint).await? else {
            continue;
        };
        if registration.is_alive(config.grace_period) {
            continue;
        }
        if let Some(deregistration) = store.remove_if_expired(&registration.id).await? {
            expired += 1;
            if let Err(e) = listener
                .registration_expired(deregistration.registration, deregistration.observations)
                .await
            {
                warn!(error = %e, endpoint = %endpoint, "Expiration listener failed");
            }
        }
    }

    let mut counters = stats.write();
    counters.ticks += 1;
    counters.expired += expired as u64;
    Ok(expired)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::config::StoreConfig;
    use crate::kv::memory::MemoryBackend;
    use crate::registration::RegistrationUpdate;

    #[derive(Default)]
    struct RecordingListener {
        expired: Mutex<Vec<(String, usize)>>,
    }

    #[async_trait]
    impl ExpirationListener for RecordingListener {
        async fn registration_expired(
            &self,
            registration: Registration,
            observations: Vec<Observation>,
        ) -> anyhow::Result<()> {
            self.expired
                .lock()
                .push((registration.endpoint, observations.len()));
            Ok(())
        }
    }

    struct FailingListener;

    #[async_trait]
    impl ExpirationListener for FailingListener {
        async fn registration_expired(
            &self,
            _registration: Registration,
            _observations: Vec<Observation>,
        ) -> anyhow::Result<()> {
            anyhow::bail!("listener exploded")
        }
    }

    fn store(config: StoreConfig) -> RegistrationStore {
        RegistrationStore::new(Arc::new(MemoryBackend::new()), config)
    }

    fn short_lived(id: &str, endpoint: &str) -> Registration {
        Registration::new(
            id,
            endpoint,
            "10.0.0.1:5683".parse().unwrap(),
            Duration::ZERO,
            Bytes::new(),
        )
    }

    #[tokio::test]
    async fn test_run_once_evicts_expired() {
        let store = store(StoreConfig::default());
        store.add(&short_lived("reg-1", "dev-B")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let listener = Arc::new(RecordingListener::default());
        let sweeper = ExpirationSweeper::new(store.clone(), listener.clone());

        assert_eq!(sweeper.run_once().await.unwrap(), 1);
        assert_eq!(listener.expired.lock().as_slice(), &[("dev-B".to_string(), 0)]);
        assert!(store.get("reg-1").await.unwrap().is_none());

        let stats = sweeper.stats();
        assert_eq!(stats.ticks, 1);
        assert_eq!(stats.expired, 1);
    }

    #[tokio::test]
    async fn test_refreshed_registration_survives() {
        let store = store(StoreConfig::default());
        store.add(&short_lived("reg-1", "dev-B")).await.unwrap();
        store
            .update(&RegistrationUpdate::new("reg-1").with_lifetime(Duration::from_secs(60)))
            .await
            .unwrap()
            .unwrap();

        let listener = Arc::new(RecordingListener::default());
        let sweeper = ExpirationSweeper::new(store.clone(), listener.clone());

        assert_eq!(sweeper.run_once().await.unwrap(), 0);
        assert!(listener.expired.lock().is_empty());
        assert!(store.get("reg-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_clean_limit_bounds_a_tick() {
        let store = store(StoreConfig::default().with_clean_limit(3));
        for i in 0..8 {
            store
                .add(&short_lived(&format!("reg-{}", i), &format!("dev-{}", i)))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(5)).await;

        let listener = Arc::new(RecordingListener::default());
        let sweeper = ExpirationSweeper::new(store, listener);

        assert_eq!(sweeper.run_once().await.unwrap(), 3);
        assert_eq!(sweeper.run_once().await.unwrap(), 3);
        assert_eq!(sweeper.run_once().await.unwrap(), 2);
        assert_eq!(sweeper.stats().expired, 8);
    }

    #[tokio::test]
    async fn test_listener_failure_does_not_abort_tick() {
        let store = store(StoreConfig::default());
        store.add(&short_lived("reg-1", "dev-A")).await.unwrap();
        store.add(&short_lived("reg-2", "dev-B")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let sweeper = ExpirationSweeper::new(store.clone(), Arc::new(FailingListener));
        assert_eq!(sweeper.run_once().await.unwrap(), 2);
        assert!(store.get("reg-1").await.unwrap().is_none());
        assert!(store.get("reg-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_scheduled_sweep_and_idempotent_lifecycle() {
        let config = StoreConfig::default().with_clean_period(Duration::from_millis(50));
        let store = store(config);
        store.add(&short_lived("reg-1", "dev-B")).await.unwrap();

        let listener = Arc::new(RecordingListener::default());
        let sweeper = ExpirationSweeper::new(store.clone(), listener.clone());

        sweeper.start();
        sweeper.start(); // idempotent

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(listener.expired.lock().as_slice(), &[("dev-B".to_string(), 0)]);
        assert!(store.get("reg-1").await.unwrap().is_none());

        sweeper.stop().await;
        sweeper.stop().await; // idempotent

        // no further ticks after stop
        let ticks = sweeper.stats().ticks;
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(sweeper.stats().ticks, ticks);
    }
}
